//! Per-folder shared secrets.
//!
//! A folder's bulk content is encrypted with one symmetric key. That key is
//! sealed separately for every member, so membership changes only re-seal
//! the 32 byte key instead of re-encrypting content.

use crate::crypto::{CryptoKeySet, CryptoService, EncryptedValue, SymmetricKey};
use crate::error::AccessError;
use crate::types::CryptoKeySetId;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedSecret {
    pub id: String,
    pub secret_keys_encrypted_per_member: BTreeMap<CryptoKeySetId, EncryptedValue>,
}

/// Generate a fresh key and seal it for every member.
///
/// All or nothing: if sealing fails for any member, no secret is returned.
pub fn generate_shared_secret(
    crypto: &CryptoService,
    member_ids: &[CryptoKeySetId],
) -> Result<(SharedSecret, SymmetricKey), AccessError> {
    let key = SymmetricKey::generate();
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    let secret = seal_for_members(crypto, hex::encode(id), &key, member_ids)?;
    Ok((secret, key))
}

fn seal_for_members(
    crypto: &CryptoService,
    id: String,
    key: &SymmetricKey,
    member_ids: &[CryptoKeySetId],
) -> Result<SharedSecret, AccessError> {
    let secret_keys_encrypted_per_member = member_ids
        .iter()
        .map(|member| {
            crypto
                .seal_for(member, key.as_bytes())
                .map(|sealed| (member.clone(), sealed))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(SharedSecret {
        id,
        secret_keys_encrypted_per_member,
    })
}

impl SharedSecret {
    /// Recover the symmetric key with a member's private keys.
    pub fn decrypt_for(&self, keys: &CryptoKeySet) -> Result<SymmetricKey, AccessError> {
        let sealed = self
            .secret_keys_encrypted_per_member
            .get(keys.id())
            .ok_or_else(|| {
                AccessError::Unauthorized(format!("{} is not a member of secret {}", keys.id(), self.id))
            })?;
        Ok(SymmetricKey::from_bytes(&keys.open(sealed)?)?)
    }

    /// Re-seal the same key for a new member set. The secret keeps its ID.
    pub fn redistribute(
        &self,
        crypto: &CryptoService,
        key: &SymmetricKey,
        member_ids: &[CryptoKeySetId],
    ) -> Result<SharedSecret, AccessError> {
        seal_for_members(crypto, self.id.clone(), key, member_ids)
    }

    pub fn members(&self) -> impl Iterator<Item = &CryptoKeySetId> {
        self.secret_keys_encrypted_per_member.keys()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AccessError> {
        serde_json::to_vec(self).map_err(|e| AccessError::Untrusted(format!("encode shared secret: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AccessError> {
        serde_json::from_slice(bytes)
            .map_err(|e| AccessError::Untrusted(format!("malformed shared secret: {}", e)))
    }
}
