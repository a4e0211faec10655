//! Crypto service: this replica's key set plus a directory of known public keys.

use crate::crypto::{CryptoKeySet, EncryptedValue, PublicKeySet, Signature};
use crate::error::CryptoError;
use crate::types::CryptoKeySetId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub struct CryptoService {
    keys: Arc<CryptoKeySet>,
    directory: RwLock<HashMap<CryptoKeySetId, PublicKeySet>>,
}

impl CryptoService {
    pub fn new(keys: Arc<CryptoKeySet>) -> Self {
        let mut directory = HashMap::new();
        directory.insert(keys.id().clone(), keys.public_keys().clone());
        Self {
            keys,
            directory: RwLock::new(directory),
        }
    }

    pub fn keys(&self) -> &Arc<CryptoKeySet> {
        &self.keys
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keys.sign(message)
    }

    /// Add a public key set to the directory after checking its ID.
    pub fn remember(&self, public_keys: PublicKeySet) -> Result<(), CryptoError> {
        public_keys.validate()?;
        self.directory
            .write()
            .insert(public_keys.id.clone(), public_keys);
        Ok(())
    }

    pub fn public_keys_for(&self, id: &CryptoKeySetId) -> Option<PublicKeySet> {
        self.directory.read().get(id).cloned()
    }

    pub fn verify(
        &self,
        signer: &CryptoKeySetId,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        let public_keys = self
            .public_keys_for(signer)
            .ok_or_else(|| CryptoError::InvalidKey(format!("unknown key set {}", signer)))?;
        public_keys.verify(message, signature)
    }

    /// Seal `plaintext` for a known key set.
    pub fn seal_for(
        &self,
        recipient: &CryptoKeySetId,
        plaintext: &[u8],
    ) -> Result<EncryptedValue, CryptoError> {
        let public_keys = self
            .public_keys_for(recipient)
            .ok_or_else(|| CryptoError::InvalidKey(format!("unknown key set {}", recipient)))?;
        public_keys.seal(plaintext)
    }

    pub fn open(&self, sealed: &EncryptedValue) -> Result<Vec<u8>, CryptoError> {
        self.keys.open(sealed)
    }
}
