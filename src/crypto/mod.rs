//! Key sets, signatures and sealed values.
//!
//! A key set pairs an Ed25519 signing key with an X25519 encryption key. Its
//! [`CryptoKeySetId`] is derived from both public halves, so a public key set
//! is self-certifying.
//!
//! Sealed values use an ephemeral X25519 exchange with the recipient and
//! ChaCha20-Poly1305 for the payload. Wire format of the ciphertext is
//! `ciphertext || auth_tag(16)` with the 12 byte nonce stored alongside.

pub mod service;

pub use service::CryptoService;

use crate::error::CryptoError;
use crate::types::CryptoKeySetId;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

const SEAL_CONTEXT: &[u8] = b"syncable-store/seal/v1";

/// Serde helper storing byte vectors as lowercase hex strings.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        hex::decode(value).map_err(serde::de::Error::custom)
    }
}

/// Serde helper for optional byte vectors.
pub mod opt_hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let value = Option::<String>::deserialize(deserializer)?;
        value
            .map(|hex_value| hex::decode(hex_value).map_err(serde::de::Error::custom))
            .transpose()
    }
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn to_array<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{} must be {} bytes", what, N)))
}

/// Detached Ed25519 signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "hex_bytes")] Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(&self.0);
        write!(f, "Signature({})", &hex[..hex.len().min(16)])
    }
}

/// Public half of a key set.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeySet {
    pub id: CryptoKeySetId,
    #[serde(with = "hex_bytes")]
    signing_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    encryption_key: Vec<u8>,
}

impl fmt::Debug for PublicKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeySet({})", self.id)
    }
}

fn derive_key_set_id(signing_key: &[u8], encryption_key: &[u8]) -> CryptoKeySetId {
    let mut hasher = Sha256::new();
    hasher.update(b"syncable-store/key-set/v1");
    hasher.update(signing_key);
    hasher.update(encryption_key);
    CryptoKeySetId::from_digest(&hasher.finalize())
}

impl PublicKeySet {
    /// Rebuild from raw public keys, deriving the ID.
    pub fn from_keys(signing_key: [u8; 32], encryption_key: [u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(&signing_key)
            .map_err(|e| CryptoError::InvalidKey(format!("signing key: {}", e)))?;
        Ok(Self {
            id: derive_key_set_id(&signing_key, &encryption_key),
            signing_key: signing_key.to_vec(),
            encryption_key: encryption_key.to_vec(),
        })
    }

    /// Check that the ID matches the key material (received key sets are untrusted).
    pub fn validate(&self) -> Result<(), CryptoError> {
        if derive_key_set_id(&self.signing_key, &self.encryption_key) != self.id {
            return Err(CryptoError::InvalidKey(format!(
                "key set id {} does not match its keys",
                self.id
            )));
        }
        Ok(())
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.validate()?;
        let key = VerifyingKey::from_bytes(&to_array::<32>(&self.signing_key, "signing key")?)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let signature = ed25519_dalek::Signature::from_slice(signature.as_bytes())
            .map_err(|_| CryptoError::BadSignature)?;
        key.verify(message, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }

    /// Encrypt `plaintext` so that only the holder of this key set can open it.
    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedValue, CryptoError> {
        let recipient =
            X25519PublicKey::from(to_array::<32>(&self.encryption_key, "encryption key")?);
        let ephemeral = StaticSecret::from(random_bytes::<32>());
        let ephemeral_public = X25519PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&recipient);

        let key = seal_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes());
        let nonce = random_bytes::<12>();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        Ok(EncryptedValue {
            recipient: self.id.clone(),
            ephemeral_public_key: ephemeral_public.as_bytes().to_vec(),
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }
}

fn seal_key(shared: &[u8; 32], ephemeral_public: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SEAL_CONTEXT);
    hasher.update(shared);
    hasher.update(ephemeral_public);
    hasher.update(recipient);
    hasher.finalize().into()
}

/// Value sealed for one recipient key set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    pub recipient: CryptoKeySetId,
    #[serde(with = "hex_bytes")]
    ephemeral_public_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    ciphertext: Vec<u8>,
}

/// Private key set: Ed25519 signing key plus X25519 encryption secret.
pub struct CryptoKeySet {
    signing: SigningKey,
    encryption: StaticSecret,
    public: PublicKeySet,
}

impl fmt::Debug for CryptoKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoKeySet({})", self.public.id)
    }
}

/// Serialized private key material.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredKeySet {
    #[serde(with = "hex_bytes")]
    pub signing_secret: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub encryption_secret: Vec<u8>,
}

impl CryptoKeySet {
    pub fn generate() -> Self {
        Self::from_secrets(random_bytes::<32>(), random_bytes::<32>())
    }

    pub fn from_secrets(signing_secret: [u8; 32], encryption_secret: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&signing_secret);
        let encryption = StaticSecret::from(encryption_secret);
        let signing_public = signing.verifying_key().to_bytes();
        let encryption_public = *X25519PublicKey::from(&encryption).as_bytes();
        let public = PublicKeySet {
            id: derive_key_set_id(&signing_public, &encryption_public),
            signing_key: signing_public.to_vec(),
            encryption_key: encryption_public.to_vec(),
        };
        Self {
            signing,
            encryption,
            public,
        }
    }

    pub fn from_stored(stored: &StoredKeySet) -> Result<Self, CryptoError> {
        Ok(Self::from_secrets(
            to_array::<32>(&stored.signing_secret, "signing secret")?,
            to_array::<32>(&stored.encryption_secret, "encryption secret")?,
        ))
    }

    pub fn to_stored(&self) -> StoredKeySet {
        StoredKeySet {
            signing_secret: self.signing.to_bytes().to_vec(),
            encryption_secret: self.encryption.to_bytes().to_vec(),
        }
    }

    pub fn id(&self) -> &CryptoKeySetId {
        &self.public.id
    }

    pub fn public_keys(&self) -> &PublicKeySet {
        &self.public
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes().to_vec())
    }

    /// Open a value sealed for this key set.
    pub fn open(&self, sealed: &EncryptedValue) -> Result<Vec<u8>, CryptoError> {
        if sealed.recipient != self.public.id {
            return Err(CryptoError::DecryptionFailed);
        }
        let ephemeral_public =
            X25519PublicKey::from(to_array::<32>(&sealed.ephemeral_public_key, "ephemeral key")?);
        let shared = self.encryption.diffie_hellman(&ephemeral_public);
        let own_public = to_array::<32>(&self.public.encryption_key, "encryption key")?;
        let key = seal_key(shared.as_bytes(), ephemeral_public.as_bytes(), &own_public);
        let nonce = to_array::<12>(&sealed.nonce, "nonce")?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.ciphertext.as_ref())
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Symmetric ChaCha20-Poly1305 key used for bulk content.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub fn generate() -> Self {
        Self(random_bytes::<32>())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self(to_array::<32>(bytes, "symmetric key")?))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns `nonce(12) || ciphertext || auth_tag(16)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = random_bytes::<12>();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // 12 (nonce) + 16 (tag)
        if blob.len() < 28 {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce, ciphertext) = blob.split_at(12);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}
