//! Core identifier types shared by every layer of the store.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use unicode_normalization::UnicodeNormalization;

/// Maximum length of an item name component.
pub const MAX_NAME_LEN: usize = 200;

/// SHA-256 digest used for content addressing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Result<Self, IdError> {
        let bytes = hex::decode(value).map_err(|e| IdError::Malformed(format!("hash: {}", e)))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdError::Malformed("hash must be 32 bytes".to_string()))?;
        Ok(Hash(array))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Hash::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

/// Identifier parse/validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("Malformed identifier: {0}")]
    Malformed(String),

    #[error("Unknown item type tag: {0}")]
    UnknownType(String),
}

/// Type tag carried by every item ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    File,
    Bundle,
    Folder,
}

impl ItemType {
    /// Folders and bundles can hold children.
    pub fn is_folder_like(self) -> bool {
        matches!(self, ItemType::Folder | ItemType::Bundle)
    }

    pub fn tag(self) -> &'static str {
        match self {
            ItemType::File => "file",
            ItemType::Bundle => "bundle",
            ItemType::Folder => "folder",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ItemType {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(ItemType::File),
            "bundle" => Ok(ItemType::Bundle),
            "folder" => Ok(ItemType::Folder),
            other => Err(IdError::UnknownType(other.to_string())),
        }
    }
}

fn validate_name(name: &str) -> Result<String, IdError> {
    let normalized: String = name.nfc().collect();
    if normalized.is_empty() {
        return Err(IdError::Malformed("name cannot be empty".to_string()));
    }
    if normalized.len() > MAX_NAME_LEN {
        return Err(IdError::Malformed(format!(
            "name exceeds {} bytes",
            MAX_NAME_LEN
        )));
    }
    if normalized == "." || normalized == ".." {
        return Err(IdError::Malformed(format!("reserved name: {}", normalized)));
    }
    if let Some(bad) = normalized
        .chars()
        .find(|c| !(c.is_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(IdError::Malformed(format!(
            "invalid character {:?} in name {}",
            bad, normalized
        )));
    }
    Ok(normalized)
}

/// One path component: an item-type tag plus an opaque name.
///
/// Rendered as `<tag>_<name>`, e.g. `folder_inbox` or `file_3f2a.eml`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId {
    item_type: ItemType,
    name: String,
}

impl ItemId {
    pub fn new(item_type: ItemType, name: &str) -> Result<Self, IdError> {
        Ok(Self {
            item_type,
            name: validate_name(name)?,
        })
    }

    pub fn file(name: &str) -> Result<Self, IdError> {
        Self::new(ItemType::File, name)
    }

    pub fn bundle(name: &str) -> Result<Self, IdError> {
        Self::new(ItemType::Bundle, name)
    }

    pub fn folder(name: &str) -> Result<Self, IdError> {
        Self::new(ItemType::Folder, name)
    }

    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.item_type.tag(), self.name)
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({})", self)
    }
}

impl FromStr for ItemId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, name) = s
            .split_once('_')
            .ok_or_else(|| IdError::Malformed(format!("missing type tag in {}", s)))?;
        ItemId::new(tag.parse()?, name)
    }
}

impl Serialize for ItemId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                let rest = value.strip_prefix(Self::PREFIX).ok_or_else(|| {
                    IdError::Malformed(format!("{} must start with {}", value, Self::PREFIX))
                })?;
                if rest.is_empty()
                    || !rest
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-')
                {
                    return Err(IdError::Malformed(format!("invalid identifier {}", value)));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

string_id!(
    /// Identifies one storage root (one user's tree).
    StorageRootId,
    "sr-"
);

string_id!(
    /// Identifies a public key set (signing + encryption keys).
    CryptoKeySetId,
    "cks-"
);

impl StorageRootId {
    /// Generate a fresh random storage root ID.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        StorageRootId(format!("{}{}", Self::PREFIX, hex::encode(bytes)))
    }
}

impl CryptoKeySetId {
    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        CryptoKeySetId(format!("{}{}", Self::PREFIX, hex::encode(&digest[..16])))
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_msec() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
