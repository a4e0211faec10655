//! Item metadata carried by every node in the store.

use crate::crypto::Signature;
use crate::types::{CryptoKeySetId, Hash, ItemType};
use serde::{Deserialize, Serialize};

/// Who signed a node into existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceOrigin {
    pub signature: Signature,
    pub originator_public_key_set_id: CryptoKeySetId,
}

/// A time authority's attestation that a signature existed at `time_msec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedTimeSignature {
    pub time_msec: i64,
    pub signer: CryptoKeySetId,
    pub signature: Signature,
}

/// The signature that first brought a since-replaced file into existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalProvenance {
    /// Content hash the original signature covers.
    pub hash: Hash,
    pub origin: ProvenanceOrigin,
    pub trusted_time_signature: Option<TrustedTimeSignature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncableProvenance {
    pub origin: ProvenanceOrigin,
    pub trusted_time_signature: Option<TrustedTimeSignature>,
    /// Set when `origin` replaced the content of an existing file.
    #[serde(default)]
    pub replaces: Option<Box<OriginalProvenance>>,
}

/// Fields that never leave this replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalItemMetadata {
    pub needs_recompute_hash: bool,
    pub is_deleted_locally: bool,
}

/// Partial update of [`LocalItemMetadata`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMetadataPatch {
    pub needs_recompute_hash: Option<bool>,
    pub is_deleted_locally: Option<bool>,
}

impl LocalMetadataPatch {
    pub fn apply(&self, local: &mut LocalItemMetadata) {
        if let Some(value) = self.needs_recompute_hash {
            local.needs_recompute_hash = value;
        }
        if let Some(value) = self.is_deleted_locally {
            local.is_deleted_locally = value;
        }
    }
}

/// Metadata of one node.
///
/// `provenance` is `None` only for the storage root, which is trusted
/// through the registration of its creator instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub item_type: ItemType,
    pub name: String,
    pub hash: Hash,
    pub provenance: Option<SyncableProvenance>,
    pub local: LocalItemMetadata,
}

impl ItemMetadata {
    /// Metadata without the local-only fields, as sent over the wire.
    pub fn without_local(&self) -> ItemMetadata {
        ItemMetadata {
            local: LocalItemMetadata::default(),
            ..self.clone()
        }
    }
}

/// Input to `create_binary_file_with_path` / `update_binary_file_at_path`.
///
/// The backing computes the hash from `data` itself.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub data: Vec<u8>,
    pub provenance: Option<SyncableProvenance>,
}

/// Input to `create_folder_with_path`.
#[derive(Debug, Clone, Default)]
pub struct NewFolder {
    pub provenance: Option<SyncableProvenance>,
}
