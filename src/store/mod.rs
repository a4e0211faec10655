//! Store Backing
//!
//! Pluggable persistence for the syncable tree. Every backend implements
//! [`StoreBacking`] with the same external contract:
//!
//! - the storage root always exists and is a folder
//! - creation never creates parents; a missing parent is `NotFound` carrying
//!   the deepest prefix that does exist
//! - creating an existing path is `Conflict`
//! - every create, update and delete marks all ancestors
//!   `needs_recompute_hash`; [`maintenance::refresh_hash`] settles them

pub mod filesystem;
pub mod maintenance;
pub mod memory;
pub mod metadata;
pub mod persistence;

pub use filesystem::FileSystemBacking;
pub use memory::InMemoryBacking;
pub use metadata::{
    ItemMetadata, LocalItemMetadata, LocalMetadataPatch, NewFile, NewFolder, OriginalProvenance,
    ProvenanceOrigin, SyncableProvenance, TrustedTimeSignature,
};
pub use persistence::SledBacking;

use crate::error::StoreError;
use crate::tree::SyncablePath;
use crate::types::{Hash, ItemId, ItemType, StorageRootId};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Type constraint for [`StoreBacking::get_at_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedType {
    Any,
    Exactly(ItemType),
    OneOf(Vec<ItemType>),
}

impl ExpectedType {
    pub fn folder_like() -> Self {
        ExpectedType::OneOf(vec![ItemType::Folder, ItemType::Bundle])
    }

    pub fn accepts(&self, actual: ItemType) -> bool {
        match self {
            ExpectedType::Any => true,
            ExpectedType::Exactly(expected) => *expected == actual,
            ExpectedType::OneOf(expected) => expected.contains(&actual),
        }
    }

    /// `WrongType` unless `actual` is accepted.
    pub fn check(&self, path: &SyncablePath, actual: ItemType) -> Result<(), StoreError> {
        if self.accepts(actual) {
            return Ok(());
        }
        let expected = match self {
            ExpectedType::Any => "any".to_string(),
            ExpectedType::Exactly(t) => t.to_string(),
            ExpectedType::OneOf(types) => types
                .iter()
                .map(|t| t.tag())
                .collect::<Vec<_>>()
                .join("|"),
        };
        Err(StoreError::WrongType {
            path: path.to_string(),
            expected,
            actual,
        })
    }
}

impl From<ItemType> for ExpectedType {
    fn from(item_type: ItemType) -> Self {
        ExpectedType::Exactly(item_type)
    }
}

/// A node read back from a backing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreItem {
    File {
        metadata: ItemMetadata,
        data: Vec<u8>,
    },
    /// Folders and bundles.
    Folder {
        metadata: ItemMetadata,
        child_ids: Vec<ItemId>,
    },
}

impl StoreItem {
    pub fn metadata(&self) -> &ItemMetadata {
        match self {
            StoreItem::File { metadata, .. } | StoreItem::Folder { metadata, .. } => metadata,
        }
    }

    pub fn into_file_data(self) -> Option<Vec<u8>> {
        match self {
            StoreItem::File { data, .. } => Some(data),
            StoreItem::Folder { .. } => None,
        }
    }
}

/// CRUD over syncable paths.
#[async_trait]
pub trait StoreBacking: Send + Sync {
    fn storage_root_id(&self) -> &StorageRootId;

    async fn exists_at_path(&self, path: &SyncablePath) -> Result<bool, StoreError>;

    async fn get_at_path(
        &self,
        path: &SyncablePath,
        expected: ExpectedType,
    ) -> Result<StoreItem, StoreError>;

    /// Child IDs of a folder-like node, optionally filtered by type.
    async fn get_ids_in_path(
        &self,
        path: &SyncablePath,
        item_type: Option<ItemType>,
    ) -> Result<Vec<ItemId>, StoreError>;

    async fn get_metadata_at_path(&self, path: &SyncablePath) -> Result<ItemMetadata, StoreError>;

    /// Metadata of the children of `path`. With `ids`, unknown IDs are
    /// silently left out of the result.
    async fn get_metadata_by_id_in_path(
        &self,
        path: &SyncablePath,
        ids: Option<&[ItemId]>,
    ) -> Result<BTreeMap<ItemId, ItemMetadata>, StoreError>;

    async fn create_binary_file_with_path(
        &self,
        path: &SyncablePath,
        file: NewFile,
    ) -> Result<(), StoreError>;

    /// Create a folder or bundle; the type comes from the last path ID.
    async fn create_folder_with_path(
        &self,
        path: &SyncablePath,
        folder: NewFolder,
    ) -> Result<(), StoreError>;

    /// Replace a file's bytes and provenance. With `expected_hash`, fails
    /// `OutOfDate` if the stored hash differs.
    async fn update_binary_file_at_path(
        &self,
        path: &SyncablePath,
        file: NewFile,
        expected_hash: Option<Hash>,
    ) -> Result<(), StoreError>;

    /// Physically remove a node and its subtree. `NotFound` if absent.
    async fn delete_at_path(&self, path: &SyncablePath) -> Result<(), StoreError>;

    async fn update_local_metadata_at_path(
        &self,
        path: &SyncablePath,
        patch: LocalMetadataPatch,
    ) -> Result<(), StoreError>;

    /// Store a recomputed hash and clear `needs_recompute_hash`.
    async fn set_hash_at_path(&self, path: &SyncablePath, hash: Hash) -> Result<(), StoreError>;
}

pub(crate) fn not_found(path: &SyncablePath, walked: &SyncablePath) -> StoreError {
    StoreError::NotFound {
        path: path.to_string(),
        walked: walked.to_string(),
    }
}

pub(crate) fn ensure_not_root(path: &SyncablePath, op: &str) -> Result<(), StoreError> {
    if path.is_root() {
        return Err(StoreError::InvalidPath(format!(
            "cannot {} the storage root {}",
            op, path
        )));
    }
    Ok(())
}

pub(crate) fn check_root(backing_root: &StorageRootId, path: &SyncablePath) -> Result<(), StoreError> {
    if path.storage_root_id() != backing_root {
        return Err(StoreError::InvalidPath(format!(
            "{} is not under storage root {}",
            path, backing_root
        )));
    }
    Ok(())
}

pub(crate) fn new_file_metadata(path: &SyncablePath, file: &NewFile) -> Result<ItemMetadata, StoreError> {
    let id = path
        .last_id()
        .ok_or_else(|| StoreError::InvalidPath(format!("{} is not a file path", path)))?;
    Ok(ItemMetadata {
        item_type: ItemType::File,
        name: id.name().to_string(),
        hash: crate::tree::hasher::compute_file_hash(&file.data),
        provenance: file.provenance.clone(),
        local: LocalItemMetadata::default(),
    })
}

/// New folders start with the empty hash and are flagged for recompute.
pub(crate) fn new_folder_metadata(
    path: &SyncablePath,
    folder: &NewFolder,
) -> Result<ItemMetadata, StoreError> {
    let id = path
        .last_id()
        .ok_or_else(|| StoreError::InvalidPath(format!("{} is the storage root", path)))?;
    Ok(ItemMetadata {
        item_type: id.item_type(),
        name: id.name().to_string(),
        hash: crate::tree::hasher::empty_folder_hash(),
        provenance: folder.provenance.clone(),
        local: LocalItemMetadata {
            needs_recompute_hash: true,
            is_deleted_locally: false,
        },
    })
}

pub(crate) fn root_metadata() -> ItemMetadata {
    ItemMetadata {
        item_type: ItemType::Folder,
        name: String::new(),
        hash: crate::tree::hasher::empty_folder_hash(),
        provenance: None,
        local: LocalItemMetadata::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_type_check() {
        let path: SyncablePath = "sr-test/file_a".parse().unwrap();
        assert!(ExpectedType::Any.check(&path, ItemType::File).is_ok());
        assert!(ExpectedType::folder_like().check(&path, ItemType::Bundle).is_ok());
        let err = ExpectedType::folder_like()
            .check(&path, ItemType::File)
            .unwrap_err();
        assert!(matches!(err, StoreError::WrongType { .. }));
        assert!(err.to_string().contains("folder|bundle"));
    }
}
