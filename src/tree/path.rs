//! Syncable paths: an ordered list of item IDs under a storage root.

use crate::error::StoreError;
use crate::types::{ItemId, ItemType, StorageRootId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Reserved name of the per-folder access control document.
pub const ACCESS_CONTROL_DOC_NAME: &str = ".access-control";

/// Reserved name of the per-folder shared secret record.
pub const SHARED_SECRET_NAME: &str = ".shared-secret";

/// Immutable path value. The root path has no IDs and is always a folder.
///
/// Every ID except the last must be folder-like; the last ID decides the
/// node's type.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncablePath {
    storage_root_id: StorageRootId,
    ids: Vec<ItemId>,
}

impl SyncablePath {
    pub fn root(storage_root_id: StorageRootId) -> Self {
        Self {
            storage_root_id,
            ids: Vec::new(),
        }
    }

    /// Build a path from IDs, enforcing that intermediate IDs are folder-like.
    pub fn from_ids(storage_root_id: StorageRootId, ids: Vec<ItemId>) -> Result<Self, StoreError> {
        let mut path = Self::root(storage_root_id);
        for id in ids {
            path = path.append(id)?;
        }
        Ok(path)
    }

    /// Return a new path with `id` appended.
    pub fn append(&self, id: ItemId) -> Result<Self, StoreError> {
        if !self.item_type().is_folder_like() {
            return Err(StoreError::InvalidPath(format!(
                "cannot append {} under file {}",
                id, self
            )));
        }
        let mut ids = self.ids.clone();
        ids.push(id);
        Ok(Self {
            storage_root_id: self.storage_root_id.clone(),
            ids,
        })
    }

    pub fn storage_root_id(&self) -> &StorageRootId {
        &self.storage_root_id
    }

    pub fn ids(&self) -> &[ItemId] {
        &self.ids
    }

    pub fn is_root(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn last_id(&self) -> Option<&ItemId> {
        self.ids.last()
    }

    /// Type of the node this path names.
    pub fn item_type(&self) -> ItemType {
        self.ids
            .last()
            .map(|id| id.item_type())
            .unwrap_or(ItemType::Folder)
    }

    pub fn parent(&self) -> Option<SyncablePath> {
        if self.ids.is_empty() {
            return None;
        }
        Some(Self {
            storage_root_id: self.storage_root_id.clone(),
            ids: self.ids[..self.ids.len() - 1].to_vec(),
        })
    }

    /// Prefix of this path with `len` IDs.
    pub fn prefix(&self, len: usize) -> SyncablePath {
        Self {
            storage_root_id: self.storage_root_id.clone(),
            ids: self.ids[..len.min(self.ids.len())].to_vec(),
        }
    }

    /// Strict ancestors, root first.
    pub fn ancestors(&self) -> Vec<SyncablePath> {
        (0..self.ids.len()).map(|len| self.prefix(len)).collect()
    }

    /// Closest strict ancestor that is a `folder` (the root counts).
    ///
    /// Bundles are skipped because they inherit their parent's access control.
    pub fn nearest_enclosing_folder(&self) -> Option<SyncablePath> {
        self.ancestors()
            .into_iter()
            .rev()
            .find(|ancestor| ancestor.item_type() == ItemType::Folder)
    }

    /// This path if it names a folder, else its nearest enclosing folder.
    pub fn governing_folder(&self) -> SyncablePath {
        if self.item_type() == ItemType::Folder {
            return self.clone();
        }
        self.nearest_enclosing_folder()
            .unwrap_or_else(|| Self::root(self.storage_root_id.clone()))
    }

    pub fn starts_with(&self, other: &SyncablePath) -> bool {
        self.storage_root_id == other.storage_root_id
            && self.ids.len() >= other.ids.len()
            && self.ids[..other.ids.len()] == other.ids[..]
    }

    /// Path of `folder`'s access control document.
    pub fn access_control_document(folder: &SyncablePath) -> Result<SyncablePath, StoreError> {
        folder.append(ItemId::file(ACCESS_CONTROL_DOC_NAME)?)
    }

    /// Path of `folder`'s shared secret record.
    pub fn shared_secret(folder: &SyncablePath) -> Result<SyncablePath, StoreError> {
        folder.append(ItemId::file(SHARED_SECRET_NAME)?)
    }

    pub fn is_access_control_document(&self) -> bool {
        self.last_id()
            .map(is_access_control_id)
            .unwrap_or(false)
    }
}

pub fn is_access_control_id(id: &ItemId) -> bool {
    id.item_type() == ItemType::File && id.name() == ACCESS_CONTROL_DOC_NAME
}

impl fmt::Display for SyncablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.storage_root_id.as_str())?;
        for id in &self.ids {
            write!(f, "/{}", id)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SyncablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncablePath({})", self)
    }
}

impl FromStr for SyncablePath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_end_matches('/');
        let mut segments = trimmed.split('/');
        let root = segments
            .next()
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| StoreError::InvalidPath(format!("empty path: {:?}", s)))?;
        let storage_root_id = StorageRootId::new(root)?;
        let ids = segments
            .map(|segment| segment.parse::<ItemId>())
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_ids(storage_root_id, ids)
    }
}

impl Serialize for SyncablePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SyncablePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}
