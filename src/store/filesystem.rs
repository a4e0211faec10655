//! Filesystem backing.
//!
//! One directory tree mirrors the path segments under `<base>/<storage_root_id>/`.
//! Each node has a sibling `<id>~meta.json`; file bytes live in a raw sibling
//! file named `<id>`, folders and bundles are directories. `~` never appears in
//! item IDs, so metadata and temp files cannot collide with node names.
//!
//! Writes go to a temp file and are renamed into place.

use crate::error::StoreError;
use crate::store::{
    check_root, ensure_not_root, new_file_metadata, new_folder_metadata, not_found,
    root_metadata, ExpectedType, ItemMetadata, LocalMetadataPatch, NewFile, NewFolder,
    StoreBacking, StoreItem,
};
use crate::tree::SyncablePath;
use crate::types::{Hash, ItemId, ItemType, StorageRootId};
use async_trait::async_trait;
use rand::RngCore;
use std::collections::BTreeMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

const META_SUFFIX: &str = "~meta.json";

pub struct FileSystemBacking {
    base: PathBuf,
    storage_root_id: StorageRootId,
    /// Serializes structural writes within this process.
    write_lock: Mutex<()>,
}

impl FileSystemBacking {
    /// Open (or initialize) the tree for `storage_root_id` under `base`.
    pub async fn open(
        base: impl Into<PathBuf>,
        storage_root_id: StorageRootId,
    ) -> Result<Self, StoreError> {
        let backing = Self {
            base: base.into(),
            storage_root_id,
            write_lock: Mutex::new(()),
        };
        let root = SyncablePath::root(backing.storage_root_id.clone());
        fs::create_dir_all(backing.node_path(&root)).await?;
        if backing.read_meta(&root).await?.is_none() {
            backing.write_meta(&root, &root_metadata()).await?;
            debug!(root = %backing.storage_root_id, base = ?backing.base, "Initialized filesystem store");
        }
        Ok(backing)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn node_path(&self, path: &SyncablePath) -> PathBuf {
        let mut out = self.base.join(path.storage_root_id().as_str());
        for id in path.ids() {
            out.push(id.to_string());
        }
        out
    }

    fn meta_path(&self, path: &SyncablePath) -> PathBuf {
        match (path.parent(), path.last_id()) {
            (Some(parent), Some(id)) => self
                .node_path(&parent)
                .join(format!("{}{}", id, META_SUFFIX)),
            _ => self
                .base
                .join(format!("{}{}", path.storage_root_id(), META_SUFFIX)),
        }
    }

    async fn read_meta(&self, path: &SyncablePath) -> Result<Option<ItemMetadata>, StoreError> {
        match fs::read(self.meta_path(path)).await {
            Ok(bytes) => {
                let metadata = serde_json::from_slice(&bytes).map_err(|e| {
                    StoreError::Serialization(format!("metadata of {}: {}", path, e))
                })?;
                Ok(Some(metadata))
            }
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_meta(&self, path: &SyncablePath, metadata: &ItemMetadata) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(metadata)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.meta_path(path), &bytes).await
    }

    /// Walk from the root and return the metadata at `path`.
    async fn resolve(&self, path: &SyncablePath) -> Result<ItemMetadata, StoreError> {
        check_root(&self.storage_root_id, path)?;
        let mut current = self
            .read_meta(&path.prefix(0))
            .await?
            .ok_or_else(|| StoreError::Backend(format!("missing root metadata for {}", path)))?;
        for depth in 1..=path.ids().len() {
            let prefix = path.prefix(depth);
            current = self
                .read_meta(&prefix)
                .await?
                .ok_or_else(|| not_found(path, &path.prefix(depth - 1)))?;
            if current.item_type != prefix.item_type() {
                return Err(StoreError::WrongType {
                    path: prefix.to_string(),
                    expected: prefix.item_type().to_string(),
                    actual: current.item_type,
                });
            }
        }
        Ok(current)
    }

    async fn resolve_folder(&self, path: &SyncablePath) -> Result<ItemMetadata, StoreError> {
        let metadata = self.resolve(path).await?;
        ExpectedType::folder_like().check(path, metadata.item_type)?;
        Ok(metadata)
    }

    async fn list_children(&self, path: &SyncablePath) -> Result<Vec<ItemId>, StoreError> {
        let mut entries = fs::read_dir(self.node_path(path)).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(META_SUFFIX) {
                if let Ok(id) = id.parse::<ItemId>() {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn mark_ancestors(&self, path: &SyncablePath) -> Result<(), StoreError> {
        for ancestor in path.ancestors() {
            if let Some(mut metadata) = self.read_meta(&ancestor).await? {
                if !metadata.local.needs_recompute_hash {
                    metadata.local.needs_recompute_hash = true;
                    self.write_meta(&ancestor, &metadata).await?;
                }
            }
        }
        Ok(())
    }

    async fn create_node(
        &self,
        path: &SyncablePath,
        metadata: ItemMetadata,
        data: Option<Vec<u8>>,
    ) -> Result<(), StoreError> {
        check_root(&self.storage_root_id, path)?;
        ensure_not_root(path, "create").map_err(|_| StoreError::Conflict(path.to_string()))?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;

        let _guard = self.write_lock.lock().await;
        self.resolve_folder(&parent).await?;
        if self.read_meta(path).await?.is_some() {
            return Err(StoreError::Conflict(path.to_string()));
        }

        let node_path = self.node_path(path);
        match data {
            Some(data) => write_atomic(&node_path, &data).await?,
            None => fs::create_dir_all(&node_path).await?,
        }
        self.write_meta(path, &metadata).await?;
        self.mark_ancestors(path).await?;
        debug!(path = %path, item_type = %metadata.item_type, "Created item");
        Ok(())
    }
}

async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut suffix = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut suffix);
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::InvalidPath(format!("{:?}", target)))?;
    let temp_path = target.with_file_name(format!("{}~tmp-{}", file_name, hex::encode(suffix)));

    fs::write(&temp_path, bytes).await?;
    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err.into());
    }
    Ok(())
}

#[async_trait]
impl StoreBacking for FileSystemBacking {
    fn storage_root_id(&self) -> &StorageRootId {
        &self.storage_root_id
    }

    async fn exists_at_path(&self, path: &SyncablePath) -> Result<bool, StoreError> {
        match self.resolve(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn get_at_path(
        &self,
        path: &SyncablePath,
        expected: ExpectedType,
    ) -> Result<StoreItem, StoreError> {
        let metadata = self.resolve(path).await?;
        expected.check(path, metadata.item_type)?;
        if metadata.item_type == ItemType::File {
            let data = fs::read(self.node_path(path)).await?;
            Ok(StoreItem::File { metadata, data })
        } else {
            let child_ids = self.list_children(path).await?;
            Ok(StoreItem::Folder {
                metadata,
                child_ids,
            })
        }
    }

    async fn get_ids_in_path(
        &self,
        path: &SyncablePath,
        item_type: Option<ItemType>,
    ) -> Result<Vec<ItemId>, StoreError> {
        self.resolve_folder(path).await?;
        let ids = self.list_children(path).await?;
        Ok(ids
            .into_iter()
            .filter(|id| item_type.map_or(true, |t| id.item_type() == t))
            .collect())
    }

    async fn get_metadata_at_path(&self, path: &SyncablePath) -> Result<ItemMetadata, StoreError> {
        self.resolve(path).await
    }

    async fn get_metadata_by_id_in_path(
        &self,
        path: &SyncablePath,
        ids: Option<&[ItemId]>,
    ) -> Result<BTreeMap<ItemId, ItemMetadata>, StoreError> {
        self.resolve_folder(path).await?;
        let ids = match ids {
            Some(ids) => ids.to_vec(),
            None => self.list_children(path).await?,
        };
        let mut out = BTreeMap::new();
        for id in ids {
            let child = path.append(id.clone())?;
            if let Some(metadata) = self.read_meta(&child).await? {
                out.insert(id, metadata);
            }
        }
        Ok(out)
    }

    async fn create_binary_file_with_path(
        &self,
        path: &SyncablePath,
        file: NewFile,
    ) -> Result<(), StoreError> {
        ExpectedType::Exactly(ItemType::File).check(path, path.item_type())?;
        let metadata = new_file_metadata(path, &file)?;
        self.create_node(path, metadata, Some(file.data)).await
    }

    async fn create_folder_with_path(
        &self,
        path: &SyncablePath,
        folder: NewFolder,
    ) -> Result<(), StoreError> {
        ExpectedType::folder_like().check(path, path.item_type())?;
        let metadata = new_folder_metadata(path, &folder)?;
        self.create_node(path, metadata, None).await
    }

    async fn update_binary_file_at_path(
        &self,
        path: &SyncablePath,
        file: NewFile,
        expected_hash: Option<Hash>,
    ) -> Result<(), StoreError> {
        let replacement = new_file_metadata(path, &file)?;
        let _guard = self.write_lock.lock().await;
        let mut metadata = self.resolve(path).await?;
        ExpectedType::Exactly(ItemType::File).check(path, metadata.item_type)?;
        if let Some(expected) = expected_hash {
            if metadata.hash != expected {
                return Err(StoreError::OutOfDate(path.to_string()));
            }
        }

        write_atomic(&self.node_path(path), &file.data).await?;
        metadata.hash = replacement.hash;
        metadata.provenance = replacement.provenance;
        self.write_meta(path, &metadata).await?;
        self.mark_ancestors(path).await
    }

    async fn delete_at_path(&self, path: &SyncablePath) -> Result<(), StoreError> {
        ensure_not_root(path, "delete")?;
        let _guard = self.write_lock.lock().await;
        let metadata = self.resolve(path).await?;

        let node_path = self.node_path(path);
        let removed = if metadata.item_type == ItemType::File {
            fs::remove_file(&node_path).await
        } else {
            fs::remove_dir_all(&node_path).await
        };
        match removed {
            Ok(()) => {}
            Err(err) if err.kind() == IoErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::remove_file(self.meta_path(path)).await?;
        self.mark_ancestors(path).await?;
        debug!(path = %path, "Deleted item");
        Ok(())
    }

    async fn update_local_metadata_at_path(
        &self,
        path: &SyncablePath,
        patch: LocalMetadataPatch,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut metadata = self.resolve(path).await?;
        patch.apply(&mut metadata.local);
        self.write_meta(path, &metadata).await
    }

    async fn set_hash_at_path(&self, path: &SyncablePath, hash: Hash) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut metadata = self.resolve(path).await?;
        metadata.hash = hash;
        metadata.local.needs_recompute_hash = false;
        self.write_meta(path, &metadata).await
    }
}
