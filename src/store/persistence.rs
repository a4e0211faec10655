//! Sled-backed key-value backing.
//!
//! Fills the object-storage slot: every node is one record keyed by its path
//! string (`sr-x/folder_a/file_b`), so the children of a node are the keys
//! under `<path>/` with no further separator. Records are bincode encoded.

use crate::error::StoreError;
use crate::store::{
    check_root, ensure_not_root, new_file_metadata, new_folder_metadata, not_found,
    root_metadata, ExpectedType, ItemMetadata, LocalMetadataPatch, NewFile, NewFolder,
    StoreBacking, StoreItem,
};
use crate::tree::SyncablePath;
use crate::types::{Hash, ItemId, ItemType, StorageRootId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SledRecord {
    metadata: ItemMetadata,
    data: Option<Vec<u8>>,
}

fn backend_err(context: &str, err: sled::Error) -> StoreError {
    StoreError::Backend(format!("{}: {}", context, err))
}

/// Sled-based implementation of [`StoreBacking`].
pub struct SledBacking {
    /// The bucket's tree; the default tree when no bucket is configured.
    db: sled::Tree,
    storage_root_id: StorageRootId,
    /// Guards read-check-write sequences; sled itself is per-key atomic only.
    write_lock: Mutex<()>,
}

impl SledBacking {
    /// Open the database at `path`. `bucket` selects a named tree so several
    /// stores can share one database; `None` uses the default tree.
    pub fn open<P: AsRef<Path>>(
        path: P,
        bucket: Option<&str>,
        storage_root_id: StorageRootId,
    ) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| backend_err("Failed to open sled database", e))?;
        Self::with_db(db, bucket, storage_root_id)
    }

    pub fn with_db(
        db: sled::Db,
        bucket: Option<&str>,
        storage_root_id: StorageRootId,
    ) -> Result<Self, StoreError> {
        let tree = match bucket {
            Some(name) => db
                .open_tree(name)
                .map_err(|e| backend_err("Failed to open bucket", e))?,
            None => (*db).clone(),
        };
        let backing = Self {
            db: tree,
            storage_root_id,
            write_lock: Mutex::new(()),
        };
        let root = SyncablePath::root(backing.storage_root_id.clone());
        if backing.get_record(&root)?.is_none() {
            backing.put_record(
                &root,
                &SledRecord {
                    metadata: root_metadata(),
                    data: None,
                },
            )?;
        }
        Ok(backing)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| backend_err("Failed to flush database", e))?;
        Ok(())
    }

    fn get_record(&self, path: &SyncablePath) -> Result<Option<SledRecord>, StoreError> {
        match self
            .db
            .get(path.to_string().as_bytes())
            .map_err(|e| backend_err("Failed to get record", e))?
        {
            Some(value) => {
                let record = bincode::deserialize(&value).map_err(|e| {
                    StoreError::Serialization(format!("Failed to deserialize record: {}", e))
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put_record(&self, path: &SyncablePath, record: &SledRecord) -> Result<(), StoreError> {
        let value = bincode::serialize(record).map_err(|e| {
            StoreError::Serialization(format!("Failed to serialize record: {}", e))
        })?;
        self.db
            .insert(path.to_string().as_bytes(), value)
            .map_err(|e| backend_err("Failed to put record", e))?;
        Ok(())
    }

    /// Look up `path`, requiring every ancestor record to exist as well.
    fn resolve(&self, path: &SyncablePath) -> Result<SledRecord, StoreError> {
        check_root(&self.storage_root_id, path)?;
        let mut walked = path.prefix(0);
        for ancestor in path.ancestors() {
            if self.get_record(&ancestor)?.is_none() {
                return Err(not_found(path, &walked));
            }
            walked = ancestor;
        }
        self.get_record(path)?.ok_or_else(|| not_found(path, &walked))
    }

    fn resolve_folder(&self, path: &SyncablePath) -> Result<SledRecord, StoreError> {
        let record = self.resolve(path)?;
        ExpectedType::folder_like().check(path, record.metadata.item_type)?;
        Ok(record)
    }

    fn child_ids(&self, path: &SyncablePath) -> Result<Vec<ItemId>, StoreError> {
        let prefix = format!("{}/", path);
        let mut ids = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry.map_err(|e| backend_err("Failed to scan children", e))?;
            let key = String::from_utf8_lossy(&key);
            let rest = &key[prefix.len()..];
            if rest.contains('/') {
                continue;
            }
            ids.push(rest.parse::<ItemId>()?);
        }
        Ok(ids)
    }

    fn mark_ancestors(&self, path: &SyncablePath) -> Result<(), StoreError> {
        for ancestor in path.ancestors() {
            if let Some(mut record) = self.get_record(&ancestor)? {
                if !record.metadata.local.needs_recompute_hash {
                    record.metadata.local.needs_recompute_hash = true;
                    self.put_record(&ancestor, &record)?;
                }
            }
        }
        Ok(())
    }

    fn create_record(&self, path: &SyncablePath, record: SledRecord) -> Result<(), StoreError> {
        check_root(&self.storage_root_id, path)?;
        ensure_not_root(path, "create").map_err(|_| StoreError::Conflict(path.to_string()))?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;

        let _guard = self.write_lock.lock();
        self.resolve_folder(&parent)?;
        if self.get_record(path)?.is_some() {
            return Err(StoreError::Conflict(path.to_string()));
        }
        self.put_record(path, &record)?;
        self.mark_ancestors(path)
    }
}

#[async_trait]
impl StoreBacking for SledBacking {
    fn storage_root_id(&self) -> &StorageRootId {
        &self.storage_root_id
    }

    async fn exists_at_path(&self, path: &SyncablePath) -> Result<bool, StoreError> {
        match self.resolve(path) {
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
        let record = self.resolve(path)?;
        expected.check(path, record.metadata.item_type)?;
        match record.data {
            Some(data) => Ok(StoreItem::File {
                metadata: record.metadata,
                data,
            }),
            None => Ok(StoreItem::Folder {
                metadata: record.metadata,
                child_ids: self.child_ids(path)?,
            }),
        }
    }

    async fn get_ids_in_path(
        &self,
        path: &SyncablePath,
        item_type: Option<ItemType>,
    ) -> Result<Vec<ItemId>, StoreError> {
        self.resolve_folder(path)?;
        Ok(self
            .child_ids(path)?
            .into_iter()
            .filter(|id| item_type.map_or(true, |t| id.item_type() == t))
            .collect())
    }

    async fn get_metadata_at_path(&self, path: &SyncablePath) -> Result<ItemMetadata, StoreError> {
        Ok(self.resolve(path)?.metadata)
    }

    async fn get_metadata_by_id_in_path(
        &self,
        path: &SyncablePath,
        ids: Option<&[ItemId]>,
    ) -> Result<BTreeMap<ItemId, ItemMetadata>, StoreError> {
        self.resolve_folder(path)?;
        let ids = match ids {
            Some(ids) => ids.to_vec(),
            None => self.child_ids(path)?,
        };
        let mut out = BTreeMap::new();
        for id in ids {
            if let Some(record) = self.get_record(&path.append(id.clone())?)? {
                out.insert(id, record.metadata);
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
        self.create_record(
            path,
            SledRecord {
                metadata,
                data: Some(file.data),
            },
        )
    }

    async fn create_folder_with_path(
        &self,
        path: &SyncablePath,
        folder: NewFolder,
    ) -> Result<(), StoreError> {
        ExpectedType::folder_like().check(path, path.item_type())?;
        let metadata = new_folder_metadata(path, &folder)?;
        self.create_record(
            path,
            SledRecord {
                metadata,
                data: None,
            },
        )
    }

    async fn update_binary_file_at_path(
        &self,
        path: &SyncablePath,
        file: NewFile,
        expected_hash: Option<Hash>,
    ) -> Result<(), StoreError> {
        let replacement = new_file_metadata(path, &file)?;
        let _guard = self.write_lock.lock();
        let mut record = self.resolve(path)?;
        ExpectedType::Exactly(ItemType::File).check(path, record.metadata.item_type)?;
        if let Some(expected) = expected_hash {
            if record.metadata.hash != expected {
                return Err(StoreError::OutOfDate(path.to_string()));
            }
        }
        record.metadata.hash = replacement.hash;
        record.metadata.provenance = replacement.provenance;
        record.data = Some(file.data);
        self.put_record(path, &record)?;
        self.mark_ancestors(path)
    }

    async fn delete_at_path(&self, path: &SyncablePath) -> Result<(), StoreError> {
        ensure_not_root(path, "delete")?;
        let _guard = self.write_lock.lock();
        self.resolve(path)?;

        let mut batch = sled::Batch::default();
        batch.remove(path.to_string().as_bytes());
        for entry in self.db.scan_prefix(format!("{}/", path).as_bytes()) {
            let (key, _) = entry.map_err(|e| backend_err("Failed to scan subtree", e))?;
            batch.remove(key);
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| backend_err("Failed to apply batch", e))?;
        self.mark_ancestors(path)
    }

    async fn update_local_metadata_at_path(
        &self,
        path: &SyncablePath,
        patch: LocalMetadataPatch,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut record = self.resolve(path)?;
        patch.apply(&mut record.metadata.local);
        self.put_record(path, &record)
    }

    async fn set_hash_at_path(&self, path: &SyncablePath, hash: Hash) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut record = self.resolve(path)?;
        record.metadata.hash = hash;
        record.metadata.local.needs_recompute_hash = false;
        self.put_record(path, &record)
    }
}
