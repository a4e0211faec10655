//! Store context: the wiring root.
//!
//! Owns one replica's key set, backing, lock store and task queue and hands
//! them to every component that needs them. Local writes and sync tasks lock
//! the same per-path keys, so they exclude each other.

use crate::access::provenance::{sign_item, sign_replacement};
use crate::access::{
    generate_shared_secret, AccessControl, AccessControlDocument, ProvenanceVerifier, Role,
    RoleChange, SharedSecret, TimeAuthority, TrustAnchor,
};
use crate::config::{LockBackendKind, StorageBackendKind, SyncStoreConfig};
use crate::crypto::{CryptoKeySet, CryptoService, PublicKeySet, SymmetricKey};
use crate::error::{AccessError, ConfigError, StoreError};
use crate::lock::{with_lock, AcquireOptions, FileLockStore, LockStore, MemoryLockStore, RedisLockStore};
use crate::queue::{QueueOptions, TaskQueue};
use crate::store::maintenance;
use crate::store::{
    ExpectedType, FileSystemBacking, InMemoryBacking, ItemMetadata, LocalItemMetadata,
    LocalMetadataPatch, NewFile, NewFolder, SledBacking, StoreBacking, SyncableProvenance,
};
use crate::sync::{EngineOptions, RemoteAccessor, SyncEngine};
use crate::tree::hasher::{compute_file_hash, empty_folder_hash};
use crate::tree::SyncablePath;
use crate::types::{CryptoKeySetId, Hash, ItemId, ItemType, StorageRootId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct StoreContext {
    crypto: Arc<CryptoService>,
    backing: Arc<dyn StoreBacking>,
    locks: Arc<dyn LockStore>,
    queue: Arc<TaskQueue>,
    trust: Arc<TrustAnchor>,
    verifier: ProvenanceVerifier,
    time_authority: Option<TimeAuthority>,
    lock_options: AcquireOptions,
    queue_options: QueueOptions,
    remote_id: Option<String>,
}

impl StoreContext {
    pub fn new(
        keys: CryptoKeySet,
        backing: Arc<dyn StoreBacking>,
        locks: Arc<dyn LockStore>,
        trust: Arc<TrustAnchor>,
    ) -> Self {
        let verifier = ProvenanceVerifier::new(backing.clone(), trust.clone());
        Self {
            crypto: Arc::new(CryptoService::new(Arc::new(keys))),
            backing,
            locks,
            queue: Arc::new(TaskQueue::new()),
            trust,
            verifier,
            time_authority: None,
            lock_options: AcquireOptions::default(),
            queue_options: QueueOptions::default(),
            remote_id: None,
        }
    }

    /// Everything in memory: backing, locks and queue.
    pub fn in_memory(keys: CryptoKeySet, storage_root_id: StorageRootId) -> Self {
        let trust = Arc::new(TrustAnchor {
            root_creator: keys.id().clone(),
            time_authority: None,
        });
        Self::new(
            keys,
            Arc::new(InMemoryBacking::new(storage_root_id)),
            Arc::new(MemoryLockStore::new()),
            trust,
        )
    }

    /// Build the backing and lock store named by `config`.
    pub async fn from_config(
        config: &SyncStoreConfig,
        keys: CryptoKeySet,
        storage_root_id: StorageRootId,
        root_creator: CryptoKeySetId,
    ) -> Result<Self, ConfigError> {
        let storage = &config.storage;
        let backing: Arc<dyn StoreBacking> = match storage.backend {
            StorageBackendKind::Memory => Arc::new(InMemoryBacking::new(storage_root_id)),
            StorageBackendKind::Filesystem => Arc::new(
                FileSystemBacking::open(&storage.root_path, storage_root_id)
                    .await
                    .map_err(|e| ConfigError::Invalid(format!("Failed to open store: {}", e)))?,
            ),
            StorageBackendKind::Sled => Arc::new(
                SledBacking::open(&storage.root_path, storage.bucket.as_deref(), storage_root_id)
                    .map_err(|e| ConfigError::Invalid(format!("Failed to open store: {}", e)))?,
            ),
        };

        let locks: Arc<dyn LockStore> = match config.lock.backend {
            LockBackendKind::Memory => Arc::new(MemoryLockStore::new()),
            LockBackendKind::File => Arc::new(
                FileLockStore::new(&config.lock.dir)
                    .map_err(|e| ConfigError::Invalid(format!("Failed to open lock dir: {}", e)))?,
            ),
            LockBackendKind::Redis => Arc::new(
                RedisLockStore::new(config.lock.redis.urls().as_slice())
                    .map_err(|e| ConfigError::Invalid(format!("Failed to connect to redis: {}", e)))?,
            ),
        };

        let trust = Arc::new(TrustAnchor {
            root_creator,
            time_authority: None,
        });
        let mut context = Self::new(keys, backing, locks, trust);
        context.lock_options = config.lock.acquire_options();
        context.queue_options = config.queue.options();
        context.remote_id = config.remote.remote_id.clone();
        debug!(
            storage = ?storage.backend,
            lock = ?config.lock.backend,
            "Built store context from config"
        );
        Ok(context)
    }

    pub fn with_lock_options(mut self, options: AcquireOptions) -> Self {
        self.lock_options = options;
        self
    }

    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    /// Stamp new provenance with trusted time from `authority`.
    pub fn with_time_authority(mut self, authority: TimeAuthority) -> Self {
        self.time_authority = Some(authority);
        self
    }

    pub fn keys(&self) -> &Arc<CryptoKeySet> {
        self.crypto.keys()
    }

    pub fn crypto(&self) -> &Arc<CryptoService> {
        &self.crypto
    }

    pub fn backing(&self) -> &Arc<dyn StoreBacking> {
        &self.backing
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn trust(&self) -> &Arc<TrustAnchor> {
        &self.trust
    }

    pub fn root(&self) -> SyncablePath {
        SyncablePath::root(self.backing.storage_root_id().clone())
    }

    /// Create the root's access control document if this replica is the
    /// root creator and it is missing, then start the task queue.
    pub async fn init(&self) -> Result<(), AccessError> {
        let root = self.root();
        let document_path = SyncablePath::access_control_document(&root)?;
        if !self.backing.exists_at_path(&document_path).await?
            && self.keys().id() == &self.trust.root_creator
        {
            self.access_control(&root)?.initialize(self.keys()).await?;
        }
        self.queue.start(self.queue_options);
        info!(storage_root = %root, "Store context initialized");
        Ok(())
    }

    /// Stop the task queue, waiting for running tasks.
    pub async fn shutdown(&self) {
        self.queue.stop().await;
        info!(storage_root = %self.root(), "Store context shut down");
    }

    pub fn sync_engine(&self, remote: Arc<dyn RemoteAccessor>) -> SyncEngine {
        SyncEngine::new(
            self.backing.clone(),
            remote,
            self.queue.clone(),
            self.locks.clone(),
            self.trust.clone(),
            EngineOptions {
                remote_id: self.remote_id.clone(),
                lock: self.lock_options,
            },
        )
    }

    pub fn access_control(&self, folder: &SyncablePath) -> Result<AccessControl, AccessError> {
        AccessControl::new(self.backing.clone(), folder.clone(), self.trust.clone())
    }

    fn provenance_for(&self, path: &SyncablePath, hash: Option<&Hash>) -> SyncableProvenance {
        self.attest(sign_item(self.keys(), path, hash, None))
    }

    fn attest(&self, provenance: SyncableProvenance) -> SyncableProvenance {
        match &self.time_authority {
            Some(authority) => authority.attest(provenance),
            None => provenance,
        }
    }

    /// Check that our own signature would be accepted before writing.
    async fn check_writable(
        &self,
        path: &SyncablePath,
        hash: Hash,
        provenance: &SyncableProvenance,
    ) -> Result<(), AccessError> {
        let metadata = ItemMetadata {
            item_type: path.item_type(),
            name: path.last_id().map(|id| id.name().to_string()).unwrap_or_default(),
            hash,
            provenance: Some(provenance.clone()),
            local: LocalItemMetadata::default(),
        };
        self.verifier.verify(path, &metadata).await
    }

    /// Create a folder with its access control document and a shared
    /// secret sealed for this replica and `members`.
    pub async fn create_folder(
        &self,
        parent: &SyncablePath,
        name: &str,
        members: &[PublicKeySet],
    ) -> Result<SyncablePath, AccessError> {
        let path = parent.append(ItemId::folder(name).map_err(StoreError::from)?)?;
        for member in members {
            self.crypto.remember(member.clone())?;
        }
        let mut member_ids = vec![self.keys().id().clone()];
        member_ids.extend(members.iter().map(|member| member.id.clone()));
        member_ids.sort();
        member_ids.dedup();

        with_lock(self.locks.as_ref(), &path.to_string(), self.lock_options, || {
            self.create_folder_locked(&path, &member_ids)
        })
        .await?;
        Ok(path)
    }

    async fn create_folder_locked(
        &self,
        path: &SyncablePath,
        member_ids: &[CryptoKeySetId],
    ) -> Result<(), AccessError> {
        let provenance = self.provenance_for(path, None);
        self.check_writable(path, empty_folder_hash(), &provenance).await?;
        self.backing
            .create_folder_with_path(
                path,
                NewFolder {
                    provenance: Some(provenance),
                },
            )
            .await?;
        self.access_control(path)?.initialize(self.keys()).await?;

        let (secret, _) = generate_shared_secret(&self.crypto, member_ids)?;
        let bytes = secret.to_bytes()?;
        let secret_path = SyncablePath::shared_secret(path)?;
        let provenance = self.provenance_for(&secret_path, Some(&compute_file_hash(&bytes)));
        self.backing
            .create_binary_file_with_path(
                &secret_path,
                NewFile {
                    data: bytes,
                    provenance: Some(provenance),
                },
            )
            .await?;
        info!(path = %path, members = member_ids.len(), "Created folder");
        Ok(())
    }

    /// Bundles group items under their enclosing folder's access control.
    pub async fn create_bundle(
        &self,
        parent: &SyncablePath,
        name: &str,
    ) -> Result<SyncablePath, AccessError> {
        let path = parent.append(ItemId::bundle(name).map_err(StoreError::from)?)?;
        with_lock(self.locks.as_ref(), &path.to_string(), self.lock_options, || {
            self.create_bundle_locked(&path)
        })
        .await?;
        Ok(path)
    }

    async fn create_bundle_locked(&self, path: &SyncablePath) -> Result<(), AccessError> {
        let provenance = self.provenance_for(path, None);
        self.check_writable(path, empty_folder_hash(), &provenance).await?;
        self.backing
            .create_folder_with_path(
                path,
                NewFolder {
                    provenance: Some(provenance),
                },
            )
            .await?;
        debug!(path = %path, "Created bundle");
        Ok(())
    }

    /// Create or replace the file at `path`, signed by this replica.
    pub async fn write_file(&self, path: &SyncablePath, data: Vec<u8>) -> Result<Hash, AccessError> {
        if path.item_type() != ItemType::File || path.is_access_control_document() {
            return Err(AccessError::Store(StoreError::InvalidPath(format!(
                "{} is not a writable file path",
                path
            ))));
        }
        with_lock(self.locks.as_ref(), &path.to_string(), self.lock_options, || {
            self.write_file_locked(path, data)
        })
        .await
    }

    async fn write_file_locked(&self, path: &SyncablePath, data: Vec<u8>) -> Result<Hash, AccessError> {
        let hash = compute_file_hash(&data);
        let existing = match self.backing.get_metadata_at_path(path).await {
            Ok(existing) => Some(existing),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };
        if let Some(existing) = &existing {
            if existing.hash == hash && !existing.local.is_deleted_locally {
                debug!(path = %path, "File unchanged");
                return Ok(hash);
            }
        }

        // Existing content is replaced under its original creation signature.
        let provenance = match existing.as_ref().and_then(|e| e.provenance.as_ref().map(|p| (e, p))) {
            Some((existing, previous)) => self.attest(sign_replacement(
                self.keys(),
                path,
                &hash,
                previous,
                existing.hash,
            )),
            None => self.provenance_for(path, Some(&hash)),
        };
        self.check_writable(path, hash, &provenance).await?;

        let file = NewFile {
            data,
            provenance: Some(provenance),
        };
        match existing {
            Some(existing) => {
                self.backing
                    .update_binary_file_at_path(path, file, Some(existing.hash))
                    .await?;
                if existing.local.is_deleted_locally {
                    self.backing
                        .update_local_metadata_at_path(
                            path,
                            LocalMetadataPatch {
                                is_deleted_locally: Some(false),
                                needs_recompute_hash: None,
                            },
                        )
                        .await?;
                }
                debug!(path = %path, hash = %hash, "Replaced file");
            }
            None => {
                self.backing.create_binary_file_with_path(path, file).await?;
                debug!(path = %path, hash = %hash, "Created file");
            }
        }
        Ok(hash)
    }

    /// Read a file after verifying its provenance.
    pub async fn read_file(&self, path: &SyncablePath) -> Result<Vec<u8>, AccessError> {
        let item = self
            .backing
            .get_at_path(path, ExpectedType::Exactly(ItemType::File))
            .await?;
        let metadata = item.metadata().clone();
        if metadata.local.is_deleted_locally {
            return Err(AccessError::NotFound(path.to_string()));
        }
        self.verifier.verify(path, &metadata).await?;
        item.into_file_data()
            .ok_or_else(|| AccessError::NotFound(path.to_string()))
    }

    /// Children of `path` that are not marked deleted.
    pub async fn list(
        &self,
        path: &SyncablePath,
    ) -> Result<BTreeMap<ItemId, ItemMetadata>, StoreError> {
        let mut children = self.backing.get_metadata_by_id_in_path(path, None).await?;
        children.retain(|_, metadata| !metadata.local.is_deleted_locally);
        Ok(children)
    }

    pub async fn shared_secret(&self, folder: &SyncablePath) -> Result<SharedSecret, AccessError> {
        let secret_path = SyncablePath::shared_secret(folder)?;
        let data = self.read_file(&secret_path).await?;
        SharedSecret::from_bytes(&data)
    }

    /// The folder's symmetric key, opened with this replica's keys.
    pub async fn shared_secret_key(&self, folder: &SyncablePath) -> Result<SymmetricKey, AccessError> {
        self.shared_secret(folder).await?.decrypt_for(self.keys())
    }

    /// Grant (`Some`) or revoke (`None`) `subject`'s role on `folder`.
    pub async fn update_access(
        &self,
        folder: &SyncablePath,
        subject: PublicKeySet,
        role: Option<Role>,
    ) -> Result<AccessControlDocument, AccessError> {
        let document_path = SyncablePath::access_control_document(folder)?;
        with_lock(self.locks.as_ref(), &document_path.to_string(), self.lock_options, || {
            self.update_access_locked(folder, subject, role)
        })
        .await
    }

    async fn update_access_locked(
        &self,
        folder: &SyncablePath,
        subject: PublicKeySet,
        role: Option<Role>,
    ) -> Result<AccessControlDocument, AccessError> {
        let access = self.access_control(folder)?;
        let current = access.get_access_control_document().await?;
        self.crypto.remember(subject.clone())?;
        access
            .update_access(self.keys(), RoleChange { subject, role }, current.version())
            .await
    }

    /// Physically delete `path` and everything under it.
    pub async fn delete(&self, path: &SyncablePath) -> Result<(), StoreError> {
        with_lock(self.locks.as_ref(), &path.to_string(), self.lock_options, || {
            self.delete_locked(path)
        })
        .await
    }

    async fn delete_locked(&self, path: &SyncablePath) -> Result<(), StoreError> {
        self.backing.delete_at_path(path).await?;
        info!(path = %path, "Deleted item");
        Ok(())
    }

    /// Flag `path` for the next [`sweep`](Self::sweep).
    pub async fn mark_deleted(&self, path: &SyncablePath) -> Result<(), StoreError> {
        with_lock(self.locks.as_ref(), &path.to_string(), self.lock_options, || {
            maintenance::mark_deleted(self.backing.as_ref(), path)
        })
        .await
    }

    /// Remove every flagged item. Returns how many were removed.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let root = self.root();
        let swept = maintenance::sweep_deleted(self.backing.as_ref(), &root).await?;
        if swept > 0 {
            maintenance::refresh_hash(self.backing.as_ref(), &root).await?;
        }
        info!(swept, "Swept deleted items");
        Ok(swept)
    }

    pub async fn refresh_hash(&self, path: &SyncablePath) -> Result<Hash, StoreError> {
        maintenance::refresh_hash(self.backing.as_ref(), path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn context() -> StoreContext {
        let context = StoreContext::in_memory(
            CryptoKeySet::generate(),
            StorageRootId::new("sr-ctx").unwrap(),
        );
        context.init().await.unwrap();
        context
    }

    #[tokio::test]
    async fn test_write_then_read_verifies() {
        let context = context().await;
        let folder = context.create_folder(&context.root(), "docs", &[]).await.unwrap();
        let path = folder.append(ItemId::file("readme").unwrap()).unwrap();

        context.write_file(&path, b"v1".to_vec()).await.unwrap();
        context.write_file(&path, b"v2".to_vec()).await.unwrap();
        assert_eq!(context.read_file(&path).await.unwrap(), b"v2");

        let names: Vec<_> = context.list(&folder).await.unwrap().into_keys().collect();
        assert!(names.contains(&ItemId::file("readme").unwrap()));
        context.shutdown().await;
    }

    #[tokio::test]
    async fn test_folder_secret_opens_for_members_only() {
        let context = context().await;
        let member = CryptoKeySet::generate();
        let outsider = CryptoKeySet::generate();
        let folder = context
            .create_folder(&context.root(), "shared", &[member.public_keys().clone()])
            .await
            .unwrap();

        let secret = context.shared_secret(&folder).await.unwrap();
        let mine = context.shared_secret_key(&folder).await.unwrap();
        assert_eq!(secret.decrypt_for(&member).unwrap().as_bytes(), mine.as_bytes());
        assert!(secret.decrypt_for(&outsider).is_err());
    }

    #[tokio::test]
    async fn test_mark_then_sweep_hides_and_removes() {
        let context = context().await;
        let path = context.root().append(ItemId::file("tmp").unwrap()).unwrap();
        context.write_file(&path, b"scratch".to_vec()).await.unwrap();

        context.mark_deleted(&path).await.unwrap();
        assert!(matches!(
            context.read_file(&path).await,
            Err(AccessError::NotFound(_))
        ));
        assert_eq!(context.sweep().await.unwrap(), 1);
        assert!(!context.backing().exists_at_path(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_non_writer_cannot_write() {
        let owner = context().await;
        let viewer_keys = CryptoKeySet::generate();
        let folder = owner.create_folder(&owner.root(), "team", &[]).await.unwrap();
        owner
            .update_access(&folder, viewer_keys.public_keys().clone(), Some(Role::Viewer))
            .await
            .unwrap();

        let viewer = StoreContext::new(
            viewer_keys,
            owner.backing().clone(),
            Arc::new(MemoryLockStore::new()),
            owner.trust().clone(),
        );
        let path = folder.append(ItemId::file("note").unwrap()).unwrap();
        let err = viewer.write_file(&path, b"hi".to_vec()).await.unwrap_err();
        assert!(matches!(err, AccessError::Untrusted(_) | AccessError::Unauthorized(_)));
    }
}
