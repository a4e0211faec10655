//! Access Control
//!
//! Every folder owns an access control document stored as its reserved
//! `file_.access-control` child. A document is trusted when its snapshot
//! verifies and its creator is either the registered root creator (storage
//! root) or held a writer role in the enclosing folder when it was created.
//! Bundles have no document and inherit their enclosing folder's.

pub mod document;
pub mod provenance;
pub mod shared_secret;

pub use document::{
    AccessControlDelta, AccessControlDocument, AccessControlEvaluator, AccessControlSnapshot,
    DocumentEvaluator, RoleChange, StoredAccessControlDocument, ValidationContext,
};
pub use provenance::{ProvenanceVerifier, TimeAuthority};
pub use shared_secret::{generate_shared_secret, SharedSecret};

use crate::crypto::{CryptoKeySet, PublicKeySet};
use crate::error::{AccessError, StoreError};
use crate::store::{ExpectedType, NewFile, StoreBacking, SyncableProvenance};
use crate::tree::hasher::compute_file_hash;
use crate::tree::SyncablePath;
use crate::types::{now_msec, CryptoKeySetId, Hash, ItemType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Roles ordered `Viewer < Editor < Appender < Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read only
    Viewer,
    /// May sign replacement content
    Editor,
    /// May sign new items
    Appender,
    /// Everything, including role changes
    Owner,
}

impl Role {
    /// Roles whose signatures may bring new items into existence.
    pub fn can_originate(self) -> bool {
        self >= Role::Appender
    }

    /// Roles whose signatures may replace the content of an existing file.
    pub fn can_write(self) -> bool {
        self >= Role::Editor
    }

    pub fn can_manage_access(self) -> bool {
        self == Role::Owner
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Appender => "appender",
            Role::Owner => "owner",
        })
    }
}

impl std::str::FromStr for Role {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Role::Viewer),
            "editor" => Ok(Role::Editor),
            "appender" => Ok(Role::Appender),
            "owner" => Ok(Role::Owner),
            other => Err(AccessError::Unauthorized(format!("unknown role {}", other))),
        }
    }
}

/// Out-of-band trust roots for one storage root.
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    /// Key set registered as the creator of the storage root.
    pub root_creator: CryptoKeySetId,
    /// Signer of trusted time stamps, if one is configured.
    pub time_authority: Option<PublicKeySet>,
}

/// Access control operations for one folder.
#[derive(Clone)]
pub struct AccessControl {
    backing: Arc<dyn StoreBacking>,
    folder: SyncablePath,
    trust: Arc<TrustAnchor>,
    evaluator: AccessControlEvaluator,
}

impl AccessControl {
    pub fn new(
        backing: Arc<dyn StoreBacking>,
        folder: SyncablePath,
        trust: Arc<TrustAnchor>,
    ) -> Result<Self, AccessError> {
        if folder.item_type() != ItemType::Folder {
            return Err(AccessError::Store(StoreError::WrongType {
                path: folder.to_string(),
                expected: ItemType::Folder.to_string(),
                actual: folder.item_type(),
            }));
        }
        Ok(Self {
            backing,
            folder,
            trust,
            evaluator: AccessControlEvaluator,
        })
    }

    /// Access control for the folder governing `path`.
    pub fn for_path(
        backing: Arc<dyn StoreBacking>,
        path: &SyncablePath,
        trust: Arc<TrustAnchor>,
    ) -> Result<Self, AccessError> {
        Self::new(backing, path.governing_folder(), trust)
    }

    pub fn folder(&self) -> &SyncablePath {
        &self.folder
    }

    fn document_path(&self) -> Result<SyncablePath, AccessError> {
        Ok(SyncablePath::access_control_document(&self.folder)?)
    }

    /// Write the initial document for a freshly created folder.
    pub async fn initialize(&self, keys: &CryptoKeySet) -> Result<AccessControlDocument, AccessError> {
        let stored = StoredAccessControlDocument {
            snapshot: document::sign_snapshot(keys, &self.folder, now_msec()),
            deltas: Vec::new(),
        };
        let bytes = stored.to_bytes()?;
        let document_path = self.document_path()?;
        let provenance = provenance::sign_item(keys, &document_path, Some(&compute_file_hash(&bytes)), None);
        self.backing
            .create_binary_file_with_path(
                &document_path,
                NewFile {
                    data: bytes,
                    provenance: Some(provenance),
                },
            )
            .await?;
        info!(folder = %self.folder, creator = %keys.id(), "Initialized access control document");
        Ok(self.evaluator.load_stored(&self.folder, stored))
    }

    /// Read this folder's document without checking its chain of trust.
    async fn read_unverified(
        &self,
        folder: &SyncablePath,
    ) -> Result<(AccessControlDocument, Hash), AccessError> {
        let document_path = SyncablePath::access_control_document(folder)?;
        let item = self
            .backing
            .get_at_path(&document_path, ExpectedType::Exactly(ItemType::File))
            .await?;
        let hash = item.metadata().hash;
        let bytes = item
            .into_file_data()
            .ok_or_else(|| AccessError::NotFound(document_path.to_string()))?;
        Ok((self.evaluator.load(folder, &bytes)?, hash))
    }

    /// Validation context for `folder` given its enclosing folder's document.
    fn context_for<'a>(
        &'a self,
        folder: &'a SyncablePath,
        document: &AccessControlDocument,
        parent: Option<&AccessControlDocument>,
    ) -> ValidationContext<'a> {
        ValidationContext {
            folder,
            root_creator: folder.is_root().then_some(&self.trust.root_creator),
            origin_role: parent.and_then(|parent| {
                parent.role_at(document.creator_id(), Some(document.snapshot().created_at_msec))
            }),
        }
    }

    /// Verified document of the enclosing folder, `None` for the root.
    async fn verified_parent(&self) -> Result<Option<AccessControlDocument>, AccessError> {
        let mut verified: Option<AccessControlDocument> = None;
        let chain = self
            .folder
            .ancestors()
            .into_iter()
            .filter(|ancestor| ancestor.item_type() == ItemType::Folder);
        for folder in chain {
            let (document, _) = self.read_unverified(&folder).await?;
            let context = self.context_for(&folder, &document, verified.as_ref());
            if !self.evaluator.is_snapshot_valid(&context, &document) {
                return Err(AccessError::Untrusted(format!(
                    "access control document of {} is not trusted",
                    folder
                )));
            }
            verified = Some(document);
        }
        Ok(verified)
    }

    async fn read_verified(&self) -> Result<(AccessControlDocument, Hash), AccessError> {
        let parent = self.verified_parent().await?;
        let (document, hash) = self.read_unverified(&self.folder).await?;
        self.check_snapshot(&document, parent.as_ref())?;
        Ok((document, hash))
    }

    fn check_snapshot(
        &self,
        document: &AccessControlDocument,
        parent: Option<&AccessControlDocument>,
    ) -> Result<(), AccessError> {
        let context = self.context_for(&self.folder, document, parent);
        if !self.evaluator.is_snapshot_valid(&context, document) {
            return Err(AccessError::Untrusted(format!(
                "access control document of {} is not trusted",
                self.folder
            )));
        }
        Ok(())
    }

    /// The folder's document after verifying its chain of trust up to the root.
    pub async fn get_access_control_document(&self) -> Result<AccessControlDocument, AccessError> {
        Ok(self.read_verified().await?.0)
    }

    /// Apply one role change signed by `keys`.
    ///
    /// `expected_version` is the document version the caller based the change
    /// on; a concurrent update in between fails with `Conflict`.
    pub async fn update_access(
        &self,
        keys: &CryptoKeySet,
        change: RoleChange,
        expected_version: usize,
    ) -> Result<AccessControlDocument, AccessError> {
        let (document, hash) = self.read_verified().await?;
        if document.version() != expected_version {
            return Err(AccessError::Conflict {
                expected: expected_version,
                actual: document.version(),
            });
        }

        let delta = document::sign_delta(keys, &self.folder, change, now_msec());
        if !self.evaluator.is_delta_valid(&document, &delta) {
            return Err(AccessError::Unauthorized(format!(
                "{} may not change roles in {}",
                keys.id(),
                self.folder
            )));
        }

        let mut stored = document.to_stored();
        stored.deltas.push(delta);
        let bytes = stored.to_bytes()?;
        let document_path = self.document_path()?;
        let provenance = provenance::sign_item(keys, &document_path, Some(&compute_file_hash(&bytes)), None);

        match self
            .backing
            .update_binary_file_at_path(
                &document_path,
                NewFile {
                    data: bytes,
                    provenance: Some(provenance),
                },
                Some(hash),
            )
            .await
        {
            Ok(()) => {}
            Err(StoreError::OutOfDate(_)) => {
                let (current, _) = self.read_unverified(&self.folder).await?;
                return Err(AccessError::Conflict {
                    expected: expected_version,
                    actual: current.version(),
                });
            }
            Err(err) => return Err(err.into()),
        }

        let updated = self.evaluator.load_stored(&self.folder, stored);
        debug!(folder = %self.folder, version = updated.version(), "Updated access control document");
        Ok(updated)
    }

    /// Latest role of each requested key set (`None` when it has none).
    pub async fn get_roles_by_crypto_key_set_id(
        &self,
        ids: &[CryptoKeySetId],
    ) -> Result<BTreeMap<CryptoKeySetId, Option<Role>>, AccessError> {
        let document = self.get_access_control_document().await?;
        Ok(ids
            .iter()
            .map(|id| (id.clone(), document.role_at(id, None)))
            .collect())
    }

    /// Whether `id` held one of `roles` at `time_msec`, evaluated against the
    /// document as it stood then.
    pub async fn did_crypto_key_have_role_at_time_msec(
        &self,
        id: &CryptoKeySetId,
        roles: &[Role],
        time_msec: i64,
    ) -> Result<bool, AccessError> {
        let document = self.get_access_control_document().await?;
        Ok(document
            .role_at(id, Some(time_msec))
            .map_or(false, |role| roles.contains(&role)))
    }

    /// Merge a document received from a remote into the local copy.
    ///
    /// The remote snapshot must verify in this folder's chain of trust. When
    /// there is no local copy the remote bytes are stored as received.
    pub async fn accept_remote_document(
        &self,
        bytes: &[u8],
        remote_provenance: Option<SyncableProvenance>,
    ) -> Result<AccessControlDocument, AccessError> {
        let parent = self.verified_parent().await?;
        let remote = self.evaluator.load(&self.folder, bytes)?;
        self.check_snapshot(&remote, parent.as_ref())?;
        let document_path = self.document_path()?;

        let (local, local_hash) = match self.read_unverified(&self.folder).await {
            Ok(found) => found,
            Err(AccessError::NotFound(_)) => {
                self.backing
                    .create_binary_file_with_path(
                        &document_path,
                        NewFile {
                            data: bytes.to_vec(),
                            provenance: remote_provenance,
                        },
                    )
                    .await?;
                return Ok(remote);
            }
            Err(err) => return Err(err),
        };

        let merged = self.evaluator.merge(&local, &remote)?;
        let local_ids: Vec<&str> = local.applied_deltas().iter().map(|d| d.id.as_str()).collect();
        let merged_ids: Vec<&str> = merged.applied_deltas().iter().map(|d| d.id.as_str()).collect();
        if merged_ids == local_ids {
            return Ok(local);
        }

        let remote_ids: Vec<&str> = remote.applied_deltas().iter().map(|d| d.id.as_str()).collect();
        let (data, provenance) = if merged_ids == remote_ids {
            (bytes.to_vec(), remote_provenance)
        } else {
            let current = self.backing.get_metadata_at_path(&document_path).await?;
            (merged.to_stored().to_bytes()?, current.provenance)
        };
        self.backing
            .update_binary_file_at_path(&document_path, NewFile { data, provenance }, Some(local_hash))
            .await?;
        debug!(
            folder = %self.folder,
            from = local.version(),
            to = merged.version(),
            "Merged remote access control document"
        );
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBacking;
    use crate::types::StorageRootId;

    #[test]
    fn test_role_ordering() {
        assert!(Role::Owner > Role::Appender);
        assert!(Role::Appender > Role::Editor);
        assert!(Role::Editor > Role::Viewer);
        assert!(!Role::Viewer.can_write());
        assert!(Role::Editor.can_write());
        assert!(!Role::Editor.can_originate());
        assert!(Role::Appender.can_originate());
        assert!(!Role::Appender.can_manage_access());
    }

    #[tokio::test]
    async fn test_stale_update_is_conflict() {
        let owner = CryptoKeySet::generate();
        let backing: Arc<dyn StoreBacking> =
            Arc::new(InMemoryBacking::new(StorageRootId::new("sr-ac").unwrap()));
        let trust = Arc::new(TrustAnchor {
            root_creator: owner.id().clone(),
            time_authority: None,
        });
        let root = SyncablePath::root(backing.storage_root_id().clone());
        let access = AccessControl::new(backing, root, trust).unwrap();
        access.initialize(&owner).await.unwrap();

        let alice = CryptoKeySet::generate();
        let change = RoleChange {
            subject: alice.public_keys().clone(),
            role: Some(Role::Viewer),
        };
        access.update_access(&owner, change.clone(), 0).await.unwrap();
        let err = access.update_access(&owner, change, 0).await.unwrap_err();
        assert!(matches!(err, AccessError::Conflict { expected: 0, actual: 1 }));
    }
}
