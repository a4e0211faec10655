//! Access control document: a signed snapshot plus an append-only set of
//! signed role deltas.
//!
//! The document is a grow-only set of deltas, so two replicas merge by union.
//! Evaluation replays deltas in `(signed_at_msec, id)` order and drops any
//! delta whose signer did not hold `Owner` at its signing time. Whether a
//! delta is valid therefore never depends on deltas signed after it.

use crate::access::Role;
use crate::crypto::{CryptoKeySet, PublicKeySet, Signature};
use crate::error::AccessError;
use crate::tree::hasher::sha256;
use crate::tree::SyncablePath;
use crate::types::CryptoKeySetId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Creation record of a folder's document. The creator holds `Owner` forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlSnapshot {
    pub creator: PublicKeySet,
    pub created_at_msec: i64,
    pub signature: Signature,
}

/// Grant (`Some`) or revoke (`None`) a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleChange {
    pub subject: PublicKeySet,
    pub role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlDelta {
    /// Hex SHA-256 of the signed message.
    pub id: String,
    pub change: RoleChange,
    pub signer: CryptoKeySetId,
    pub signed_at_msec: i64,
    pub signature: Signature,
}

/// Serialized form stored as the folder's `file_.access-control` child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAccessControlDocument {
    pub snapshot: AccessControlSnapshot,
    pub deltas: Vec<AccessControlDelta>,
}

impl StoredAccessControlDocument {
    pub fn to_bytes(&self) -> Result<Vec<u8>, AccessError> {
        serde_json::to_vec(self).map_err(|e| AccessError::Untrusted(format!("encode document: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AccessError> {
        serde_json::from_slice(bytes)
            .map_err(|e| AccessError::Untrusted(format!("malformed access control document: {}", e)))
    }
}

fn snapshot_message(folder: &SyncablePath, creator: &CryptoKeySetId, created_at_msec: i64) -> Vec<u8> {
    format!(
        "syncable-store/acl-snapshot/v1\n{}\n{}\n{}",
        folder, creator, created_at_msec
    )
    .into_bytes()
}

fn delta_message(
    folder: &SyncablePath,
    change: &RoleChange,
    signer: &CryptoKeySetId,
    signed_at_msec: i64,
) -> Vec<u8> {
    let role = change.role.map(|r| r.to_string()).unwrap_or_else(|| "none".to_string());
    format!(
        "syncable-store/acl-delta/v1\n{}\n{}\n{}\n{}\n{}",
        folder, change.subject.id, role, signer, signed_at_msec
    )
    .into_bytes()
}

pub fn sign_snapshot(
    keys: &CryptoKeySet,
    folder: &SyncablePath,
    created_at_msec: i64,
) -> AccessControlSnapshot {
    AccessControlSnapshot {
        creator: keys.public_keys().clone(),
        created_at_msec,
        signature: keys.sign(&snapshot_message(folder, keys.id(), created_at_msec)),
    }
}

pub fn sign_delta(
    keys: &CryptoKeySet,
    folder: &SyncablePath,
    change: RoleChange,
    signed_at_msec: i64,
) -> AccessControlDelta {
    let message = delta_message(folder, &change, keys.id(), signed_at_msec);
    AccessControlDelta {
        id: hex::encode(sha256(&message)),
        signature: keys.sign(&message),
        change,
        signer: keys.id().clone(),
        signed_at_msec,
    }
}

/// Evaluated document: the snapshot plus the deltas that survived replay.
#[derive(Debug, Clone)]
pub struct AccessControlDocument {
    folder: SyncablePath,
    snapshot: AccessControlSnapshot,
    applied: Vec<AccessControlDelta>,
    rejected: usize,
    known_keys: HashMap<CryptoKeySetId, PublicKeySet>,
}

impl AccessControlDocument {
    fn empty(folder: SyncablePath, snapshot: AccessControlSnapshot) -> Self {
        let mut known_keys = HashMap::new();
        known_keys.insert(snapshot.creator.id.clone(), snapshot.creator.clone());
        Self {
            folder,
            snapshot,
            applied: Vec::new(),
            rejected: 0,
            known_keys,
        }
    }

    pub fn folder(&self) -> &SyncablePath {
        &self.folder
    }

    pub fn snapshot(&self) -> &AccessControlSnapshot {
        &self.snapshot
    }

    pub fn creator_id(&self) -> &CryptoKeySetId {
        &self.snapshot.creator.id
    }

    /// Number of applied deltas; bumps on every accepted change.
    pub fn version(&self) -> usize {
        self.applied.len()
    }

    pub fn applied_deltas(&self) -> &[AccessControlDelta] {
        &self.applied
    }

    /// Deltas dropped during the last load.
    pub fn rejected_count(&self) -> usize {
        self.rejected
    }

    pub fn public_keys_for(&self, id: &CryptoKeySetId) -> Option<&PublicKeySet> {
        self.known_keys.get(id)
    }

    /// Role of `id` considering deltas signed at or before `time_msec`
    /// (`None` means the latest state).
    pub fn role_at(&self, id: &CryptoKeySetId, time_msec: Option<i64>) -> Option<Role> {
        if *id == self.snapshot.creator.id {
            return match time_msec {
                Some(t) if t < self.snapshot.created_at_msec => None,
                _ => Some(Role::Owner),
            };
        }
        let mut role = None;
        for delta in &self.applied {
            if time_msec.map_or(false, |t| delta.signed_at_msec > t) {
                break;
            }
            if delta.change.subject.id == *id {
                role = delta.change.role;
            }
        }
        role
    }

    /// Effective role of every principal in the latest state.
    pub fn roles(&self) -> BTreeMap<CryptoKeySetId, Role> {
        let mut roles = BTreeMap::new();
        roles.insert(self.snapshot.creator.id.clone(), Role::Owner);
        for delta in &self.applied {
            match delta.change.role {
                Some(role) => {
                    roles.insert(delta.change.subject.id.clone(), role);
                }
                None => {
                    roles.remove(&delta.change.subject.id);
                }
            }
        }
        roles
    }

    pub fn to_stored(&self) -> StoredAccessControlDocument {
        StoredAccessControlDocument {
            snapshot: self.snapshot.clone(),
            deltas: self.applied.clone(),
        }
    }

    fn apply(&mut self, delta: AccessControlDelta) {
        self.known_keys
            .entry(delta.change.subject.id.clone())
            .or_insert_with(|| delta.change.subject.clone());
        self.applied.push(delta);
    }
}

/// Inputs for snapshot validation besides the document itself.
#[derive(Debug, Clone)]
pub struct ValidationContext<'a> {
    pub folder: &'a SyncablePath,
    /// Root folders: the creator registered for the storage root.
    pub root_creator: Option<&'a CryptoKeySetId>,
    /// Non-root folders: the creator's role in the enclosing folder at creation.
    pub origin_role: Option<Role>,
}

/// Load and validation strategy for one kind of conflict-free document.
///
/// The predicates are pure so they can run identically on local updates and
/// on deltas received from a remote.
pub trait DocumentEvaluator: Send + Sync {
    type Document;
    type Delta;

    /// Parse and replay, dropping invalid deltas.
    fn load(&self, folder: &SyncablePath, bytes: &[u8]) -> Result<Self::Document, AccessError>;

    fn is_snapshot_valid(&self, context: &ValidationContext<'_>, document: &Self::Document) -> bool;

    fn is_delta_valid(&self, document: &Self::Document, delta: &Self::Delta) -> bool;

    /// Union of two replicas of the same document.
    fn merge(&self, local: &Self::Document, remote: &Self::Document) -> Result<Self::Document, AccessError>;
}

/// Evaluator for access control documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessControlEvaluator;

impl AccessControlEvaluator {
    fn replay(
        &self,
        folder: &SyncablePath,
        snapshot: AccessControlSnapshot,
        deltas: impl IntoIterator<Item = AccessControlDelta>,
    ) -> AccessControlDocument {
        let mut unique: BTreeMap<(i64, String), AccessControlDelta> = BTreeMap::new();
        for delta in deltas {
            unique.insert((delta.signed_at_msec, delta.id.clone()), delta);
        }

        let mut document = AccessControlDocument::empty(folder.clone(), snapshot);
        for (_, delta) in unique {
            if self.is_delta_valid(&document, &delta) {
                document.apply(delta);
            } else {
                warn!(
                    folder = %folder,
                    delta = %delta.id,
                    signer = %delta.signer,
                    "Dropping invalid access control delta"
                );
                document.rejected += 1;
            }
        }
        document
    }

    pub fn load_stored(
        &self,
        folder: &SyncablePath,
        stored: StoredAccessControlDocument,
    ) -> AccessControlDocument {
        self.replay(folder, stored.snapshot, stored.deltas)
    }
}

impl DocumentEvaluator for AccessControlEvaluator {
    type Document = AccessControlDocument;
    type Delta = AccessControlDelta;

    fn load(&self, folder: &SyncablePath, bytes: &[u8]) -> Result<AccessControlDocument, AccessError> {
        let stored = StoredAccessControlDocument::from_bytes(bytes)?;
        Ok(self.load_stored(folder, stored))
    }

    fn is_snapshot_valid(&self, context: &ValidationContext<'_>, document: &AccessControlDocument) -> bool {
        let snapshot = &document.snapshot;
        if document.folder != *context.folder {
            return false;
        }
        let message = snapshot_message(context.folder, &snapshot.creator.id, snapshot.created_at_msec);
        if snapshot.creator.verify(&message, &snapshot.signature).is_err() {
            return false;
        }
        if context.folder.is_root() {
            context.root_creator == Some(&snapshot.creator.id)
        } else {
            context.origin_role.map_or(false, Role::can_originate)
        }
    }

    fn is_delta_valid(&self, document: &AccessControlDocument, delta: &AccessControlDelta) -> bool {
        if delta.change.subject.validate().is_err() {
            return false;
        }
        // The creator's ownership is fixed by the snapshot.
        if delta.change.subject.id == *document.creator_id() {
            return false;
        }
        let Some(signer_keys) = document.public_keys_for(&delta.signer) else {
            return false;
        };
        let message = delta_message(&document.folder, &delta.change, &delta.signer, delta.signed_at_msec);
        if hex::encode(sha256(&message)) != delta.id {
            return false;
        }
        if signer_keys.verify(&message, &delta.signature).is_err() {
            return false;
        }
        document
            .role_at(&delta.signer, Some(delta.signed_at_msec))
            .map_or(false, Role::can_manage_access)
    }

    fn merge(
        &self,
        local: &AccessControlDocument,
        remote: &AccessControlDocument,
    ) -> Result<AccessControlDocument, AccessError> {
        if local.snapshot != remote.snapshot || local.folder != remote.folder {
            return Err(AccessError::Untrusted(format!(
                "access control documents for {} have different snapshots",
                local.folder
            )));
        }
        let deltas = local
            .applied
            .iter()
            .chain(remote.applied.iter())
            .cloned()
            .collect::<Vec<_>>();
        Ok(self.replay(&local.folder, local.snapshot.clone(), deltas))
    }
}
