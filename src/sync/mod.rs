//! Sync Engine
//!
//! Push/pull reconciliation between a local store and a remote replica.
//! Both directions exchange [`ItemDescription`]s and compare content hashes
//! before moving any payload: equal hashes mean the whole subtree is in sync.
//!
//! Wire protocol (JSON bodies):
//!
//! - `POST /pull` [`PullRequest`] -> [`PullResponse`]
//! - `POST /push` [`PushRequest`] -> [`PushResponse`]
//! - `POST /register` [`RegisterRequest`] -> [`RegisterResponse`]
//! - `POST /credentials/store` and `POST /credentials/retrieve`
//!
//! Failures carry a [`WireError`] body.

pub mod engine;
pub mod http;
pub mod materialize;
pub mod server;

pub use engine::{EngineOptions, ItemSyncState, SyncEngine, SyncReport};
pub use http::HttpRemoteAccessor;
pub use materialize::{MaterializeReport, Materializer, WriteOutcome};
pub use server::SyncServer;

use crate::crypto::{hex_bytes, opt_hex_bytes, CryptoKeySet, PublicKeySet, Signature};
use crate::error::{ErrorKind, StoreError, SyncError};
use crate::store::{ExpectedType, ItemMetadata, StoreBacking, StoreItem};
use crate::tree::SyncablePath;
use crate::types::{CryptoKeySetId, Hash, ItemId, ItemType, StorageRootId};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One node as exchanged over the wire. Local-only metadata is never sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescription {
    pub metadata: ItemMetadata,
    /// File bytes. Absent when the receiver only asked for metadata.
    #[serde(default, with = "opt_hex_bytes", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    /// Children of a folder or bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_by_id: Option<BTreeMap<ItemId, ItemDescription>>,
}

impl ItemDescription {
    pub fn item_type(&self) -> ItemType {
        self.metadata.item_type
    }

    pub fn hash(&self) -> Hash {
        self.metadata.hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub path: SyncablePath,
    /// Hash the caller already has. A match short-circuits the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Hash>,
    pub send_data: bool,
}

/// Answer to a pull. A missing item is a `NotFound` error, not a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum PullResponse {
    /// The caller's hash is current; no payload follows.
    Unchanged { hash: Hash },
    /// Folders list their children with metadata only.
    Item { item: ItemDescription },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub path: SyncablePath,
    /// Full description, including every descendant of a folder.
    pub item: ItemDescription,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub created: usize,
    pub replaced: usize,
    pub unchanged: usize,
    /// Branches the receiver rejected, with the reason.
    #[serde(default)]
    pub failed: Vec<(SyncablePath, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub storage_root_id: StorageRootId,
    pub creator_public_keys: PublicKeySet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RegisterResponse {
    Created,
    /// The root exists already; callers must compare the creator themselves.
    AlreadyCreated {
        creator_public_key_set_id: CryptoKeySetId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCredentialsRequest {
    pub user_id: CryptoKeySetId,
    #[serde(with = "hex_bytes")]
    pub encrypted_credentials: Vec<u8>,
    /// Signature over [`credentials_message`] of the payload.
    pub signature: Signature,
}

impl StoreCredentialsRequest {
    pub fn sign(keys: &CryptoKeySet, encrypted_credentials: Vec<u8>) -> Self {
        Self {
            user_id: keys.id().clone(),
            signature: keys.sign(&credentials_message(&encrypted_credentials)),
            encrypted_credentials,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveCredentialsRequest {
    pub user_id: CryptoKeySetId,
    /// Milliseconds since the epoch when the request was signed.
    pub requested_at: i64,
    /// Signature over [`retrieve_credentials_message`].
    pub signature: Signature,
}

impl RetrieveCredentialsRequest {
    pub fn sign(keys: &CryptoKeySet, requested_at: i64) -> Self {
        Self {
            user_id: keys.id().clone(),
            requested_at,
            signature: keys.sign(&retrieve_credentials_message(keys.id(), requested_at)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveCredentialsResponse {
    #[serde(with = "hex_bytes")]
    pub encrypted_credentials: Vec<u8>,
}

pub fn credentials_message(encrypted_credentials: &[u8]) -> Vec<u8> {
    let mut message = b"syncable-store/credentials/v1\n".to_vec();
    message.extend_from_slice(encrypted_credentials);
    message
}

pub fn retrieve_credentials_message(user_id: &CryptoKeySetId, requested_at: i64) -> Vec<u8> {
    format!("syncable-store/credentials-retrieve/v1\n{}\n{}", user_id, requested_at).into_bytes()
}

/// Error body of a failed wire request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl WireError {
    /// HTTP status a server answers with for `err`.
    pub fn status_for(err: &SyncError) -> u16 {
        match err {
            SyncError::NotFound(_) => 404,
            SyncError::Conflict(_) | SyncError::OutOfDate(_) | SyncError::EmailUnavailable(_) => 409,
            SyncError::Untrusted(_) => 403,
            SyncError::Lock(_) => 423,
            SyncError::Transport(_) | SyncError::Generic(_) => 500,
        }
    }

    pub fn into_error(self) -> SyncError {
        match self.code.as_str() {
            "not-found" => SyncError::NotFound(self.message),
            "conflict" => SyncError::Conflict(self.message),
            "out-of-date" => SyncError::OutOfDate(self.message),
            "untrusted" => SyncError::Untrusted(self.message),
            "email-unavailable" => SyncError::EmailUnavailable(self.message),
            _ => SyncError::Generic(self.message),
        }
    }
}

impl From<&SyncError> for WireError {
    fn from(err: &SyncError) -> Self {
        let code = match err {
            SyncError::EmailUnavailable(_) => "email-unavailable",
            other => match other.kind() {
                ErrorKind::NotFound => "not-found",
                ErrorKind::Conflict => "conflict",
                ErrorKind::OutOfDate => "out-of-date",
                ErrorKind::Untrusted => "untrusted",
                ErrorKind::LockTimeout => "lock-timeout",
                ErrorKind::WrongType | ErrorKind::Generic => "generic",
            },
        };
        let message = match err {
            SyncError::NotFound(msg)
            | SyncError::Conflict(msg)
            | SyncError::OutOfDate(msg)
            | SyncError::Untrusted(msg)
            | SyncError::EmailUnavailable(msg)
            | SyncError::Transport(msg)
            | SyncError::Generic(msg) => msg.clone(),
            SyncError::Lock(err) => err.to_string(),
        };
        WireError {
            code: code.to_string(),
            message,
        }
    }
}

/// The remote side of the sync protocol.
#[async_trait]
pub trait RemoteAccessor: Send + Sync {
    async fn pull(&self, request: PullRequest) -> Result<PullResponse, SyncError>;

    async fn push(&self, request: PushRequest) -> Result<PushResponse, SyncError>;

    async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, SyncError>;

    async fn store_credentials(&self, request: StoreCredentialsRequest) -> Result<(), SyncError>;

    async fn retrieve_credentials(
        &self,
        request: RetrieveCredentialsRequest,
    ) -> Result<RetrieveCredentialsResponse, SyncError>;
}

/// Describe the node at `path`.
///
/// Items flagged `is_deleted_locally` are left out. With `deep`, every
/// descendant is included with its data; otherwise a folder lists its
/// children with metadata only and `send_data` decides whether a file's
/// bytes are included. Callers refresh hashes first.
pub fn describe<'a>(
    backing: &'a dyn StoreBacking,
    path: &'a SyncablePath,
    send_data: bool,
    deep: bool,
) -> BoxFuture<'a, Result<ItemDescription, StoreError>> {
    async move {
        let item = backing.get_at_path(path, ExpectedType::Any).await?;
        if item.metadata().local.is_deleted_locally {
            return Err(StoreError::NotFound {
                path: path.to_string(),
                walked: path.parent().map(|p| p.to_string()).unwrap_or_default(),
            });
        }
        match item {
            StoreItem::File { metadata, data } => Ok(ItemDescription {
                metadata: metadata.without_local(),
                data: (send_data || deep).then_some(data),
                items_by_id: None,
            }),
            StoreItem::Folder { metadata, .. } => {
                let children = backing.get_metadata_by_id_in_path(path, None).await?;
                let mut items_by_id = BTreeMap::new();
                for (id, child) in children {
                    if child.local.is_deleted_locally {
                        continue;
                    }
                    let description = if deep {
                        let child_path = path.append(id.clone())?;
                        describe(backing, &child_path, true, true).await?
                    } else {
                        ItemDescription {
                            metadata: child.without_local(),
                            data: None,
                            items_by_id: None,
                        }
                    };
                    items_by_id.insert(id, description);
                }
                Ok(ItemDescription {
                    metadata: metadata.without_local(),
                    data: None,
                    items_by_id: Some(items_by_id),
                })
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockError;

    #[test]
    fn test_wire_error_round_trips_kind() {
        let errors = [
            SyncError::NotFound("sr-x/file_a".to_string()),
            SyncError::EmailUnavailable("alice".to_string()),
            SyncError::Untrusted("bad signature".to_string()),
        ];
        for err in errors {
            let wire = WireError::from(&err);
            let back = wire.clone().into_error();
            assert_eq!(back.kind(), err.kind(), "{:?}", wire);
        }

        let locked = SyncError::Lock(LockError::Timeout("k".to_string()));
        assert_eq!(WireError::status_for(&locked), 423);
        assert_eq!(WireError::from(&locked).code, "lock-timeout");
    }

    #[test]
    fn test_pull_response_is_tagged() {
        let response = PullResponse::Unchanged {
            hash: crate::tree::hasher::compute_file_hash(b"x"),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "unchanged");
    }
}
