//! In-process remote: the handler semantics of the sync protocol over any
//! [`StoreBacking`]. Each registered storage root gets its own backing.

use crate::access::TrustAnchor;
use crate::crypto::PublicKeySet;
use crate::error::{StoreError, SyncError};
use crate::store::maintenance::refresh_hash;
use crate::store::{InMemoryBacking, StoreBacking};
use crate::sync::materialize::Materializer;
use crate::sync::{
    credentials_message, describe, retrieve_credentials_message, PullRequest, PullResponse, PushRequest, PushResponse,
    RegisterRequest, RegisterResponse, RemoteAccessor, RetrieveCredentialsRequest,
    RetrieveCredentialsResponse, StoreCredentialsRequest,
};
use crate::tree::SyncablePath;
use crate::types::{now_msec, CryptoKeySetId, StorageRootId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// How far a signed credentials retrieval may be from the server clock.
const RETRIEVE_MAX_SKEW_MS: i64 = 5 * 60 * 1000;

/// Creates the backing for a newly registered storage root.
pub type BackingFactory =
    Box<dyn Fn(&StorageRootId) -> Result<Arc<dyn StoreBacking>, StoreError> + Send + Sync>;

struct HostedRoot {
    name: String,
    creator: PublicKeySet,
    backing: Arc<dyn StoreBacking>,
    materializer: Materializer,
}

#[derive(Default)]
struct Registry {
    roots: HashMap<StorageRootId, Arc<HostedRoot>>,
    root_by_name: HashMap<String, StorageRootId>,
    /// Public keys of every registered creator, for credential checks.
    known_keys: HashMap<CryptoKeySetId, PublicKeySet>,
}

pub struct SyncServer {
    registry: RwLock<Registry>,
    credentials: RwLock<HashMap<CryptoKeySetId, Vec<u8>>>,
    factory: BackingFactory,
    time_authority: Option<PublicKeySet>,
}

impl SyncServer {
    pub fn new(factory: BackingFactory) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            credentials: RwLock::new(HashMap::new()),
            factory,
            time_authority: None,
        }
    }

    /// Server whose roots live in memory.
    pub fn in_memory() -> Self {
        Self::new(Box::new(|id: &StorageRootId| {
            Ok(Arc::new(InMemoryBacking::new(id.clone())) as Arc<dyn StoreBacking>)
        }))
    }

    /// Accept trusted time stamps from `authority` on pushed items.
    pub fn with_time_authority(mut self, authority: PublicKeySet) -> Self {
        self.time_authority = Some(authority);
        self
    }

    /// Backing of a registered root.
    pub fn backing(&self, id: &StorageRootId) -> Option<Arc<dyn StoreBacking>> {
        self.registry
            .read()
            .roots
            .get(id)
            .map(|root| root.backing.clone())
    }

    fn known_keys(&self, user_id: &CryptoKeySetId) -> Result<PublicKeySet, SyncError> {
        self.registry
            .read()
            .known_keys
            .get(user_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("unknown user {}", user_id)))
    }

    fn hosted(&self, path: &SyncablePath) -> Result<Arc<HostedRoot>, SyncError> {
        self.registry
            .read()
            .roots
            .get(path.storage_root_id())
            .cloned()
            .ok_or_else(|| {
                SyncError::NotFound(format!(
                    "storage root {} is not registered",
                    path.storage_root_id()
                ))
            })
    }
}

#[async_trait]
impl RemoteAccessor for SyncServer {
    async fn pull(&self, request: PullRequest) -> Result<PullResponse, SyncError> {
        let root = self.hosted(&request.path)?;
        let backing = root.backing.as_ref();
        let path = &request.path;

        let metadata = backing
            .get_metadata_at_path(path)
            .await
            .map_err(StoreError::expect_not_found_only)?;
        if metadata.local.is_deleted_locally {
            return Err(SyncError::NotFound(path.to_string()));
        }

        let hash = refresh_hash(backing, path).await?;
        if request.hash == Some(hash) {
            debug!(path = %path, "Pull short-circuited on hash");
            return Ok(PullResponse::Unchanged { hash });
        }
        let item = describe(backing, path, request.send_data, false).await?;
        Ok(PullResponse::Item { item })
    }

    async fn push(&self, request: PushRequest) -> Result<PushResponse, SyncError> {
        let root = self.hosted(&request.path)?;
        if request.item_type != request.path.item_type()
            || request.item_type != request.item.item_type()
        {
            return Err(SyncError::Untrusted(format!(
                "push of {} declares type {}",
                request.path, request.item_type
            )));
        }

        let report = root
            .materializer
            .materialize(&request.path, &request.item)
            .await?;
        debug!(
            path = %request.path,
            created = report.created,
            replaced = report.replaced,
            failed = report.failures.len(),
            "Accepted push"
        );
        Ok(PushResponse {
            created: report.created,
            replaced: report.replaced,
            unchanged: report.unchanged,
            failed: report
                .failures
                .into_iter()
                .map(|(path, err)| (path, err.to_string()))
                .collect(),
        })
    }

    async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, SyncError> {
        request
            .creator_public_keys
            .validate()
            .map_err(|err| SyncError::Untrusted(err.to_string()))?;

        {
            let registry = self.registry.read();
            if let Some(existing) = registry.roots.get(&request.storage_root_id) {
                return if existing.name == request.name {
                    Ok(RegisterResponse::AlreadyCreated {
                        creator_public_key_set_id: existing.creator.id.clone(),
                    })
                } else {
                    Err(SyncError::Conflict(format!(
                        "{} is registered under another name",
                        request.storage_root_id
                    )))
                };
            }
            if registry.root_by_name.contains_key(&request.name) {
                return Err(SyncError::EmailUnavailable(request.name));
            }
        }

        let backing = (self.factory)(&request.storage_root_id)?;
        let trust = Arc::new(TrustAnchor {
            root_creator: request.creator_public_keys.id.clone(),
            time_authority: self.time_authority.clone(),
        });
        let hosted = Arc::new(HostedRoot {
            name: request.name.clone(),
            creator: request.creator_public_keys.clone(),
            materializer: Materializer::new(backing.clone(), trust),
            backing,
        });

        let mut registry = self.registry.write();
        // Lost a race with a concurrent registration of the same root or name.
        if let Some(existing) = registry.roots.get(&request.storage_root_id) {
            return Ok(RegisterResponse::AlreadyCreated {
                creator_public_key_set_id: existing.creator.id.clone(),
            });
        }
        if registry.root_by_name.contains_key(&request.name) {
            return Err(SyncError::EmailUnavailable(request.name));
        }
        registry
            .root_by_name
            .insert(request.name.clone(), request.storage_root_id.clone());
        registry.known_keys.insert(
            request.creator_public_keys.id.clone(),
            request.creator_public_keys.clone(),
        );
        registry.roots.insert(request.storage_root_id.clone(), hosted);
        info!(
            storage_root = %request.storage_root_id,
            name = %request.name,
            "Registered storage root"
        );
        Ok(RegisterResponse::Created)
    }

    async fn store_credentials(&self, request: StoreCredentialsRequest) -> Result<(), SyncError> {
        let keys = self.known_keys(&request.user_id)?;
        keys.verify(
            &credentials_message(&request.encrypted_credentials),
            &request.signature,
        )
        .map_err(|_| SyncError::Untrusted(format!("bad credentials signature for {}", request.user_id)))?;

        self.credentials
            .write()
            .insert(request.user_id.clone(), request.encrypted_credentials);
        debug!(user = %request.user_id, "Stored credentials");
        Ok(())
    }

    async fn retrieve_credentials(
        &self,
        request: RetrieveCredentialsRequest,
    ) -> Result<RetrieveCredentialsResponse, SyncError> {
        let keys = self.known_keys(&request.user_id)?;
        keys.verify(
            &retrieve_credentials_message(&request.user_id, request.requested_at),
            &request.signature,
        )
        .map_err(|_| SyncError::Untrusted(format!("bad retrieval signature for {}", request.user_id)))?;
        if (now_msec() - request.requested_at).abs() > RETRIEVE_MAX_SKEW_MS {
            return Err(SyncError::Untrusted(format!(
                "stale credentials retrieval for {}",
                request.user_id
            )));
        }

        self.credentials
            .read()
            .get(&request.user_id)
            .cloned()
            .map(|encrypted_credentials| RetrieveCredentialsResponse {
                encrypted_credentials,
            })
            .ok_or_else(|| SyncError::NotFound(format!("no credentials for {}", request.user_id)))
    }
}
