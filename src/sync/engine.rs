//! Push/pull driver.
//!
//! Every item is one task on the [`TaskQueue`], keyed `pull:<path>` or
//! `push:<path>` and versioned by the hash it is chasing, so repeated
//! triggers for the same content collapse. A task holds the path's lock
//! while it talks to the remote and writes, then schedules the children
//! whose hashes differ. The folder's access control document is handled
//! inline before any child is scheduled.

use crate::access::TrustAnchor;
use crate::crypto::PublicKeySet;
use crate::error::{ErrorKind, LockError, SyncError};
use crate::lock::{with_lock, AcquireOptions, LockStore};
use crate::queue::{AddOptions, TaskQueue};
use crate::store::maintenance::refresh_hash;
use crate::store::StoreBacking;
use crate::sync::materialize::{Materializer, WriteOutcome};
use crate::sync::{
    describe, ItemDescription, PullRequest, PullResponse, PushRequest, RegisterRequest,
    RegisterResponse, RemoteAccessor,
};
use crate::tree::path::is_access_control_id;
use crate::tree::SyncablePath;
use crate::types::{Hash, ItemId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where an item stands in the current sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemSyncState {
    Absent,
    Pulling,
    Materializing,
    Pushing,
    Present,
    Failed(String),
}

/// One item that could not be synchronized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub path: SyncablePath,
    pub kind: ErrorKind,
    pub message: String,
}

impl SyncFailure {
    pub fn to_error(&self) -> SyncError {
        let message = self.message.clone();
        match self.kind {
            ErrorKind::NotFound => SyncError::NotFound(message),
            ErrorKind::Conflict => SyncError::Conflict(message),
            ErrorKind::OutOfDate => SyncError::OutOfDate(message),
            ErrorKind::Untrusted => SyncError::Untrusted(message),
            ErrorKind::LockTimeout => SyncError::Lock(LockError::Timeout(self.path.to_string())),
            ErrorKind::WrongType | ErrorKind::Generic => SyncError::Generic(message),
        }
    }
}

/// Outcome of one `pull` or `push`. Task failures are swallowed by the
/// queue, so this is where they surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Items written locally
    pub written: usize,
    /// Items created or replaced on the remote
    pub pushed: usize,
    /// Items found already in sync
    pub unchanged: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Forwarded to the remote with every request.
    pub remote_id: Option<String>,
    pub lock: AcquireOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Pull,
    Push,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        })
    }
}

type SharedReport = Arc<Mutex<SyncReport>>;

struct EngineInner {
    backing: Arc<dyn StoreBacking>,
    remote: Arc<dyn RemoteAccessor>,
    queue: Arc<TaskQueue>,
    locks: Arc<dyn LockStore>,
    materializer: Materializer,
    options: EngineOptions,
    states: RwLock<HashMap<SyncablePath, ItemSyncState>>,
}

/// Reconciles a local store with one remote.
///
/// The queue must be started by its owner; the engine only adds to it.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        backing: Arc<dyn StoreBacking>,
        remote: Arc<dyn RemoteAccessor>,
        queue: Arc<TaskQueue>,
        locks: Arc<dyn LockStore>,
        trust: Arc<TrustAnchor>,
        options: EngineOptions,
    ) -> Self {
        let materializer = Materializer::new(backing.clone(), trust);
        Self {
            inner: Arc::new(EngineInner {
                backing,
                remote,
                queue,
                locks,
                materializer,
                options,
                states: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn state(&self, path: &SyncablePath) -> ItemSyncState {
        self.inner
            .states
            .read()
            .get(path)
            .cloned()
            .unwrap_or(ItemSyncState::Absent)
    }

    /// Register this storage root with the remote.
    ///
    /// An existing registration is accepted only if it names the same
    /// creator; a different creator is a `Conflict`.
    pub async fn ensure_registered(&self, name: &str, creator: &PublicKeySet) -> Result<(), SyncError> {
        let storage_root_id = self.inner.backing.storage_root_id().clone();
        let response = self
            .inner
            .remote
            .register(RegisterRequest {
                name: name.to_string(),
                storage_root_id: storage_root_id.clone(),
                creator_public_keys: creator.clone(),
            })
            .await?;
        match response {
            RegisterResponse::Created => {
                info!(storage_root = %storage_root_id, name = %name, "Registered storage root");
                Ok(())
            }
            RegisterResponse::AlreadyCreated {
                creator_public_key_set_id,
            } if creator_public_key_set_id == creator.id => {
                debug!(storage_root = %storage_root_id, "Storage root already registered");
                Ok(())
            }
            RegisterResponse::AlreadyCreated {
                creator_public_key_set_id,
            } => Err(SyncError::Conflict(format!(
                "{} is registered to {}, not {}",
                storage_root_id, creator_public_key_set_id, creator.id
            ))),
        }
    }

    /// Bring `path` and everything under it up to date from the remote.
    ///
    /// Fails if `path` itself could not be pulled; failures deeper down are
    /// listed in the report.
    pub async fn pull(&self, path: &SyncablePath) -> Result<SyncReport, SyncError> {
        self.run(Direction::Pull, path).await
    }

    /// Send `path` and everything under it that the remote lacks.
    pub async fn push(&self, path: &SyncablePath) -> Result<SyncReport, SyncError> {
        self.run(Direction::Push, path).await
    }

    async fn run(&self, direction: Direction, path: &SyncablePath) -> Result<SyncReport, SyncError> {
        // A stopped queue would settle immediately with nothing done.
        if !self.inner.queue.is_running() {
            return Err(SyncError::Generic(format!(
                "cannot sync {}: task queue is not started",
                path
            )));
        }
        let report: SharedReport = Arc::new(Mutex::new(SyncReport::default()));
        EngineInner::schedule(&self.inner, direction, path.clone(), None, report.clone());
        self.inner.queue.wait().await;

        let report = report.lock().clone();
        if let Some(failure) = report.failures.iter().find(|failure| failure.path == *path) {
            return Err(failure.to_error());
        }
        info!(
            direction = %direction,
            path = %path,
            written = report.written,
            pushed = report.pushed,
            unchanged = report.unchanged,
            failed = report.failures.len(),
            "Sync finished"
        );
        Ok(report)
    }
}

impl EngineInner {
    fn schedule(
        inner: &Arc<Self>,
        direction: Direction,
        path: SyncablePath,
        version: Option<Hash>,
        report: SharedReport,
    ) {
        let key = format!("{}:{}", direction, path);
        let options = AddOptions {
            version: version.map(|hash| hash.to_hex()),
            ..AddOptions::default()
        };
        let engine = Arc::clone(inner);
        inner.queue.add(key, options, move || async move {
            let result = match direction {
                Direction::Pull => engine.pull_item(&path, &report).await,
                Direction::Push => engine.push_item(&path, &report).await,
            };
            if let Err(err) = &result {
                engine.record_failure(&path, err, &report);
            }
            result.map_err(anyhow::Error::from)
        });
    }

    fn set_state(&self, path: &SyncablePath, state: ItemSyncState) {
        self.states.write().insert(path.clone(), state);
    }

    fn record_failure(&self, path: &SyncablePath, err: &SyncError, report: &SharedReport) {
        self.set_state(path, ItemSyncState::Failed(err.to_string()));
        report.lock().failures.push(SyncFailure {
            path: path.clone(),
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn lock_key(path: &SyncablePath) -> String {
        path.to_string()
    }

    async fn local_hash(&self, path: &SyncablePath) -> Result<Option<Hash>, SyncError> {
        match refresh_hash(self.backing.as_ref(), path).await {
            Ok(hash) => Ok(Some(hash)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn local_child_hashes(&self, path: &SyncablePath) -> Result<BTreeMap<ItemId, Hash>, SyncError> {
        Ok(self
            .backing
            .get_metadata_by_id_in_path(path, None)
            .await?
            .into_iter()
            .filter(|(_, metadata)| !metadata.local.is_deleted_locally)
            .map(|(id, metadata)| (id, metadata.hash))
            .collect())
    }

    /// Fetch one item and write it. `None` when the local copy is current.
    async fn fetch_and_write(
        &self,
        path: &SyncablePath,
        report: &SharedReport,
    ) -> Result<Option<ItemDescription>, SyncError> {
        self.set_state(path, ItemSyncState::Pulling);
        with_lock(self.locks.as_ref(), &Self::lock_key(path), self.options.lock, || {
            self.fetch_and_write_locked(path, report)
        })
        .await
    }

    async fn fetch_and_write_locked(
        &self,
        path: &SyncablePath,
        report: &SharedReport,
    ) -> Result<Option<ItemDescription>, SyncError> {
        let local_hash = self.local_hash(path).await?;
        let response = self
            .remote
            .pull(PullRequest {
                remote_id: self.options.remote_id.clone(),
                path: path.clone(),
                hash: local_hash,
                send_data: true,
            })
            .await?;

        let item = match response {
            PullResponse::Unchanged { .. } => {
                debug!(path = %path, "Pull unchanged");
                self.set_state(path, ItemSyncState::Present);
                report.lock().unchanged += 1;
                return Ok(None);
            }
            PullResponse::Item { item } => item,
        };

        self.set_state(path, ItemSyncState::Materializing);
        match self.materializer.write_item(path, &item).await? {
            WriteOutcome::Created | WriteOutcome::Replaced => report.lock().written += 1,
            WriteOutcome::Unchanged => {}
        }
        self.set_state(path, ItemSyncState::Present);
        Ok(Some(item))
    }

    async fn pull_item(self: &Arc<Self>, path: &SyncablePath, report: &SharedReport) -> Result<(), SyncError> {
        let Some(item) = self.fetch_and_write(path, report).await? else {
            return Ok(());
        };
        let Some(children) = item.items_by_id else {
            return Ok(());
        };

        let local = self.local_child_hashes(path).await?;
        let (documents, rest): (Vec<_>, Vec<_>) =
            children.into_iter().partition(|(id, _)| is_access_control_id(id));

        // Siblings are verified against the document, so it goes first.
        for (id, child) in documents {
            if local.get(&id) != Some(&child.hash()) {
                let child_path = path.append(id)?;
                self.fetch_and_write(&child_path, report).await?;
            }
        }

        for (id, child) in rest {
            if local.get(&id) == Some(&child.hash()) {
                report.lock().unchanged += 1;
                continue;
            }
            let child_path = path.append(id)?;
            Self::schedule(self, Direction::Pull, child_path, Some(child.hash()), report.clone());
        }
        Ok(())
    }

    async fn send(
        &self,
        path: &SyncablePath,
        item: ItemDescription,
        report: &SharedReport,
    ) -> Result<(), SyncError> {
        let response = self
            .remote
            .push(PushRequest {
                remote_id: self.options.remote_id.clone(),
                item_type: item.item_type(),
                path: path.clone(),
                item,
            })
            .await?;
        let mut report = report.lock();
        report.pushed += response.created + response.replaced;
        report.unchanged += response.unchanged;
        for (failed_path, message) in response.failed {
            warn!(path = %failed_path, error = %message, "Remote rejected pushed item");
            report.failures.push(SyncFailure {
                path: failed_path,
                kind: ErrorKind::Untrusted,
                message,
            });
        }
        Ok(())
    }

    /// Compare one item with the remote and send it if the remote lacks it
    /// or holds a different file. Returns the remote's shallow description
    /// of a folder whose children need a closer look.
    async fn push_one(
        &self,
        path: &SyncablePath,
        report: &SharedReport,
    ) -> Result<Option<ItemDescription>, SyncError> {
        self.set_state(path, ItemSyncState::Pushing);
        with_lock(self.locks.as_ref(), &Self::lock_key(path), self.options.lock, || {
            self.push_one_locked(path, report)
        })
        .await
    }

    async fn push_one_locked(
        &self,
        path: &SyncablePath,
        report: &SharedReport,
    ) -> Result<Option<ItemDescription>, SyncError> {
        let local_hash = refresh_hash(self.backing.as_ref(), path).await?;
        let response = self
            .remote
            .pull(PullRequest {
                remote_id: self.options.remote_id.clone(),
                path: path.clone(),
                hash: Some(local_hash),
                send_data: false,
            })
            .await;

        let remote = match response {
            Ok(PullResponse::Unchanged { .. }) => {
                debug!(path = %path, "Push unchanged");
                report.lock().unchanged += 1;
                None
            }
            Err(SyncError::NotFound(_)) => {
                let item = describe(self.backing.as_ref(), path, true, true).await?;
                self.send(path, item, report).await?;
                None
            }
            Ok(PullResponse::Item { item }) if !item.item_type().is_folder_like() => {
                let item = describe(self.backing.as_ref(), path, true, false).await?;
                self.send(path, item, report).await?;
                None
            }
            Ok(PullResponse::Item { item }) => Some(item),
            Err(err) => return Err(err),
        };
        self.set_state(path, ItemSyncState::Present);
        Ok(remote)
    }

    async fn push_item(self: &Arc<Self>, path: &SyncablePath, report: &SharedReport) -> Result<(), SyncError> {
        let Some(remote) = self.push_one(path, report).await? else {
            return Ok(());
        };
        let remote_children: BTreeMap<ItemId, Hash> = remote
            .items_by_id
            .unwrap_or_default()
            .into_iter()
            .map(|(id, child)| (id, child.hash()))
            .collect();

        let local = self.local_child_hashes(path).await?;
        let (documents, rest): (Vec<_>, Vec<_>) =
            local.into_iter().partition(|(id, _)| is_access_control_id(id));

        for (id, hash) in documents {
            if remote_children.get(&id) != Some(&hash) {
                let child_path = path.append(id)?;
                self.push_one(&child_path, report).await?;
            }
        }

        for (id, hash) in rest {
            if remote_children.get(&id) == Some(&hash) {
                report.lock().unchanged += 1;
                continue;
            }
            let child_path = path.append(id)?;
            Self::schedule(self, Direction::Push, child_path, Some(hash), report.clone());
        }
        Ok(())
    }
}
