//! File lock store: `<dir>/<key>.lock`, created with exclusive-create
//! semantics, empty, deleted on release.

use crate::error::LockError;
use crate::lock::{LockStore, LockToken};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct HeldLock {
    token: LockToken,
    auto_release: Option<JoinHandle<()>>,
}

type HeldLocks = Arc<Mutex<HashMap<String, HeldLock>>>;

pub struct FileLockStore {
    dir: PathBuf,
    /// Locks held by this process, with their auto-release timers.
    held: HeldLocks,
}

impl FileLockStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LockError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            held: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lock file for `key`. Characters outside `[A-Za-z0-9._-]` are
    /// percent-escaped so path-like keys stay one file name.
    pub fn lock_path(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len() + 5);
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
                name.push(byte as char);
            } else {
                name.push_str(&format!("%{:02X}", byte));
            }
        }
        name.push_str(".lock");
        self.dir.join(name)
    }

    fn schedule_auto_release(
        &self,
        key: &str,
        token: &LockToken,
        path: PathBuf,
        after: Duration,
    ) -> JoinHandle<()> {
        let held = self.held.clone();
        let key = key.to_string();
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let expired = {
                let mut held = held.lock();
                match held.get(&key) {
                    Some(current) if current.token == token => {
                        held.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if expired {
                warn!(key = %key, "Auto-releasing abandoned lock");
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    if err.kind() != ErrorKind::NotFound {
                        warn!(key = %key, error = %err, "Failed to remove lock file");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl LockStore for FileLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &LockToken,
        auto_release_after: Option<Duration>,
    ) -> Result<bool, LockError> {
        let path = self.lock_path(key);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(err.into()),
        }

        let auto_release =
            auto_release_after.map(|after| self.schedule_auto_release(key, token, path.clone(), after));
        self.held.lock().insert(
            key.to_string(),
            HeldLock {
                token: token.clone(),
                auto_release,
            },
        );
        debug!(key = %key, path = ?path, "Created lock file");
        Ok(true)
    }

    async fn release(&self, key: &str, token: &LockToken) {
        let released = {
            let mut held = self.held.lock();
            match held.get(key) {
                Some(current) if current.token == *token => held.remove(key),
                _ => None,
            }
        };
        let Some(released) = released else {
            return;
        };
        if let Some(timer) = released.auto_release {
            timer.abort();
        }
        if let Err(err) = tokio::fs::remove_file(self.lock_path(key)).await {
            if err.kind() != ErrorKind::NotFound {
                warn!(key = %key, error = %err, "Failed to remove lock file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{AcquireOptions, LockStoreExt};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lock_file_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileLockStore::new(temp_dir.path()).unwrap();
        let path = store.lock_path("sr-x/folder_a");
        assert_eq!(path.file_name().unwrap(), "sr-x%2Ffolder_a.lock");

        let token = store
            .lock("sr-x/folder_a")
            .acquire(AcquireOptions::default())
            .await
            .unwrap();
        assert!(path.is_file());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        store.lock("sr-x/folder_a").release(&token).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_mismatched_token_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileLockStore::new(temp_dir.path()).unwrap();
        let token = store.lock("k").acquire(AcquireOptions::default()).await.unwrap();

        store.release("k", &LockToken::generate()).await;
        assert!(store.lock_path("k").exists());
        store.release("k", &token).await;
        store.release("k", &token).await;
        assert!(!store.lock_path("k").exists());
    }

    #[tokio::test]
    async fn test_auto_release_frees_abandoned_lock() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileLockStore::new(temp_dir.path()).unwrap();
        let _abandoned = store
            .lock("k")
            .acquire(AcquireOptions {
                timeout: Duration::from_millis(10),
                auto_release_after: Some(Duration::from_millis(50)),
            })
            .await
            .unwrap();

        let token = store
            .lock("k")
            .acquire(AcquireOptions {
                timeout: Duration::from_secs(2),
                auto_release_after: None,
            })
            .await;
        assert!(token.is_ok());
    }
}
