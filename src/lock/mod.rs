//! Lock Store
//!
//! Keyed mutual exclusion across processes. A backend only implements a
//! single non-blocking attempt; the retry loop (fixed delay plus random
//! jitter until the timeout) lives here so every backend behaves the same.
//!
//! `release` is honored only for the token the store currently records for
//! the key. Any other token is a silent no-op, so cleanup paths can release
//! unconditionally.

pub mod file;
pub mod memory;
pub mod redis;

pub use file::FileLockStore;
pub use memory::MemoryLockStore;
pub use self::redis::RedisLockStore;

use crate::error::LockError;
use async_trait::async_trait;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Delay between acquisition attempts, before jitter.
pub const RETRY_DELAY: Duration = Duration::from_millis(50);
/// Upper bound of the random jitter added to each retry delay.
pub const RETRY_JITTER: Duration = Duration::from_millis(50);

/// Single-use proof of ownership of a lock.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::thread_rng().gen();
        LockToken(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockToken({}..)", &self.0[..8.min(self.0.len())])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Give up with `LockError::Timeout` after this long.
    pub timeout: Duration,
    /// Force-release an abandoned lock after this long. `None` holds until
    /// released.
    pub auto_release_after: Option<Duration>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            auto_release_after: Some(Duration::from_secs(60)),
        }
    }
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// One attempt to take `key` for `token`. `Ok(false)` means it is held.
    async fn try_acquire(
        &self,
        key: &str,
        token: &LockToken,
        auto_release_after: Option<Duration>,
    ) -> Result<bool, LockError>;

    /// Release `key` if `token` is its current holder; otherwise do nothing.
    async fn release(&self, key: &str, token: &LockToken);
}

/// Handle for one key of a lock store.
pub struct Lock<'a, S: LockStore + ?Sized> {
    store: &'a S,
    key: String,
}

impl<'a, S: LockStore + ?Sized> Lock<'a, S> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Retry until acquired or `options.timeout` elapses.
    pub async fn acquire(&self, options: AcquireOptions) -> Result<LockToken, LockError> {
        let token = LockToken::generate();
        let deadline = Instant::now() + options.timeout;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if self
                .store
                .try_acquire(&self.key, &token, options.auto_release_after)
                .await?
            {
                debug!(key = %self.key, attempts, "Acquired lock");
                return Ok(token);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(key = %self.key, attempts, "Timed out acquiring lock");
                return Err(LockError::Timeout(self.key.clone()));
            }
            let jitter = rand::thread_rng().gen_range(0..=RETRY_JITTER.as_millis() as u64);
            let delay = RETRY_DELAY + Duration::from_millis(jitter);
            tokio::time::sleep(delay.min(deadline - now)).await;
        }
    }

    pub async fn release(&self, token: &LockToken) {
        self.store.release(&self.key, token).await;
    }
}

/// `store.lock(key).acquire(..)` for any lock store.
pub trait LockStoreExt: LockStore {
    fn lock(&self, key: impl Into<String>) -> Lock<'_, Self> {
        Lock {
            store: self,
            key: key.into(),
        }
    }
}

impl<S: LockStore + ?Sized> LockStoreExt for S {}

/// Run `body` while holding `key`. The lock is released whatever the
/// outcome of `body`.
pub async fn with_lock<S, F, Fut, T, E>(
    store: &S,
    key: &str,
    options: AcquireOptions,
    body: F,
) -> Result<T, E>
where
    S: LockStore + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<LockError>,
{
    let lock = store.lock(key);
    let token = lock.acquire(options).await?;
    let result = body().await;
    lock.release(&token).await;
    result
}
