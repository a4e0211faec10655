//! In-process lock store. Expired locks are reclaimed lazily on the next attempt.

use crate::error::LockError;
use crate::lock::{LockStore, LockToken};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    token: LockToken,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &LockToken,
        auto_release_after: Option<Duration>,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).map_or(false, |entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                token: token.clone(),
                expires_at: auto_release_after.map(|after| now + after),
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, token: &LockToken) {
        let mut entries = self.entries.lock();
        if entries.get(key).map_or(false, |entry| entry.token == *token) {
            entries.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_expired_entry_is_reclaimed() {
        let store = MemoryLockStore::new();
        let first = LockToken::generate();
        assert!(store
            .try_acquire("k", &first, Some(Duration::from_millis(20)))
            .await
            .unwrap());
        let second = LockToken::generate();
        assert!(!store.try_acquire("k", &second, None).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.try_acquire("k", &second, None).await.unwrap());

        // The expired holder can no longer release the new holder's lock.
        store.release("k", &first).await;
        assert!(!store.try_acquire("k", &first, None).await.unwrap());
    }
}
