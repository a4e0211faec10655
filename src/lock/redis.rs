//! Distributed lock store over one or more Redis instances (Redlock).
//!
//! An attempt sets `key = token` with `NX PX ttl` on every instance and
//! succeeds when a majority accepted it and time remains on the lease after
//! subtracting the time spent and the clock drift allowance. A failed
//! attempt unlocks whatever it did take. Release deletes only if the stored
//! value still equals the token.

use crate::error::LockError;
use crate::lock::{LockStore, LockToken};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "syncstore:lock:";

/// Lease used when the caller asks for no auto-release. Redis locks always
/// expire so a crashed holder cannot wedge the key forever.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

const UNLOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Minimum number of instances that must agree.
pub fn quorum(instances: usize) -> usize {
    instances / 2 + 1
}

/// Time left on a lease after `elapsed`, or `None` if it has run out.
pub fn remaining_validity(lease: Duration, elapsed: Duration) -> Option<Duration> {
    let drift = lease / 100 + Duration::from_millis(2);
    lease
        .checked_sub(elapsed)
        .and_then(|left| left.checked_sub(drift))
        .filter(|left| !left.is_zero())
}

pub struct RedisLockStore {
    clients: Vec<::redis::Client>,
}

impl RedisLockStore {
    /// `urls` are `redis://` connection strings, one per independent instance.
    pub fn new<S: AsRef<str>>(urls: &[S]) -> Result<Self, LockError> {
        if urls.is_empty() {
            return Err(LockError::Backend("no redis instances configured".to_string()));
        }
        let clients = urls
            .iter()
            .map(|url| ::redis::Client::open(url.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { clients })
    }

    pub fn instance_count(&self) -> usize {
        self.clients.len()
    }

    async fn lock_instance(
        client: &::redis::Client,
        key: &str,
        token: &LockToken,
        lease: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock_instance(
        client: &::redis::Client,
        key: &str,
        token: &LockToken,
    ) -> Result<(), LockError> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _deleted: i64 = ::redis::Script::new(UNLOCK_SCRIPT)
            .key(key)
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn unlock_all(&self, key: &str, token: &LockToken) {
        for client in &self.clients {
            if let Err(err) = Self::unlock_instance(client, key, token).await {
                warn!(key = %key, error = %err, "Failed to unlock redis instance");
            }
        }
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &LockToken,
        auto_release_after: Option<Duration>,
    ) -> Result<bool, LockError> {
        let redis_key = format!("{}{}", KEY_PREFIX, key);
        let lease = auto_release_after.unwrap_or(DEFAULT_LEASE);
        let started = Instant::now();

        let mut accepted = 0;
        let mut failures = 0;
        let mut last_error = None;
        for client in &self.clients {
            match Self::lock_instance(client, &redis_key, token, lease).await {
                Ok(true) => accepted += 1,
                Ok(false) => {}
                Err(err) => {
                    debug!(key = %key, error = %err, "Redis instance rejected lock attempt");
                    failures += 1;
                    last_error = Some(err);
                }
            }
        }

        if accepted >= quorum(self.clients.len())
            && remaining_validity(lease, started.elapsed()).is_some()
        {
            return Ok(true);
        }

        self.unlock_all(&redis_key, token).await;
        match last_error {
            // Every instance failed: report the backend rather than contention.
            Some(err) if failures == self.clients.len() => Err(err),
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &LockToken) {
        self.unlock_all(&format!("{}{}", KEY_PREFIX, key), token).await;
    }
}
