// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Advisory locks keyed by flow id.
//!
//! Locks are advisory: code that skips them is not prevented from mutating
//! state. Every flow mutation in this crate goes through [`with_lock`], which
//! releases on every path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use redis::Script;
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Interval between acquisition attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Deletes the key only if it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Proof of a held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub token: String,
}

/// Mutual exclusion across server instances.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire `key`, waiting at most `timeout`.
    ///
    /// Returns [`Error::Conflict`] if the lock is still held at the deadline.
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockHandle>;

    /// Release a held lock.
    async fn release(&self, handle: LockHandle) -> Result<()>;
}

/// Run `f` while holding `key`. The lock is released whether `f` succeeds
/// or fails.
pub async fn with_lock<T, F, Fut>(
    lock: &dyn DistributedLock,
    key: &str,
    timeout: Duration,
    f: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let handle = lock.acquire(key, timeout).await?;
    let result = f().await;
    if let Err(e) = lock.release(handle).await {
        warn!(key = %key, error = %e, "Failed to release lock");
    }
    result
}

fn lock_timeout(key: &str) -> Error {
    Error::Conflict(format!("Timed out acquiring lock {}", key))
}

/// Lock stored in Redis with `SET NX PX`.
pub struct RedisLock {
    conn: ConnectionManager,
    prefix: String,
    lease: Duration,
    release: Script,
}

impl RedisLock {
    /// Create a lock whose keys live under `prefix` and expire after `lease`
    /// if never released.
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>, lease: Duration) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            lease,
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.prefix, key)
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockHandle> {
        let lock_key = self.lock_key(key);
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;
        let mut conn = self.conn.clone();

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&lock_key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.lease.as_millis() as u64)
                .query_async(&mut conn)
                .await?;

            if acquired.is_some() {
                debug!(key = %key, "Lock acquired");
                return Ok(LockHandle {
                    key: key.to_string(),
                    token,
                });
            }
            if Instant::now() >= deadline {
                return Err(lock_timeout(key));
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<()> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(self.lock_key(&handle.key))
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            warn!(key = %handle.key, "Lock expired before release");
        }
        Ok(())
    }
}

/// In-process lock for single-instance deployments and tests.
#[derive(Default, Clone)]
pub struct MemoryLock {
    held: Arc<DashMap<String, String>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held.
    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains_key(key)
    }

    fn try_acquire(&self, key: &str, token: &str) -> bool {
        match self.held.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(token.to_string());
                true
            }
        }
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockHandle> {
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire(key, &token) {
                return Ok(LockHandle {
                    key: key.to_string(),
                    token,
                });
            }
            if Instant::now() >= deadline {
                return Err(lock_timeout(key));
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<()> {
        self.held
            .remove_if(&handle.key, |_, token| *token == handle.token);
        Ok(())
    }
}
