//! Distributed lock interface and bounded acquisition
//!
//! Acquisition is a loop of `try_acquire` calls separated by the retry
//! policy's backoff. Running out of attempts yields
//! [`DiscoveryError::LockTimeout`]; backend errors end the loop at once.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::{debug, warn};

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take `key` if free; `false` when someone else holds it
    async fn try_acquire(&self, key: &str) -> DiscoveryResult<bool>;

    async fn release(&self, key: &str) -> DiscoveryResult<()>;
}

/// Acquire `key`, retrying with backoff up to `policy.max_attempts` times
pub async fn acquire_with_retry(
    lock: &dyn DistributedLock,
    key: &str,
    policy: &RetryPolicy,
) -> DiscoveryResult<()> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 0..attempts {
        if lock.try_acquire(key).await? {
            debug!(key, attempt, "lock acquired");
            return Ok(());
        }
        if attempt + 1 < attempts {
            let delay = policy.delay_for(attempt);
            debug!(key, attempt, delay_ms = delay.as_millis() as u64, "lock busy, backing off");
            tokio::time::sleep(delay).await;
        }
    }

    warn!(key, attempts, "lock acquisition gave up");
    Err(DiscoveryError::LockTimeout {
        key: key.to_string(),
        attempts,
    })
}

/// Lock table local to one process
#[derive(Debug, Default)]
pub struct InMemoryLock {
    held: Mutex<HashSet<String>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(&self, key: &str) -> DiscoveryResult<bool> {
        Ok(self.held.lock().insert(key.to_string()))
    }

    async fn release(&self, key: &str) -> DiscoveryResult<()> {
        self.held.lock().remove(key);
        Ok(())
    }
}
