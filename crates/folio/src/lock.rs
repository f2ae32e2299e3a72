//! Named, timeout-bounded mutual exclusion.
//!
//! The idempotency middleware holds `idempotency:<key>` for the whole
//! start → execute → save sequence so that concurrent first-time requests for
//! the same key run one at a time. The lock is advisory; correctness still
//! rests on the idempotency store's unique constraint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[async_trait]
pub trait Lock: Send + Sync {
    /// Wait up to `timeout` for `name`. Returns `false` on timeout.
    async fn acquire(&self, name: &str, timeout: Duration) -> anyhow::Result<bool>;

    /// Release `name`. Releasing a lock that is not held is a no-op.
    async fn release(&self, name: &str) -> anyhow::Result<()>;
}

/// In-process lock: one tokio mutex per name.
///
/// Only serializes callers sharing this instance; use a database or lock
/// service backed implementation when several processes share a store.
#[derive(Default)]
pub struct LocalLock {
    mutexes: DashMap<String, Arc<Mutex<()>>>,
    held: DashMap<String, OwnedMutexGuard<()>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.contains_key(name)
    }
}

#[async_trait]
impl Lock for LocalLock {
    async fn acquire(&self, name: &str, timeout: Duration) -> anyhow::Result<bool> {
        let mutex = self.mutexes.entry(name.to_string()).or_default().clone();

        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                self.held.insert(name.to_string(), guard);
                debug!(name, "lock acquired");
                Ok(true)
            }
            Err(_) => {
                debug!(name, ?timeout, "lock wait timed out");
                Ok(false)
            }
        }
    }

    async fn release(&self, name: &str) -> anyhow::Result<()> {
        if self.held.remove(name).is_some() {
            debug!(name, "lock released");
        }
        // Forget mutexes nobody is waiting on.
        self.mutexes
            .remove_if(name, |_, mutex| Arc::strong_count(mutex) == 1);
        Ok(())
    }
}
