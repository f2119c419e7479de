//! Named async locks
//!
//! A [`LockManager`] hands out one async mutex per key. The returned
//! [`LockGuard`] releases the lock when dropped, on every exit path, and
//! reclaims the map entry once nobody holds or waits for it.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Keyed lock registry
#[derive(Clone, Default)]
pub struct LockManager {
    locks: Arc<LockMap>,
}

/// Scoped guard for a named lock
pub struct LockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: Arc<LockMap>,
}

impl LockManager {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Acquire the lock for `key`, waiting for the current holder
    pub async fn lock(&self, key: &str) -> LockGuard {
        let guard = self.slot(key).lock_owned().await;
        LockGuard {
            guard: Some(guard),
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys currently held or waited on
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Check whether no key is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl LockGuard {
    /// Key this guard holds
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}
