//! Per-key mutual exclusion
//!
//! Wraps the read-classify-act sequence for one partition key so that two
//! workers sharing a store can never both act on the same `next` value.
//! Different keys never contend. Idle entries are dropped when the last
//! guard for a key is released.

use crate::PartitionKey;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map of per-key async mutexes
#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    locks: Arc<DashMap<PartitionKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    /// Create empty lock map
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &PartitionKey) -> KeyGuard {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = mutex.lock_owned().await;

        KeyGuard {
            guard: Some(guard),
            key: key.clone(),
            locks: self.locks.clone(),
        }
    }

    /// Keys currently locked or awaited
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive access to one key until dropped
#[derive(Debug)]
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: PartitionKey,
    locks: Arc<DashMap<PartitionKey, Arc<Mutex<()>>>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release first so the strong count below reflects only other holders
        drop(self.guard.take());
        // Map holds one reference; more means someone else is waiting
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
