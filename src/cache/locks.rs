//! Per-key serialization and open-handle pins
//!
//! Admission and eviction of the same key both take that key's lock, so
//! a pair of records is never half-written while another task removes it.
//! Different keys proceed concurrently.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::entry::CacheKey;

/// Guard for exclusive access to one key's pair of records
pub type KeyGuard = OwnedMutexGuard<()>;

/// Lazily populated table of per-key async mutexes
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock of `key`
    pub async fn lock(&self, key: &CacheKey) -> KeyGuard {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Acquire two keys in a global order to avoid lock-order inversion.
    ///
    /// Returns the guard of `a` first; the second guard is `None` when both
    /// keys are equal.
    pub async fn lock_pair(&self, a: &CacheKey, b: &CacheKey) -> (KeyGuard, Option<KeyGuard>) {
        if a == b {
            return (self.lock(a).await, None);
        }
        if a < b {
            let ga = self.lock(a).await;
            let gb = self.lock(b).await;
            (ga, Some(gb))
        } else {
            let gb = self.lock(b).await;
            let ga = self.lock(a).await;
            (ga, Some(gb))
        }
    }

    /// Drop table slots nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Reference counts of open file handles per key
#[derive(Debug, Default)]
pub struct PinTable {
    pins: DashMap<CacheKey, usize>,
}

impl PinTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, key: &CacheKey) {
        *self.pins.entry(key.clone()).or_insert(0) += 1;
    }

    pub fn unpin(&self, key: &CacheKey) {
        self.pins.remove_if_mut(key, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    pub fn is_pinned(&self, key: &CacheKey) -> bool {
        self.pins.get(key).is_some_and(|c| *c > 0)
    }

    pub fn pin_count(&self, key: &CacheKey) -> usize {
        self.pins.get(key).map(|c| *c).unwrap_or(0)
    }
}

/// Open file handle; keeps its entry out of eviction until dropped
#[derive(Debug)]
pub struct OpenHandle {
    key: CacheKey,
    pins: Arc<PinTable>,
}

impl OpenHandle {
    pub(crate) fn new(key: CacheKey, pins: Arc<PinTable>) -> Self {
        pins.pin(&key);
        Self { key, pins }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        self.pins.unpin(&self.key);
    }
}
