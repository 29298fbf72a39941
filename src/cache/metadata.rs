//! Metadata Store
//!
//! One JSON stat record per cached key under the hidden stat subtree,
//! plus an in-memory index that answers `exists` and feeds eviction scans
//! without touching the data subtree.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::entry::{CacheKey, StatRecord};
use super::layout::{prune_empty_parents, rename_into, walk_files, CacheLayout};
use crate::error::{Error, Result};

/// Hands out strictly increasing timestamps so LRU order is total even when
/// the wall clock is coarse or steps backwards.
#[derive(Debug)]
pub struct StampClock {
    last: Mutex<DateTime<Utc>>,
}

impl StampClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// Next stamp, never earlier than or equal to the previous one
    pub fn next(&self) -> DateTime<Utc> {
        let mut last = self.last.lock();
        let now = Utc::now();
        let stamp = if now > *last {
            now
        } else {
            *last + chrono::Duration::nanoseconds(1)
        };
        *last = stamp;
        stamp
    }

    /// Make sure future stamps sort after `seen` (used after loading from disk)
    pub fn observe(&self, seen: DateTime<Utc>) {
        let mut last = self.last.lock();
        if seen > *last {
            *last = seen;
        }
    }
}

impl Default for StampClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable per-key stat records
pub struct MetadataStore {
    layout: Arc<CacheLayout>,
    index: RwLock<BTreeMap<CacheKey, StatRecord>>,
    /// Stat files whose removal failed; retried by `retry_orphans`
    orphans: Mutex<Vec<PathBuf>>,
    clock: StampClock,
}

impl MetadataStore {
    pub fn new(layout: Arc<CacheLayout>) -> Self {
        Self {
            layout,
            index: RwLock::new(BTreeMap::new()),
            orphans: Mutex::new(Vec::new()),
            clock: StampClock::new(),
        }
    }

    /// Rebuild the index from the stat subtree.
    ///
    /// Unparseable records and files that do not map to a key are deleted.
    /// Returns the number of records loaded.
    pub async fn load(&self) -> Result<usize> {
        let (files, invalid) = walk_files(self.layout.stat_root())
            .await
            .map_err(|e| Error::metadata("<scan>", e))?;

        for path in invalid {
            warn!(path = %path.display(), "Removing stray file from stat subtree");
            let _ = tokio::fs::remove_file(&path).await;
        }

        let mut loaded = BTreeMap::new();
        for (key, _) in files {
            let path = self.layout.stat_path(&key);
            let raw = tokio::fs::read(&path)
                .await
                .map_err(|e| Error::metadata(key.as_str(), e))?;
            match serde_json::from_slice::<StatRecord>(&raw) {
                Ok(record) => {
                    self.clock.observe(record.last_access);
                    loaded.insert(key, record);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Dropping unreadable stat record");
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }

        let count = loaded.len();
        *self.index.write() = loaded;
        Ok(count)
    }

    /// Next LRU timestamp
    pub fn stamp(&self) -> DateTime<Utc> {
        self.clock.next()
    }

    /// Create or overwrite the record of `key`.
    ///
    /// The record is staged and renamed into place, then published to the
    /// index so concurrent eviction scans see it immediately.
    pub async fn put(&self, key: &CacheKey, record: &StatRecord) -> Result<()> {
        let json = serde_json::to_vec(record)?;
        let tmp = self.layout.tmp_path();
        let dest = self.layout.stat_path(key);

        let staged = async {
            tokio::fs::write(&tmp, &json).await?;
            rename_into(&tmp, &dest).await
        }
        .await;

        if let Err(e) = staged {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::metadata(key.as_str(), e));
        }

        self.index.write().insert(key.clone(), record.clone());
        debug!(key = %key, size = record.size, "Stat record written");
        Ok(())
    }

    /// Record of `key`, if present
    pub fn get(&self, key: &CacheKey) -> Option<StatRecord> {
        self.index.read().get(key).cloned()
    }

    pub fn exists(&self, key: &CacheKey) -> bool {
        self.index.read().contains_key(key)
    }

    /// Remove the record of `key`; absent keys are not an error.
    ///
    /// The key leaves the index unconditionally. If the stat file cannot be
    /// deleted it is queued as an orphan and the error is returned.
    pub async fn remove(&self, key: &CacheKey) -> Result<bool> {
        let was_indexed = self.index.write().remove(key).is_some();
        let path = self.layout.stat_path(key);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                prune_empty_parents(&path, self.layout.stat_root()).await;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(was_indexed),
            Err(e) => {
                self.orphans.lock().push(path);
                Err(Error::metadata(key.as_str(), e))
            }
        }
    }

    /// Refresh the last-access time of a resident key
    pub async fn touch(&self, key: &CacheKey) -> Result<Option<StatRecord>> {
        let Some(mut record) = self.get(key) else {
            return Ok(None);
        };
        record.last_access = self.stamp();
        self.put(key, &record).await?;
        Ok(Some(record))
    }

    /// Retry deleting stat files whose earlier removal failed.
    ///
    /// Orphans that were re-admitted in the meantime are left alone.
    pub async fn retry_orphans(&self) -> usize {
        let pending: Vec<PathBuf> = std::mem::take(&mut *self.orphans.lock());
        let mut cleared = 0;
        for path in pending {
            let rel = path
                .strip_prefix(self.layout.stat_root())
                .ok()
                .and_then(|p| CacheKey::from_relative_path(p).ok());
            if rel.as_ref().is_some_and(|k| self.exists(k)) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => cleared += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => cleared += 1,
                Err(_) => self.orphans.lock().push(path),
            }
        }
        cleared
    }

    /// Number of orphaned stat files awaiting removal
    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    /// Point-in-time copy of all records
    pub fn snapshot(&self) -> Vec<(CacheKey, StatRecord)> {
        self.index
            .read()
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }

    /// All indexed keys
    pub fn keys(&self) -> Vec<CacheKey> {
        self.index.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }
}
