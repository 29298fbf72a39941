//! Admission Controller
//!
//! The single place where cache entries change. Every mutating filesystem
//! operation lands here after it has completed against the remote side.
//!
//! # Design
//!
//! - Data is written first, the stat record second; if the second step
//!   fails the first is rolled back before returning
//! - Any local failure degrades to pass-through for that key: the key is
//!   purged and the operation is served uncached
//! - Every operation on a key holds that key's lock; eviction takes the
//!   same lock, so it never races an admission of the same key
//! - Eviction is requested after the lock is released and never awaited

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use super::entry::{AttrChange, CacheEntry, CacheKey, Content, EntryAttrs, StatRecord};
use super::eviction::{evict_pass, expire_pass, EvictionEngine, EvictionReport};
use super::layout::{walk_files, CacheLayout};
use super::locks::OpenHandle;
use super::metrics::MetricsSnapshot;
use super::policy::EvictionPolicy;
use super::state::CacheState;
use crate::config::{CacheConfig, CacheLimit};
use crate::domain::events::CacheEvent;
use crate::domain::ports::{ByteRange, EventPublisher, RemoteStore};
use crate::error::{Error, Result};

// =============================================================================
// Operations and Outcomes
// =============================================================================

/// Completed filesystem operation reported by the mount layer
#[derive(Debug, Clone)]
pub enum FsEvent {
    /// File content was written (created or replaced)
    Write {
        key: CacheKey,
        content: Content,
        attrs: EntryAttrs,
    },
    /// File was resized; growing zero-fills, shrinking discards
    Truncate { key: CacheKey, len: u64 },
    /// File moved within the mount
    Rename { from: CacheKey, to: CacheKey },
    /// File deleted
    Delete { key: CacheKey },
    /// chmod / chown / utimens
    SetAttr { key: CacheKey, change: AttrChange },
}

impl FsEvent {
    /// Key whose entry ends up changed (the destination for renames)
    pub fn key(&self) -> &CacheKey {
        match self {
            FsEvent::Write { key, .. }
            | FsEvent::Truncate { key, .. }
            | FsEvent::Delete { key }
            | FsEvent::SetAttr { key, .. } => key,
            FsEvent::Rename { to, .. } => to,
        }
    }
}

/// What the controller did with an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Entry is resident with `bytes` of content
    Cached { bytes: u64 },
    /// Served uncached; the key is absent from both stores
    PassThrough { reason: String },
    /// Entry was removed from both stores
    Removed,
    /// Nothing was cached for the key, nothing changed
    NotCached,
}

impl AdmissionOutcome {
    pub fn is_cached(&self) -> bool {
        matches!(self, AdmissionOutcome::Cached { .. })
    }
}

/// On-disk consistency report of both subtrees
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Keys present in both subtrees
    pub entries: usize,
    /// Sum of data file lengths
    pub total_bytes: u64,
    /// Data file without a stat record
    pub data_only: Vec<CacheKey>,
    /// Stat record without a data file
    pub meta_only: Vec<CacheKey>,
    /// Stat record size differs from the data file length
    pub size_mismatch: Vec<CacheKey>,
}

impl ScanReport {
    pub fn is_consistent(&self) -> bool {
        self.data_only.is_empty() && self.meta_only.is_empty() && self.size_mismatch.is_empty()
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Local disk cache for one bucket
pub struct Cache {
    state: Arc<CacheState>,
    engine: EvictionEngine,
}

impl Cache {
    /// Open (or create) the cache described by `config`.
    pub async fn open(config: &CacheConfig, publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        let layout = CacheLayout::new(&config.cache_root, &config.bucket_name);
        let policy = EvictionPolicy::new(config.limit(), config.expire_after());
        Self::with_layout(layout, policy, config.scan_interval(), publisher).await
    }

    /// Open a cache on an explicit layout.
    ///
    /// Rebuilds both indexes from disk and drops half-present entries before
    /// the first operation. `scan_interval` only matters with idle expiry.
    pub async fn with_layout(
        layout: CacheLayout,
        policy: EvictionPolicy,
        scan_interval: Duration,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        layout.create_dirs().await?;
        let state = Arc::new(CacheState::new(layout, policy, publisher));

        let stat_records = state.meta.load().await?;
        let data_files = state.data.load().await?;
        let dropped = reconcile(&state).await?;
        info!(
            root = %state.layout.root().display(),
            stat_records,
            data_files,
            dropped,
            total_bytes = state.data.total_bytes(),
            limit = ?policy.limit.max_total_bytes,
            "Cache opened"
        );

        let expiry_interval = policy.expire_after.map(|_| scan_interval);
        let engine = EvictionEngine::spawn(state.clone(), expiry_interval);
        let cache = Self { state, engine };
        if cache.state.policy.limit.exceeded_by(cache.total_bytes()) {
            cache.request_eviction(None);
        }
        Ok(cache)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Apply a completed filesystem operation
    pub async fn apply(&self, event: FsEvent) -> Result<AdmissionOutcome> {
        match event {
            FsEvent::Write {
                key,
                content,
                attrs,
            } => self.write(&key, content, attrs).await,
            FsEvent::Truncate { key, len } => self.truncate(&key, len).await,
            FsEvent::Rename { from, to } => self.rename(&from, &to).await,
            FsEvent::Delete { key } => self.remove(&key).await,
            FsEvent::SetAttr { key, change } => self.set_attr(&key, change).await,
        }
    }

    /// Admit new content for `key`, replacing what was cached.
    ///
    /// Content larger than the whole limit is never retained.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn write(
        &self,
        key: &CacheKey,
        content: impl Into<Content>,
        attrs: EntryAttrs,
    ) -> Result<AdmissionOutcome> {
        let content = content.into();
        let guard = self.state.locks.lock(key).await;

        if let Some(len) = content_len(&content).await {
            if !self.state.policy.limit.admits(len) {
                self.state.purge(key).await?;
                return Ok(self
                    .pass_through(key, format!("{} bytes exceed the cache limit", len))
                    .await);
            }
        }

        let written = match &content {
            Content::Bytes(bytes) => self.state.data.write(key, bytes).await,
            Content::File(path) => self.state.data.write_file(key, path).await,
        };
        let size = match written {
            Ok(size) => size,
            Err(e) => return self.fall_back(key, e).await,
        };

        let record = StatRecord::new(size, attrs, self.state.meta.stamp());
        if let Err(e) = self.state.meta.put(key, &record).await {
            self.state.metrics.record_rollback();
            return self.fall_back(key, e).await;
        }

        self.state.metrics.record_admission(size);
        debug!(key = %key, bytes = size, "Admitted cache entry");
        self.state
            .publish(CacheEvent::admitted(key.as_str(), size))
            .await;

        drop(guard);
        self.request_eviction(Some(key));
        Ok(AdmissionOutcome::Cached { bytes: size })
    }

    /// Resize a resident entry
    #[instrument(skip_all, fields(key = %key))]
    pub async fn truncate(&self, key: &CacheKey, len: u64) -> Result<AdmissionOutcome> {
        let guard = self.state.locks.lock(key).await;
        let Some(mut record) = self.resident_record(key) else {
            return Ok(AdmissionOutcome::NotCached);
        };

        if !self.state.policy.limit.admits(len) {
            self.state.purge(key).await?;
            return Ok(self
                .pass_through(key, format!("{} bytes exceed the cache limit", len))
                .await);
        }

        match self.state.data.truncate(key, len).await {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(AdmissionOutcome::NotCached),
            Err(e) => return self.fall_back(key, e).await,
        }

        record.size = len;
        record.attrs.mtime = Utc::now();
        record.last_access = self.state.meta.stamp();
        if let Err(e) = self.state.meta.put(key, &record).await {
            self.state.metrics.record_rollback();
            return self.fall_back(key, e).await;
        }
        debug!(key = %key, bytes = len, "Truncated cache entry");

        drop(guard);
        self.request_eviction(Some(key));
        Ok(AdmissionOutcome::Cached { bytes: len })
    }

    /// Update the attributes of a resident entry
    #[instrument(skip_all, fields(key = %key))]
    pub async fn set_attr(&self, key: &CacheKey, change: AttrChange) -> Result<AdmissionOutcome> {
        let _guard = self.state.locks.lock(key).await;
        let Some(mut record) = self.resident_record(key) else {
            return Ok(AdmissionOutcome::NotCached);
        };
        if change.is_empty() {
            return Ok(AdmissionOutcome::Cached { bytes: record.size });
        }

        change.apply_to(&mut record.attrs);
        if let Err(e) = self.state.meta.put(key, &record).await {
            return self.fall_back(key, e).await;
        }
        debug!(key = %key, mode = record.attrs.mode, "Updated cache entry attributes");
        Ok(AdmissionOutcome::Cached { bytes: record.size })
    }

    /// Move a resident entry to `to`, replacing anything cached there.
    ///
    /// If `from` is not cached, a stale copy at `to` is dropped.
    #[instrument(skip_all, fields(from = %from, to = %to))]
    pub async fn rename(&self, from: &CacheKey, to: &CacheKey) -> Result<AdmissionOutcome> {
        let (_from_guard, _to_guard) = self.state.locks.lock_pair(from, to).await;

        if from == to {
            return Ok(match self.resident_record(from) {
                Some(record) => AdmissionOutcome::Cached { bytes: record.size },
                None => AdmissionOutcome::NotCached,
            });
        }

        let Some(mut record) = self.resident_record(from) else {
            self.state.purge(from).await?;
            self.state.purge(to).await?;
            return Ok(AdmissionOutcome::NotCached);
        };

        let size = match self.state.data.rename(from, to).await {
            Ok(Some(size)) => size,
            Ok(None) => return Ok(AdmissionOutcome::NotCached),
            Err(e) => {
                self.state.purge(from).await?;
                return self.fall_back(to, e).await;
            }
        };

        record.size = size;
        record.last_access = self.state.meta.stamp();
        if let Err(e) = self.state.meta.put(to, &record).await {
            self.state.metrics.record_rollback();
            self.state.purge(from).await?;
            return self.fall_back(to, e).await;
        }
        if let Err(e) = self.state.meta.remove(from).await {
            warn!(key = %from, error = %e, "Stat record removal deferred");
        }

        debug!(from = %from, to = %to, bytes = size, "Renamed cache entry");
        self.state
            .publish(CacheEvent::renamed(from.as_str(), to.as_str(), size))
            .await;
        Ok(AdmissionOutcome::Cached { bytes: size })
    }

    /// Remove `key` from both stores before returning
    #[instrument(skip_all, fields(key = %key))]
    pub async fn remove(&self, key: &CacheKey) -> Result<AdmissionOutcome> {
        let _guard = self.state.locks.lock(key).await;
        let present = self.state.data.contains(key) || self.state.meta.exists(key);

        self.state.purge(key).await?;
        if !present {
            return Ok(AdmissionOutcome::NotCached);
        }

        self.state.metrics.record_removal();
        debug!(key = %key, "Removed cache entry");
        self.state.publish(CacheEvent::removed(key.as_str())).await;
        Ok(AdmissionOutcome::Removed)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Cached content of `key`; a hit refreshes its access time
    pub async fn read(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        let _guard = self.state.locks.lock(key).await;
        match self.state.data.read(key).await? {
            Some(bytes) => {
                self.refresh_access(key).await;
                self.state.metrics.record_hit();
                Ok(Some(bytes))
            }
            None => {
                self.state.metrics.record_miss();
                Ok(None)
            }
        }
    }

    /// Read `key`, downloading it from `remote` and admitting it on a miss
    pub async fn read_through(
        &self,
        key: &CacheKey,
        remote: &dyn RemoteStore,
        bucket: &str,
        remote_key: &str,
    ) -> Result<Bytes> {
        if let Some(bytes) = self.read(key).await? {
            return Ok(bytes);
        }
        let bytes = remote.get(bucket, remote_key, ByteRange::full()).await?;
        let outcome = self.write(key, bytes.clone(), EntryAttrs::now()).await?;
        debug!(key = %key, bytes = bytes.len(), outcome = ?outcome, "Fetched from remote");
        Ok(bytes)
    }

    /// Copy the cached content of `key` to `dest`.
    ///
    /// Returns the number of bytes copied, or `None` when not cached.
    pub async fn copy_out(&self, key: &CacheKey, dest: &Path) -> Result<Option<u64>> {
        let _guard = self.state.locks.lock(key).await;
        if !self.state.data.contains(key) {
            return Ok(None);
        }
        let copied = tokio::fs::copy(self.state.data.path(key), dest)
            .await
            .map_err(|e| Error::data_store(key.as_str(), e))?;
        self.refresh_access(key).await;
        Ok(Some(copied))
    }

    /// Open a resident entry; it is not evicted while the handle lives
    pub async fn open_file(&self, key: &CacheKey) -> Result<Option<OpenHandle>> {
        let _guard = self.state.locks.lock(key).await;
        if self.resident_record(key).is_none() {
            return Ok(None);
        }
        self.refresh_access(key).await;
        Ok(Some(OpenHandle::new(key.clone(), self.state.pins.clone())))
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Combined view of one key
    pub fn entry(&self, key: &CacheKey) -> CacheEntry {
        self.state.entry(key)
    }

    /// Fully resident
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.entry(key).is_resident()
    }

    /// Every key known to either store, in key order
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut keys: BTreeSet<CacheKey> = self.state.meta.keys().into_iter().collect();
        keys.extend(self.state.data.keys());
        keys.iter().map(|k| self.state.entry(k)).collect()
    }

    /// Walk both subtrees and compare them path-for-path.
    ///
    /// Meant to be called at quiescence; concurrent operations can show up
    /// as transient differences.
    pub async fn scan(&self) -> Result<ScanReport> {
        let (data_files, _) = walk_files(self.state.layout.data_root()).await?;
        let (stat_files, _) = walk_files(self.state.layout.stat_root()).await?;
        let data: BTreeMap<CacheKey, u64> = data_files.into_iter().collect();
        let stats: BTreeSet<CacheKey> = stat_files.into_iter().map(|(k, _)| k).collect();

        let mut report = ScanReport::default();
        for (key, len) in &data {
            report.total_bytes += len;
            if !stats.contains(key) {
                report.data_only.push(key.clone());
                continue;
            }
            report.entries += 1;
            if self.state.meta.get(key).map(|r| r.size) != Some(*len) {
                report.size_mismatch.push(key.clone());
            }
        }
        report.meta_only = stats
            .into_iter()
            .filter(|k| !data.contains_key(k))
            .collect();
        Ok(report)
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.data.total_bytes()
    }

    /// Number of stat records
    pub fn len(&self) -> usize {
        self.state.meta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.meta.is_empty()
    }

    pub fn limit(&self) -> CacheLimit {
        self.state.policy.limit
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.state.layout
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.state.metrics.snapshot()
    }

    /// Metrics plus usage gauges in Prometheus text format
    pub fn render_metrics(&self) -> Result<String> {
        self.metrics().render_prometheus(
            self.total_bytes(),
            self.len() as u64,
            self.limit().max_total_bytes,
        )
    }

    /// Usage gauges only, in Prometheus text format
    pub fn render_usage(&self) -> Result<String> {
        MetricsSnapshot::render_usage_prometheus(
            self.total_bytes(),
            self.len() as u64,
            self.limit().max_total_bytes,
        )
    }

    // =========================================================================
    // Eviction Control
    // =========================================================================

    /// Wait for eviction work requested by earlier operations
    pub async fn quiesce(&self) {
        self.engine.quiesce().await
    }

    /// Run an eviction pass inline
    pub async fn evict_now(&self) -> EvictionReport {
        evict_pass(&self.state, None).await
    }

    /// Run an idle-expiry pass inline
    pub async fn expire_now(&self) -> EvictionReport {
        expire_pass(&self.state).await
    }

    /// Stop the eviction engine after any in-flight pass
    pub async fn shutdown(&self) {
        self.engine.shutdown().await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn resident_record(&self, key: &CacheKey) -> Option<StatRecord> {
        if !self.state.data.contains(key) {
            return None;
        }
        self.state.meta.get(key)
    }

    async fn refresh_access(&self, key: &CacheKey) {
        if let Err(e) = self.state.meta.touch(key).await {
            warn!(key = %key, error = %e, "Failed to refresh access time");
        }
    }

    fn request_eviction(&self, trigger: Option<&CacheKey>) {
        if let Err(e) = self.engine.notify(trigger.cloned()) {
            debug!(error = %e, "Eviction request dropped");
        }
    }

    /// Purge `key` after a local failure and serve the operation uncached
    async fn fall_back(&self, key: &CacheKey, cause: Error) -> Result<AdmissionOutcome> {
        warn!(key = %key, error = %cause, "Local cache failure; serving uncached");
        if let Err(e) = self.state.purge(key).await {
            error!(key = %key, error = %e, "Rollback failed");
            return Err(e);
        }
        Ok(self.pass_through(key, cause.to_string()).await)
    }

    async fn pass_through(&self, key: &CacheKey, reason: String) -> AdmissionOutcome {
        self.state.metrics.record_pass_through();
        debug!(key = %key, reason = %reason, "Pass-through");
        self.state
            .publish(CacheEvent::pass_through(key.as_str(), reason.clone()))
            .await;
        AdmissionOutcome::PassThrough { reason }
    }
}

/// Length of the content if it can be known before writing
async fn content_len(content: &Content) -> Option<u64> {
    match content {
        Content::Bytes(bytes) => Some(bytes.len() as u64),
        Content::File(path) => tokio::fs::metadata(path).await.ok().map(|m| m.len()),
    }
}

/// Drop every key whose two records disagree; run before the cache is shared
async fn reconcile(state: &CacheState) -> Result<usize> {
    let mut keys: BTreeSet<CacheKey> = state.meta.keys().into_iter().collect();
    keys.extend(state.data.keys());

    let mut dropped = 0;
    for key in keys {
        let consistent = match (state.data.size_of(&key), state.meta.get(&key)) {
            (Some(size), Some(record)) => size == record.size,
            _ => false,
        };
        if !consistent {
            warn!(key = %key, "Dropping half-present cache entry");
            state.purge(&key).await?;
            dropped += 1;
        }
    }
    Ok(dropped)
}
