//! State shared by the admission path and the eviction engine

use std::sync::Arc;

use tracing::warn;

use super::data::DataStore;
use super::entry::{CacheEntry, CacheKey};
use super::layout::CacheLayout;
use super::locks::{KeyLocks, PinTable};
use super::metadata::MetadataStore;
use super::metrics::CacheMetrics;
use super::policy::EvictionPolicy;
use crate::domain::events::CacheEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

pub(crate) struct CacheState {
    pub layout: Arc<CacheLayout>,
    pub meta: MetadataStore,
    pub data: DataStore,
    pub locks: KeyLocks,
    pub pins: Arc<PinTable>,
    pub metrics: CacheMetrics,
    pub policy: EvictionPolicy,
    publisher: Arc<dyn EventPublisher>,
}

impl CacheState {
    pub fn new(
        layout: CacheLayout,
        policy: EvictionPolicy,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let layout = Arc::new(layout);
        Self {
            meta: MetadataStore::new(layout.clone()),
            data: DataStore::new(layout.clone()),
            layout,
            locks: KeyLocks::new(),
            pins: Arc::new(PinTable::new()),
            metrics: CacheMetrics::new(),
            policy,
            publisher,
        }
    }

    /// Publish an event; failures are logged and dropped
    pub async fn publish(&self, event: CacheEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.publisher.publish(event).await {
            warn!(event_type, error = %e, "Failed to publish cache event");
        }
    }

    /// Remove both records of `key`. The caller holds the key lock.
    ///
    /// Data goes first: if it cannot be removed, both records stay and the
    /// error is returned. A stat file that cannot be deleted leaves the
    /// index anyway and is retried as an orphan, so the entry still reads
    /// as absent on both sides.
    pub async fn purge(&self, key: &CacheKey) -> Result<Option<u64>> {
        let freed = self.data.remove(key).await?;
        if let Err(e) = self.meta.remove(key).await {
            warn!(key = %key, error = %e, "Stat record removal deferred");
        }
        Ok(freed)
    }

    /// Combined view of one key
    pub fn entry(&self, key: &CacheKey) -> CacheEntry {
        let record = self.meta.get(key);
        let data_size = self.data.size_of(key);
        CacheEntry {
            relative_path: key.clone(),
            data_present: data_size.is_some(),
            meta_present: record.is_some(),
            size_bytes: data_size
                .or_else(|| record.as_ref().map(|r| r.size))
                .unwrap_or(0),
            last_access_time: record.as_ref().map(|r| r.last_access),
            last_modify_time: record.as_ref().map(|r| r.attrs.mtime),
        }
    }
}
