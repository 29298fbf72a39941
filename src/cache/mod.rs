//! Local Disk Cache
//!
//! Caches objects of one bucket on local disk as two parallel facets: the
//! content and a small stat record. An entry is resident only when both
//! facets are present.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                      Admission Controller (Cache)                         │
//! │        write │ truncate │ rename │ delete │ setattr │ read │ open        │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │   Data Store             │   Metadata Store         │   Key Locks         │
//! │   <root>/<bucket>/<key>  │   <root>/.<bucket>.stat/ │   + Open-handle     │
//! │   atomic total_bytes     │   in-memory index        │     pins            │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                  Eviction Engine (background task)                        │
//! │            LRU under the byte limit  +  optional idle expiry              │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Between operations a key is either resident in both stores or absent
//!   from both
//! - With a limit configured, `total_bytes() <= limit` once `quiesce` returns
//! - Without a limit nothing is ever evicted (idle expiry is opt-in)

mod admission;
mod data;
mod entry;
mod eviction;
mod layout;
mod locks;
mod metadata;
mod metrics;
mod policy;
mod state;

pub use admission::{AdmissionOutcome, Cache, FsEvent, ScanReport};
pub use data::DataStore;
pub use entry::{
    AttrChange, CacheEntry, CacheKey, Content, EntryAttrs, StatRecord, DEFAULT_FILE_MODE,
};
pub use eviction::EvictionReport;
pub use layout::CacheLayout;
pub use locks::{KeyGuard, KeyLocks, OpenHandle, PinTable};
pub use metadata::{MetadataStore, StampClock};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use policy::EvictionPolicy;
