//! bucketcache - Local Disk Cache for a Remote Object Store
//!
//! Keeps byte-exact copies of a bucket's objects on local disk behind a
//! mounted filesystem, bounded by an optional byte limit, and proves them
//! identical to the remote copies with CRC-64 checksums.
//!
//! # Architecture
//!
//! ```text
//! mount layer ──FsEvent──▶ Admission Controller ──▶ Data Store + Metadata Store
//!                                   │
//!                                   └──notify──▶ Eviction Engine (background)
//!
//! Consistency Verifier ──head/get──▶ RemoteStore
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Remote store and event publisher implementations
//! - [`cache`] - Admission, eviction and the two on-disk stores
//! - [`checksum`] - CRC-64/XZ helpers
//! - [`config`] - Configuration and credentials
//! - [`context`] - Per-bucket context object
//! - [`domain`] - Ports and events
//! - [`error`] - Error types
//! - [`verify`] - Local/remote consistency checks

pub mod adapters;
pub mod cache;
pub mod checksum;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod verify;

// Re-export commonly used types
pub use cache::{AdmissionOutcome, Cache, CacheEntry, CacheKey, Content, EntryAttrs, FsEvent};
pub use config::{CacheConfig, CacheLimit, Credentials};
pub use context::CacheContext;
pub use error::{Error, Result};
pub use verify::{ConsistencyVerifier, VerifyMode, VerifyReport};
