//! Domain Layer
//!
//! # Architecture
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for the remote store and event sink
//! - **Events** (`events.rs`) - Cache events for audit and test observation
//!
//! # Usage
//!
//! ```ignore
//! use bucketcache::domain::ports::RemoteStore;
//!
//! async fn remote_len<R: RemoteStore>(remote: &R, bucket: &str, key: &str) -> Result<u64> {
//!     Ok(remote.head(bucket, key).await?.content_length)
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::CacheEvent;
pub use ports::{ByteRange, EventPublisher, RemoteObjectRef, RemoteStore};
