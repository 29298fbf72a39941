//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions the cache depends on. Infrastructure adapters implement
//! these traits so the cache and verifier can be driven by a real bucket,
//! a local directory, or an in-memory double.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │         RemoteStore        │     EventPublisher      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  InMemoryRemote │ DirectoryRemote │ LoggingPublisher │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use bytes::Bytes;

use super::events::CacheEvent;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Head metadata of a remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObjectRef {
    pub bucket: String,
    pub key: String,
    pub content_length: u64,
    /// Server-side CRC-64/XZ; `None` when the store did not report one
    pub crc64: Option<u64>,
}

/// Half-open byte range `[start, end)`; `end = None` reads to the end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// The whole object
    pub fn full() -> Self {
        Self {
            start: 0,
            end: None,
        }
    }

    /// The first `len` bytes
    pub fn prefix(len: u64) -> Self {
        Self {
            start: 0,
            end: Some(len),
        }
    }

    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Clamp against an object of `len` bytes, returning `(start, end)`
    pub fn clamp(&self, len: u64) -> (u64, u64) {
        let end = self.end.map_or(len, |e| e.min(len));
        let start = self.start.min(end);
        (start, end)
    }
}

impl Default for ByteRange {
    fn default() -> Self {
        Self::full()
    }
}

// =============================================================================
// Remote Store Port
// =============================================================================

/// Port for the remote object store that the cache fronts.
///
/// Missing objects are reported as `Error::ObjectNotFound`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch length and checksum of an object.
    async fn head(&self, bucket: &str, key: &str) -> Result<RemoteObjectRef>;

    /// Fetch a byte range of an object.
    async fn get(&self, bucket: &str, key: &str, range: ByteRange) -> Result<Bytes>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing cache events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a cache event.
    async fn publish(&self, event: CacheEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<CacheEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
