//! Cache Events
//!
//! Immutable records of what the cache did to an entry. They feed the
//! audit log and let tests observe eviction decisions without polling the
//! filesystem.
//!
//! # Example
//!
//! ```ignore
//! let event = CacheEvent::evicted("dir/fileA", 5 * 1024 * 1024);
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cache event representing a change to an entry's residency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    // =========================================================================
    // Admission Events
    // =========================================================================
    /// Content and stat record were both written.
    Admitted {
        key: String,
        size_bytes: u64,
        timestamp: DateTime<Utc>,
    },

    /// The operation was served uncached.
    PassThrough {
        key: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Both records were removed by an explicit delete.
    Removed {
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// A resident entry moved to a new key.
    Renamed {
        from: String,
        to: String,
        size_bytes: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Eviction Events
    // =========================================================================
    /// Removed to bring usage back under the size limit.
    Evicted {
        key: String,
        size_bytes: u64,
        timestamp: DateTime<Utc>,
    },

    /// Removed after staying idle past the expiry.
    Expired {
        key: String,
        size_bytes: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Verification Events
    // =========================================================================
    /// Local and remote copies disagree.
    ChecksumMismatch {
        key: String,
        local_len: u64,
        local_crc64: u64,
        remote_len: u64,
        remote_crc64: Option<u64>,
        timestamp: DateTime<Utc>,
    },
}

impl CacheEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CacheEvent::Admitted { timestamp, .. }
            | CacheEvent::PassThrough { timestamp, .. }
            | CacheEvent::Removed { timestamp, .. }
            | CacheEvent::Renamed { timestamp, .. }
            | CacheEvent::Evicted { timestamp, .. }
            | CacheEvent::Expired { timestamp, .. }
            | CacheEvent::ChecksumMismatch { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::Admitted { .. } => "Admitted",
            CacheEvent::PassThrough { .. } => "PassThrough",
            CacheEvent::Removed { .. } => "Removed",
            CacheEvent::Renamed { .. } => "Renamed",
            CacheEvent::Evicted { .. } => "Evicted",
            CacheEvent::Expired { .. } => "Expired",
            CacheEvent::ChecksumMismatch { .. } => "ChecksumMismatch",
        }
    }

    /// Key the event is about (the destination for renames)
    pub fn key(&self) -> &str {
        match self {
            CacheEvent::Admitted { key, .. }
            | CacheEvent::PassThrough { key, .. }
            | CacheEvent::Removed { key, .. }
            | CacheEvent::Evicted { key, .. }
            | CacheEvent::Expired { key, .. }
            | CacheEvent::ChecksumMismatch { key, .. } => key,
            CacheEvent::Renamed { to, .. } => to,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl CacheEvent {
    pub fn admitted(key: impl Into<String>, size_bytes: u64) -> Self {
        CacheEvent::Admitted {
            key: key.into(),
            size_bytes,
            timestamp: Utc::now(),
        }
    }

    pub fn pass_through(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheEvent::PassThrough {
            key: key.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn removed(key: impl Into<String>) -> Self {
        CacheEvent::Removed {
            key: key.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn renamed(from: impl Into<String>, to: impl Into<String>, size_bytes: u64) -> Self {
        CacheEvent::Renamed {
            from: from.into(),
            to: to.into(),
            size_bytes,
            timestamp: Utc::now(),
        }
    }

    pub fn evicted(key: impl Into<String>, size_bytes: u64) -> Self {
        CacheEvent::Evicted {
            key: key.into(),
            size_bytes,
            timestamp: Utc::now(),
        }
    }

    pub fn expired(key: impl Into<String>, size_bytes: u64) -> Self {
        CacheEvent::Expired {
            key: key.into(),
            size_bytes,
            timestamp: Utc::now(),
        }
    }

    pub fn checksum_mismatch(
        key: impl Into<String>,
        local_len: u64,
        local_crc64: u64,
        remote_len: u64,
        remote_crc64: Option<u64>,
    ) -> Self {
        CacheEvent::ChecksumMismatch {
            key: key.into(),
            local_len,
            local_crc64,
            remote_len,
            remote_crc64,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_and_key() {
        let event = CacheEvent::evicted("fileA", 5);
        assert_eq!(event.event_type(), "Evicted");
        assert_eq!(event.key(), "fileA");

        let event = CacheEvent::renamed("a", "b", 1);
        assert_eq!(event.event_type(), "Renamed");
        assert_eq!(event.key(), "b");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = CacheEvent::admitted("dir/f", 42);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Admitted");
        assert_eq!(json["key"], "dir/f");
        assert_eq!(json["size_bytes"], 42);

        let back: CacheEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_mismatch_without_remote_crc() {
        let event = CacheEvent::checksum_mismatch("k", 1, 2, 3, None);
        let json = serde_json::to_value(&event).unwrap();
        assert!(json["remote_crc64"].is_null());
    }
}
