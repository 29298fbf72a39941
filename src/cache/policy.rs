//! Eviction Policy
//!
//! Least-recently-used victim selection under a byte bound, with optional
//! idle expiry. Selection is a pure function of a metadata snapshot so it
//! can be reasoned about (and tested) apart from the I/O that follows.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::entry::{CacheKey, StatRecord};
use crate::config::CacheLimit;

/// Eviction policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvictionPolicy {
    /// Byte bound; unbounded disables size eviction
    pub limit: CacheLimit,
    /// Idle entries older than this are expired by the periodic scan
    pub expire_after: Option<Duration>,
}

impl EvictionPolicy {
    pub fn new(limit: CacheLimit, expire_after: Option<Duration>) -> Self {
        Self {
            limit,
            expire_after,
        }
    }

    /// Plan victims for one pass.
    ///
    /// Candidates are taken in ascending `(last_access, key)` order until the
    /// simulated total drops to the bound. `protect` (the key whose admission
    /// triggered the pass) is skipped as long as it fits in the bound by
    /// itself; `is_pinned` entries are always skipped.
    pub fn plan_victims<F>(
        &self,
        snapshot: &[(CacheKey, StatRecord)],
        total_bytes: u64,
        protect: Option<&CacheKey>,
        is_pinned: F,
    ) -> Vec<(CacheKey, u64)>
    where
        F: Fn(&CacheKey) -> bool,
    {
        let Some(max) = self.limit.max_total_bytes else {
            return Vec::new();
        };
        if total_bytes <= max {
            return Vec::new();
        }

        let mut ordered: Vec<&(CacheKey, StatRecord)> = snapshot.iter().collect();
        ordered.sort_by(|a, b| {
            a.1.last_access
                .cmp(&b.1.last_access)
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut remaining = total_bytes;
        let mut victims = Vec::new();
        for (key, record) in ordered {
            if remaining <= max {
                break;
            }
            if protect == Some(key) && record.size <= max {
                continue;
            }
            if is_pinned(key) {
                continue;
            }
            remaining = remaining.saturating_sub(record.size);
            victims.push((key.clone(), record.size));
        }
        victims
    }

    /// Keys idle for longer than `expire_after` at `now`, oldest first
    pub fn expired<F>(
        &self,
        snapshot: &[(CacheKey, StatRecord)],
        now: DateTime<Utc>,
        is_pinned: F,
    ) -> Vec<CacheKey>
    where
        F: Fn(&CacheKey) -> bool,
    {
        let Some(ttl) = self.expire_after else {
            return Vec::new();
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return Vec::new();
        };

        let mut expired: Vec<&(CacheKey, StatRecord)> = snapshot
            .iter()
            .filter(|(k, r)| r.idle_for(now) >= ttl && !is_pinned(k))
            .collect();
        expired.sort_by(|a, b| {
            a.1.last_access
                .cmp(&b.1.last_access)
                .then_with(|| a.0.cmp(&b.0))
        });
        expired.into_iter().map(|(k, _)| k.clone()).collect()
    }
}
