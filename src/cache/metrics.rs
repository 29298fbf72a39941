//! Cache Metrics Collection
//!
//! Lock-free counters for admission, eviction and read activity, with a
//! Prometheus text rendering for operators.

use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    admissions: AtomicU64,
    pass_throughs: AtomicU64,
    rollbacks: AtomicU64,
    removals: AtomicU64,
    evictions: AtomicU64,
    eviction_failures: AtomicU64,
    expirations: AtomicU64,
    eviction_passes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_admitted: AtomicU64,
    bytes_evicted: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admission(&self, bytes: u64) {
        self.admissions.fetch_add(1, Ordering::Relaxed);
        self.bytes_admitted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_pass_through(&self) {
        self.pass_throughs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, bytes: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.bytes_evicted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_eviction_failure(&self) {
        self.eviction_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self, bytes: u64) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
        self.bytes_evicted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_eviction_pass(&self) {
        self.eviction_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let total = hits + self.misses.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admissions: self.admissions.load(Ordering::Relaxed),
            pass_throughs: self.pass_throughs.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            eviction_failures: self.eviction_failures.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            eviction_passes: self.eviction_passes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_admitted: self.bytes_admitted.load(Ordering::Relaxed),
            bytes_evicted: self.bytes_evicted.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub admissions: u64,
    pub pass_throughs: u64,
    pub rollbacks: u64,
    pub removals: u64,
    pub evictions: u64,
    pub eviction_failures: u64,
    pub expirations: u64,
    pub eviction_passes: u64,
    pub hits: u64,
    pub misses: u64,
    pub bytes_admitted: u64,
    pub bytes_evicted: u64,
    pub hit_ratio: f64,
}

impl MetricsSnapshot {
    /// Render counters plus the current usage gauges in Prometheus text format
    pub fn render_prometheus(&self, total_bytes: u64, entries: u64, limit: Option<u64>) -> Result<String> {
        let registry =
            Registry::new_custom(Some("bucketcache".to_string()), None).map_err(metrics_err)?;

        let counters = [
            ("admissions_total", "Entries admitted into the cache", self.admissions),
            ("pass_throughs_total", "Operations served uncached", self.pass_throughs),
            ("rollbacks_total", "Half-written admissions rolled back", self.rollbacks),
            ("removals_total", "Entries removed by delete", self.removals),
            ("evictions_total", "Entries evicted for the size bound", self.evictions),
            ("eviction_failures_total", "Per-entry eviction failures", self.eviction_failures),
            ("expirations_total", "Entries expired for idleness", self.expirations),
            ("eviction_passes_total", "Eviction passes run", self.eviction_passes),
            ("hits_total", "Reads served from the cache", self.hits),
            ("misses_total", "Reads not found in the cache", self.misses),
            ("admitted_bytes_total", "Bytes admitted", self.bytes_admitted),
            ("evicted_bytes_total", "Bytes evicted or expired", self.bytes_evicted),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::new(name, help).map_err(metrics_err)?;
            counter.inc_by(value);
            registry.register(Box::new(counter)).map_err(metrics_err)?;
        }

        register_usage(&registry, total_bytes, entries, limit)?;
        encode(&registry)
    }

    /// Render only the usage gauges.
    ///
    /// Counters belong to the process that mounted the cache; a process that
    /// merely opens the cache directory has nothing meaningful to report.
    pub fn render_usage_prometheus(total_bytes: u64, entries: u64, limit: Option<u64>) -> Result<String> {
        let registry =
            Registry::new_custom(Some("bucketcache".to_string()), None).map_err(metrics_err)?;
        register_usage(&registry, total_bytes, entries, limit)?;
        encode(&registry)
    }
}

fn register_usage(registry: &Registry, total_bytes: u64, entries: u64, limit: Option<u64>) -> Result<()> {
    let gauges = [
        ("used_bytes", "Bytes held in the data store", total_bytes as i64),
        ("entries", "Resident entries", entries as i64),
        (
            "limit_bytes",
            "Configured size bound (0 = unbounded)",
            limit.unwrap_or(0) as i64,
        ),
    ];
    for (name, help, value) in gauges {
        let gauge = IntGauge::new(name, help).map_err(metrics_err)?;
        gauge.set(value);
        registry.register(Box::new(gauge)).map_err(metrics_err)?;
    }
    Ok(())
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(metrics_err)?;
    String::from_utf8(buffer).map_err(|e| Error::Io(std::io::Error::other(e)))
}

fn metrics_err(e: prometheus::Error) -> Error {
    Error::Io(std::io::Error::other(format!("metrics: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = CacheMetrics::new();
        metrics.record_admission(100);
        metrics.record_admission(50);
        metrics.record_eviction(100);
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_pass_through();

        let snap = metrics.snapshot();
        assert_eq!(snap.admissions, 2);
        assert_eq!(snap.bytes_admitted, 150);
        assert_eq!(snap.evictions, 1);
        assert_eq!(snap.bytes_evicted, 100);
        assert_eq!(snap.pass_throughs, 1);
        assert_eq!(snap.hit_ratio, 0.5);
    }

    #[test]
    fn test_hit_ratio_without_reads() {
        assert_eq!(CacheMetrics::new().hit_ratio(), 0.0);
    }

    #[test]
    fn test_prometheus_rendering() {
        let metrics = CacheMetrics::new();
        metrics.record_admission(10);
        let text = metrics
            .snapshot()
            .render_prometheus(10, 1, Some(5 * 1024 * 1024))
            .unwrap();
        assert!(text.contains("bucketcache_admissions_total 1"));
        assert!(text.contains("bucketcache_used_bytes 10"));
        assert!(text.contains("bucketcache_limit_bytes 5242880"));
    }

    #[test]
    fn test_usage_rendering_has_no_counters() {
        let text = MetricsSnapshot::render_usage_prometheus(42, 3, None).unwrap();
        assert!(text.contains("bucketcache_used_bytes 42"));
        assert!(text.contains("bucketcache_entries 3"));
        assert!(text.contains("bucketcache_limit_bytes 0"));
        assert!(!text.contains("_total"));
    }
}
