//! Cache configuration
//!
//! Loaded once at mount time (YAML file and/or CLI flags) and handed to
//! [`crate::context::CacheContext::open`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheKey;
use crate::error::{Error, Result};

/// Default bounded-prefix size for the degraded checksum fallback (100 MiB)
pub const DEFAULT_VERIFY_PREFIX_BYTES: u64 = 100 * 1024 * 1024;

/// Default interval between idle-expiry scans (1 hour)
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 3600;

/// Process-wide size bound for the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheLimit {
    /// `None` disables eviction entirely
    pub max_total_bytes: Option<u64>,
}

impl CacheLimit {
    /// Unbounded retention
    pub fn unbounded() -> Self {
        Self {
            max_total_bytes: None,
        }
    }

    /// Bound the cache at `bytes`
    pub fn bytes(bytes: u64) -> Self {
        Self {
            max_total_bytes: Some(bytes),
        }
    }

    /// Map a raw option value; absent or non-positive means unbounded
    pub fn from_raw(raw: Option<i64>) -> Self {
        match raw {
            Some(v) if v > 0 => Self::bytes(v as u64),
            _ => Self::unbounded(),
        }
    }

    /// True when eviction is enabled
    pub fn is_bounded(&self) -> bool {
        self.max_total_bytes.is_some()
    }

    /// True if `total` violates the bound
    pub fn exceeded_by(&self, total: u64) -> bool {
        matches!(self.max_total_bytes, Some(max) if total > max)
    }

    /// True if a single entry of `size` can ever be retained
    pub fn admits(&self, size: u64) -> bool {
        match self.max_total_bytes {
            Some(max) => size <= max,
            None => true,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory holding the data and stat subtrees
    pub cache_root: PathBuf,
    /// Total byte bound; absent or `<= 0` means unbounded
    pub size_limit_bytes: Option<i64>,
    /// Bucket name; names the data subtree
    pub bucket_name: String,
    /// Bucket endpoint URL
    pub bucket_endpoint: String,
    /// Optional key prefix inside the bucket
    pub bucket_path: Option<String>,
    /// Evict entries idle for longer than this (disabled when absent)
    pub expire_after_secs: Option<u64>,
    /// Interval between idle-expiry scans
    pub scan_interval_secs: u64,
    /// Prefix length for the degraded checksum fallback
    pub verify_prefix_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("/var/cache/bucketcache"),
            size_limit_bytes: None,
            bucket_name: String::new(),
            bucket_endpoint: String::new(),
            bucket_path: None,
            expire_after_secs: None,
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            verify_prefix_bytes: DEFAULT_VERIFY_PREFIX_BYTES,
        }
    }
}

impl CacheConfig {
    /// Minimal config for a bucket rooted at `cache_root`
    pub fn new(cache_root: impl Into<PathBuf>, bucket_name: impl Into<String>) -> Self {
        Self {
            cache_root: cache_root.into(),
            bucket_name: bucket_name.into(),
            bucket_endpoint: "http://localhost".to_string(),
            ..Default::default()
        }
    }

    /// Set the size bound (builder style)
    pub fn with_size_limit(mut self, bytes: Option<i64>) -> Self {
        self.size_limit_bytes = bytes;
        self
    }

    /// Load from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parse from a YAML document
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(raw)?;
        Ok(config)
    }

    /// Effective size bound
    pub fn limit(&self) -> CacheLimit {
        CacheLimit::from_raw(self.size_limit_bytes)
    }

    /// Idle expiry, if enabled
    pub fn expire_after(&self) -> Option<Duration> {
        self.expire_after_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    /// Interval between idle-expiry scans
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    /// Remote object key for a cache key (prefixed by `bucket_path`)
    pub fn remote_key(&self, key: &CacheKey) -> String {
        match self
            .bucket_path
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
        {
            Some(prefix) => format!("{}/{}", prefix, key.as_str()),
            None => key.as_str().to_string(),
        }
    }

    /// Check the configuration; errors are fatal at startup
    pub fn validate(&self) -> Result<()> {
        if self.cache_root.as_os_str().is_empty() {
            return Err(Error::Config("cache_root must not be empty".to_string()));
        }
        if self.bucket_name.trim().is_empty() {
            return Err(Error::Config("bucket_name must not be empty".to_string()));
        }
        if self.bucket_name.contains('/') || self.bucket_name.starts_with('.') {
            return Err(Error::Config(format!(
                "bucket_name {:?} must not contain '/' or start with '.'",
                self.bucket_name
            )));
        }
        if !(self.bucket_endpoint.starts_with("http://")
            || self.bucket_endpoint.starts_with("https://"))
        {
            return Err(Error::Config(format!(
                "bucket_endpoint {:?} must be an http(s) URL",
                self.bucket_endpoint
            )));
        }
        Ok(())
    }
}

/// Access credentials for one bucket
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub secret_id: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Parse a passwd-style file with `bucket:secret_id:secret_key` lines
    pub fn from_passwd_file(path: &Path, bucket: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "cannot read credentials {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_passwd_str(&raw, bucket)
    }

    /// Parse passwd-style content
    pub fn from_passwd_str(raw: &str, bucket: &str) -> Result<Self> {
        let line = raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .find(|l| l.split(':').next() == Some(bucket))
            .ok_or_else(|| Error::Config(format!("no credentials for bucket {}", bucket)))?;

        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() < 3 {
            return Err(Error::Config(format!(
                "unexpected credentials line for bucket {}",
                bucket
            )));
        }

        let secret_id = parts[1].trim().to_string();
        let secret_key = parts[2].trim().to_string();
        if secret_id.is_empty() || secret_key.is_empty() {
            return Err(Error::Config(format!(
                "empty secret id or key for bucket {}",
                bucket
            )));
        }

        Ok(Self {
            secret_id,
            secret_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_limit_from_raw() {
        assert_eq!(CacheLimit::from_raw(None), CacheLimit::unbounded());
        assert_eq!(CacheLimit::from_raw(Some(0)), CacheLimit::unbounded());
        assert_eq!(CacheLimit::from_raw(Some(-1)), CacheLimit::unbounded());
        assert_eq!(CacheLimit::from_raw(Some(5)), CacheLimit::bytes(5));
    }

    #[test]
    fn test_limit_checks() {
        let limit = CacheLimit::bytes(100);
        assert!(!limit.exceeded_by(100));
        assert!(limit.exceeded_by(101));
        assert!(limit.admits(100));
        assert!(!limit.admits(101));

        let unbounded = CacheLimit::unbounded();
        assert!(!unbounded.exceeded_by(u64::MAX));
        assert!(unbounded.admits(u64::MAX));
    }

    #[test]
    fn test_yaml_round_trip_defaults() {
        let config = CacheConfig::from_yaml_str(
            "cache_root: /tmp/c\nbucket_name: photos\nbucket_endpoint: http://cos.local\nsize_limit_bytes: 5242880\n",
        )
        .unwrap();
        assert_eq!(config.cache_root, PathBuf::from("/tmp/c"));
        assert_eq!(config.limit(), CacheLimit::bytes(5 * 1024 * 1024));
        assert_eq!(config.verify_prefix_bytes, DEFAULT_VERIFY_PREFIX_BYTES);
        assert!(config.expire_after().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CacheConfig::new("/tmp/c", "bucket");
        config.validate().unwrap();

        config.bucket_endpoint = "cos.local".to_string();
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = CacheConfig::new("/tmp/c", "a/b");
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = CacheConfig::new("", "bucket");
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_remote_key_prefix() {
        let key = CacheKey::new("dir/file.txt").unwrap();
        let mut config = CacheConfig::new("/tmp/c", "bucket");
        assert_eq!(config.remote_key(&key), "dir/file.txt");

        config.bucket_path = Some("/mnt/prefix/".to_string());
        assert_eq!(config.remote_key(&key), "mnt/prefix/dir/file.txt");
    }

    #[test]
    fn test_credentials_parsing() {
        let raw = "# comment\nother:id0:key0\nphotos-125:id1: key1 \n";
        let creds = Credentials::from_passwd_str(raw, "photos-125").unwrap();
        assert_eq!(creds.secret_id, "id1");
        assert_eq!(creds.secret_key, "key1");
        assert!(!format!("{:?}", creds).contains("key1"));

        assert_matches!(
            Credentials::from_passwd_str(raw, "missing"),
            Err(Error::Config(_))
        );
        assert_matches!(
            Credentials::from_passwd_str("photos:id", "photos"),
            Err(Error::Config(_))
        );
        assert_matches!(
            Credentials::from_passwd_str("photos::key", "photos"),
            Err(Error::Config(_))
        );
    }
}
