//! Consistency Verifier
//!
//! Proves a local copy and its remote object are identical by comparing
//! lengths and CRC-64/XZ checksums.
//!
//! # Degraded mode
//!
//! Some objects carry no server-side checksum. For those the verifier
//! downloads at most `prefix_limit` bytes of the remote object and compares
//! the checksum of that prefix with the checksum of the same prefix of the
//! local file. When either side is longer than the prefix the result is
//! reported as [`VerifyMode::PrefixOnly`]: lengths are checked in full but
//! content past the prefix is not.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::cache::{Cache, CacheKey};
use crate::checksum::{crc64, crc64_file, Crc64Hasher};
use crate::config::DEFAULT_VERIFY_PREFIX_BYTES;
use crate::domain::events::CacheEvent;
use crate::domain::ports::{ByteRange, EventPublisher, RemoteStore};
use crate::error::{Error, Result};

/// Ranged reads of the remote prefix are issued in chunks of this size
const REMOTE_CHUNK: u64 = 8 * 1024 * 1024;

/// How much of the content a successful verification covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Full-object checksum comparison
    Full,
    /// Only the first `bytes` were compared; lengths were compared in full
    PrefixOnly { bytes: u64 },
    /// Both sides are empty
    Empty,
}

impl VerifyMode {
    pub fn is_full(&self) -> bool {
        !matches!(self, VerifyMode::PrefixOnly { .. })
    }
}

/// Successful verification result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub key: String,
    pub local_len: u64,
    /// Checksum over the compared range
    pub local_crc64: u64,
    pub remote_len: u64,
    /// Server checksum, or the computed prefix checksum in degraded mode
    pub remote_crc64: Option<u64>,
    pub mode: VerifyMode,
}

/// Compares local files against the remote store
pub struct ConsistencyVerifier {
    remote: Arc<dyn RemoteStore>,
    publisher: Option<Arc<dyn EventPublisher>>,
    prefix_limit: u64,
}

impl ConsistencyVerifier {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            remote,
            publisher: None,
            prefix_limit: DEFAULT_VERIFY_PREFIX_BYTES,
        }
    }

    /// Publish a `ChecksumMismatch` event for every failure
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Bytes downloaded when the remote has no checksum
    pub fn with_prefix_limit(mut self, bytes: u64) -> Self {
        self.prefix_limit = bytes.max(1);
        self
    }

    pub fn prefix_limit(&self) -> u64 {
        self.prefix_limit
    }

    /// Verify the local file at `local_path` against `bucket/key`
    pub async fn verify(&self, bucket: &str, key: &str, local_path: &Path) -> Result<VerifyReport> {
        let head = self.remote.head(bucket, key).await?;
        let local_len = tokio::fs::metadata(local_path).await?.len();

        let (local_crc64, remote_crc64, mode) = match head.crc64 {
            Some(remote_crc) => {
                let (_, local_crc) = crc64_file(local_path, None).await?;
                let mode = if local_len == 0 && head.content_length == 0 {
                    VerifyMode::Empty
                } else {
                    VerifyMode::Full
                };
                (local_crc, Some(remote_crc), mode)
            }
            None if local_len > 0 => {
                let limit = self.prefix_limit;
                let (_, local_crc) = crc64_file(local_path, Some(limit)).await?;
                let remote_crc = self.remote_prefix_crc(bucket, key, head.content_length).await?;
                let mode = if local_len <= limit && head.content_length <= limit {
                    VerifyMode::Full
                } else {
                    VerifyMode::PrefixOnly { bytes: limit }
                };
                (local_crc, Some(remote_crc), mode)
            }
            None => (crc64(&[]), None, VerifyMode::Empty),
        };

        self.judge(VerifyReport {
            key: key.to_string(),
            local_len,
            local_crc64,
            remote_len: head.content_length,
            remote_crc64,
            mode,
        })
        .await
    }

    /// Verify caller-supplied local length and checksum against `bucket/key`.
    ///
    /// Without a server checksum, a local file longer than the prefix limit
    /// can only be checked by length.
    pub async fn verify_len_crc(
        &self,
        bucket: &str,
        key: &str,
        local_len: u64,
        local_crc64: u64,
    ) -> Result<VerifyReport> {
        let head = self.remote.head(bucket, key).await?;

        let (remote_crc64, mode) = match head.crc64 {
            Some(crc) if local_len == 0 && head.content_length == 0 => (Some(crc), VerifyMode::Empty),
            Some(crc) => (Some(crc), VerifyMode::Full),
            None if local_len == 0 => (None, VerifyMode::Empty),
            None if local_len <= self.prefix_limit && head.content_length <= self.prefix_limit => {
                let crc = self.remote_prefix_crc(bucket, key, head.content_length).await?;
                (Some(crc), VerifyMode::Full)
            }
            // lengths only
            None => (None, VerifyMode::PrefixOnly { bytes: 0 }),
        };

        self.judge(VerifyReport {
            key: key.to_string(),
            local_len,
            local_crc64,
            remote_len: head.content_length,
            remote_crc64,
            mode,
        })
        .await
    }

    /// Verify the data-store copy of a resident cache entry.
    ///
    /// Returns `None` when the key is not cached.
    pub async fn verify_cached(
        &self,
        cache: &Cache,
        bucket: &str,
        remote_key: &str,
        key: &CacheKey,
    ) -> Result<Option<VerifyReport>> {
        if !cache.contains(key) {
            return Ok(None);
        }
        let path = cache.layout().data_path(key);
        self.verify(bucket, remote_key, &path).await.map(Some)
    }

    /// CRC64 of the first `prefix_limit` bytes of a remote object
    async fn remote_prefix_crc(&self, bucket: &str, key: &str, remote_len: u64) -> Result<u64> {
        let end = remote_len.min(self.prefix_limit);
        let mut hasher = Crc64Hasher::new();
        let mut offset = 0;
        while offset < end {
            let chunk_end = (offset + REMOTE_CHUNK).min(end);
            let bytes = self
                .remote
                .get(bucket, key, ByteRange::new(offset, Some(chunk_end)))
                .await?;
            if bytes.is_empty() {
                break;
            }
            hasher.update(&bytes);
            offset += bytes.len() as u64;
        }
        debug!(bucket, key, bytes = hasher.len(), "Computed remote prefix checksum");
        Ok(hasher.finish().1)
    }

    /// Turn a comparison into success or a mismatch error
    async fn judge(&self, report: VerifyReport) -> Result<VerifyReport> {
        let len_differs = report.local_len != report.remote_len;
        let crc_differs = report.remote_len != 0
            && report
                .remote_crc64
                .is_some_and(|remote| remote != report.local_crc64);

        if len_differs || crc_differs {
            error!(
                key = %report.key,
                local_len = report.local_len,
                local_crc64 = report.local_crc64,
                remote_len = report.remote_len,
                remote_crc64 = ?report.remote_crc64,
                "Checksum mismatch"
            );
            if let Some(publisher) = &self.publisher {
                let event = CacheEvent::checksum_mismatch(
                    report.key.as_str(),
                    report.local_len,
                    report.local_crc64,
                    report.remote_len,
                    report.remote_crc64,
                );
                if let Err(e) = publisher.publish(event).await {
                    warn!(error = %e, "Failed to publish mismatch event");
                }
            }
            return Err(Error::ChecksumMismatch {
                key: report.key,
                local_len: report.local_len,
                local_crc64: report.local_crc64,
                remote_len: report.remote_len,
                remote_crc64: report.remote_crc64,
            });
        }

        if let VerifyMode::PrefixOnly { bytes } = report.mode {
            warn!(
                key = %report.key,
                compared_bytes = bytes,
                len = report.local_len,
                "Remote has no checksum; verified length and prefix only"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, InMemoryRemote};
    use assert_matches::assert_matches;

    fn verifier(remote: Arc<InMemoryRemote>) -> ConsistencyVerifier {
        ConsistencyVerifier::new(remote)
    }

    async fn local_file(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_matching_copies_verify_in_full() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        remote.put("b", "k", b"hello world".to_vec());
        let path = local_file(&dir, "k", b"hello world").await;

        let report = verifier(remote).verify("b", "k", &path).await.unwrap();
        assert_eq!(report.mode, VerifyMode::Full);
        assert_eq!(report.local_crc64, crc64(b"hello world"));
        assert_eq!(report.remote_crc64, Some(report.local_crc64));
    }

    #[tokio::test]
    async fn test_length_mismatch_reports_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        remote.put("b", "k", b"abcd".to_vec());
        let path = local_file(&dir, "k", b"abc").await;
        let events = Arc::new(InMemoryEventCollector::new());

        let err = verifier(remote)
            .with_publisher(events.clone())
            .verify("b", "k", &path)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::ChecksumMismatch { local_len: 3, remote_len: 4, remote_crc64: Some(_), .. }
        );
        assert_eq!(events.events_of_type("ChecksumMismatch").len(), 1);
    }

    #[tokio::test]
    async fn test_same_length_different_content() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        remote.put("b", "k", b"aaaa".to_vec());
        let path = local_file(&dir, "k", b"aaab").await;

        assert_matches!(
            verifier(remote).verify("b", "k", &path).await,
            Err(Error::ChecksumMismatch { .. })
        );
    }

    #[tokio::test]
    async fn test_empty_files_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        remote.put_without_checksum("b", "empty", Vec::new());
        let path = local_file(&dir, "empty", b"").await;

        let report = verifier(remote).verify("b", "empty", &path).await.unwrap();
        assert_eq!(report.mode, VerifyMode::Empty);
    }

    #[tokio::test]
    async fn test_missing_checksum_within_prefix_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        remote.put_without_checksum("b", "k", b"0123456789".to_vec());
        let path = local_file(&dir, "k", b"0123456789").await;

        let report = verifier(remote.clone())
            .with_prefix_limit(64)
            .verify("b", "k", &path)
            .await
            .unwrap();
        assert_eq!(report.mode, VerifyMode::Full);

        let bad = local_file(&dir, "bad", b"0123456780").await;
        assert_matches!(
            verifier(remote).with_prefix_limit(64).verify("b", "k", &bad).await,
            Err(Error::ChecksumMismatch { .. })
        );
    }

    #[tokio::test]
    async fn test_prefix_only_check_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        // Differs only past the 4-byte prefix: the degraded check cannot see it
        remote.put_without_checksum("b", "k", b"AAAAxxxx".to_vec());
        let path = local_file(&dir, "k", b"AAAAyyyy").await;

        let report = verifier(remote)
            .with_prefix_limit(4)
            .verify("b", "k", &path)
            .await
            .unwrap();
        assert_eq!(report.mode, VerifyMode::PrefixOnly { bytes: 4 });
        assert!(!report.mode.is_full());
        assert_eq!(report.local_crc64, crc64(b"AAAA"));
    }

    #[tokio::test]
    async fn test_verify_len_crc() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.put("b", "k", b"payload".to_vec());
        let v = verifier(remote);

        v.verify_len_crc("b", "k", 7, crc64(b"payload")).await.unwrap();
        assert_matches!(
            v.verify_len_crc("b", "k", 7, crc64(b"PAYLOAD")).await,
            Err(Error::ChecksumMismatch { .. })
        );
        assert_matches!(
            v.verify_len_crc("b", "missing", 0, 0).await,
            Err(Error::ObjectNotFound { .. })
        );
    }
}
