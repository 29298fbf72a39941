//! Cache Context
//!
//! Everything one mounted bucket needs, built once at startup and passed by
//! reference: configuration, the remote store, the cache and the verifier.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::cache::{Cache, CacheKey};
use crate::config::CacheConfig;
use crate::domain::ports::{ByteRange, EventPublisher, RemoteStore};
use crate::error::{Error, Result};
use crate::verify::{ConsistencyVerifier, VerifyReport};

/// Ranged download size when copying an uncached object out
const DOWNLOAD_CHUNK: u64 = 8 * 1024 * 1024;

/// All-zero chunks are skipped over, leaving holes in the destination
static ZERO_CHUNK: [u8; DOWNLOAD_CHUNK as usize] = [0; DOWNLOAD_CHUNK as usize];

fn is_zeros(bytes: &[u8]) -> bool {
    bytes.len() <= ZERO_CHUNK.len() && *bytes == ZERO_CHUNK[..bytes.len()]
}

/// Per-bucket context
pub struct CacheContext {
    config: CacheConfig,
    remote: Arc<dyn RemoteStore>,
    cache: Cache,
    verifier: ConsistencyVerifier,
}

impl CacheContext {
    /// Validate `config` and open the cache
    pub async fn open(
        config: CacheConfig,
        remote: Arc<dyn RemoteStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Cache::open(&config, publisher.clone()).await?;
        let verifier = ConsistencyVerifier::new(remote.clone())
            .with_prefix_limit(config.verify_prefix_bytes)
            .with_publisher(publisher);

        info!(
            bucket = %config.bucket_name,
            endpoint = %config.bucket_endpoint,
            cache_root = %config.cache_root.display(),
            "Cache context ready"
        );
        Ok(Self {
            config,
            remote,
            cache,
            verifier,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket_name
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn remote(&self) -> &dyn RemoteStore {
        self.remote.as_ref()
    }

    pub fn verifier(&self) -> &ConsistencyVerifier {
        &self.verifier
    }

    /// Remote object key of a cache key
    pub fn remote_key(&self, key: &CacheKey) -> String {
        self.config.remote_key(key)
    }

    /// Read through the cache, fetching and admitting on a miss
    pub async fn read(&self, key: &CacheKey) -> Result<Bytes> {
        let remote_key = self.remote_key(key);
        self.cache
            .read_through(key, self.remote.as_ref(), self.bucket(), &remote_key)
            .await
    }

    /// Verify a local file against the remote object behind `key`
    pub async fn verify(&self, key: &CacheKey, local_path: &Path) -> Result<VerifyReport> {
        self.verifier
            .verify(self.bucket(), &self.remote_key(key), local_path)
            .await
    }

    /// Verify the cached copy of `key`; `None` when not cached
    pub async fn verify_cached(&self, key: &CacheKey) -> Result<Option<VerifyReport>> {
        self.verifier
            .verify_cached(&self.cache, self.bucket(), &self.remote_key(key), key)
            .await
    }

    /// Copy `key` out of the mount to `dest` and drop it from the cache.
    ///
    /// Served from the cache when resident, otherwise streamed from the
    /// remote in ranged chunks (zero runs become holes). Returns the exact
    /// number of bytes written.
    pub async fn move_out(&self, key: &CacheKey, dest: &Path) -> Result<u64> {
        let written = match self.cache.copy_out(key, dest).await? {
            Some(bytes) => bytes,
            None => self.download(key, dest).await?,
        };
        self.cache.remove(key).await?;
        debug!(key = %key, dest = %dest.display(), bytes = written, "Moved out of mount");
        Ok(written)
    }

    async fn download(&self, key: &CacheKey, dest: &Path) -> Result<u64> {
        let remote_key = self.remote_key(key);
        let head = self.remote.head(self.bucket(), &remote_key).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut offset = 0u64;
        while offset < head.content_length {
            let end = (offset + DOWNLOAD_CHUNK).min(head.content_length);
            let chunk = self
                .remote
                .get(self.bucket(), &remote_key, ByteRange::new(offset, Some(end)))
                .await?;
            if chunk.is_empty() {
                return Err(Error::Remote(format!(
                    "{}/{} ended at {} of {} bytes",
                    self.bucket(),
                    remote_key,
                    offset,
                    head.content_length
                )));
            }
            if is_zeros(&chunk) {
                file.seek(SeekFrom::Current(chunk.len() as i64)).await?;
            } else {
                file.write_all(&chunk).await?;
            }
            offset += chunk.len() as u64;
        }
        file.set_len(offset).await?;
        file.sync_all().await?;
        Ok(offset)
    }

    /// Stop background work
    pub async fn shutdown(&self) {
        self.cache.shutdown().await
    }
}
