//! Directory Remote Adapter
//!
//! Implements the `RemoteStore` port over a local directory in which each
//! bucket is a subdirectory. Used by the CLI to verify a cache against a
//! mirrored copy of the bucket.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::checksum::crc64_file;
use crate::domain::ports::{ByteRange, RemoteObjectRef, RemoteStore};
use crate::error::{Error, Result};

/// Remote store backed by `<root>/<bucket>/<key>` files.
#[derive(Debug, Clone)]
pub struct DirectoryRemote {
    root: PathBuf,
    report_crc: bool,
}

impl DirectoryRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            report_crc: true,
        }
    }

    /// Whether `head` computes and reports a CRC-64 (default: yes)
    pub fn with_checksums(mut self, report_crc: bool) -> Self {
        self.report_crc = report_crc;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let mut path = self.root.join(bucket);
        for part in key.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(Error::InvalidKey(key.to_string()));
            }
            path.push(part);
        }
        Ok(path)
    }
}

fn map_io(bucket: &str, key: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    } else {
        Error::Remote(format!("{}/{}: {}", bucket, key, e))
    }
}

#[async_trait]
impl RemoteStore for DirectoryRemote {
    async fn head(&self, bucket: &str, key: &str) -> Result<RemoteObjectRef> {
        let path = self.object_path(bucket, key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| map_io(bucket, key, e))?;
        if !meta.is_file() {
            return Err(Error::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let crc64 = if self.report_crc {
            let (_, crc) = crc64_file(&path, None)
                .await
                .map_err(|e| map_io(bucket, key, e))?;
            Some(crc)
        } else {
            None
        };

        Ok(RemoteObjectRef {
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_length: meta.len(),
            crc64,
        })
    }

    async fn get(&self, bucket: &str, key: &str, range: ByteRange) -> Result<Bytes> {
        let path = self.object_path(bucket, key)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| map_io(bucket, key, e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| map_io(bucket, key, e))?
            .len();

        let (start, end) = range.clamp(len);
        debug!(bucket, key, start, end, "Reading remote range");
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| map_io(bucket, key, e))?;

        let mut buf = Vec::with_capacity((end - start) as usize);
        file.take(end - start)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| map_io(bucket, key, e))?;
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_head_and_get() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("bucket/sub"))
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("bucket/sub/obj"), b"123456789")
            .await
            .unwrap();

        let remote = DirectoryRemote::new(dir.path());
        let head = remote.head("bucket", "sub/obj").await.unwrap();
        assert_eq!(head.content_length, 9);
        assert_eq!(head.crc64, Some(0x995D_C9BB_DF19_39FA));

        let tail = remote
            .get("bucket", "sub/obj", ByteRange::new(6, None))
            .await
            .unwrap();
        assert_eq!(tail.as_ref(), b"789");

        let bare = DirectoryRemote::new(dir.path()).with_checksums(false);
        assert_eq!(bare.head("bucket", "sub/obj").await.unwrap().crc64, None);
    }

    #[tokio::test]
    async fn test_missing_and_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let remote = DirectoryRemote::new(dir.path());
        assert_matches!(
            remote.head("bucket", "absent").await,
            Err(Error::ObjectNotFound { .. })
        );
        assert_matches!(
            remote.get("bucket", "../etc", ByteRange::full()).await,
            Err(Error::InvalidKey(_))
        );
    }
}
