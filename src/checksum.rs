//! CRC64 checksums
//!
//! CRC-64/XZ (a.k.a. CRC-64/GO-ECMA): polynomial `0x42F0E1EBA9EA3693`,
//! reflected input and output, xor-out `0xFFFFFFFFFFFFFFFF`. This is the
//! checksum the remote store reports in its `crc64ecma` header.
//!
//! Expressed in "initial value before xor-out" form (as some libraries do),
//! the initial value is `0`; the register itself starts at all ones.

use std::path::Path;

use crc::{Crc, Digest, CRC_64_XZ};
use tokio::io::AsyncReadExt;

/// Shared CRC-64/XZ engine
pub static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Read buffer size for file checksums
const READ_CHUNK: usize = 128 * 1024;

/// Compute CRC64 over an in-memory buffer
pub fn crc64(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}

/// Incremental CRC64 with a running byte count
pub struct Crc64Hasher {
    digest: Digest<'static, u64>,
    len: u64,
}

impl Crc64Hasher {
    /// Create a new hasher
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
            len: 0,
        }
    }

    /// Feed more bytes
    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
        self.len += bytes.len() as u64;
    }

    /// Bytes consumed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True if nothing was hashed yet
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finish and return `(length, crc64)`
    pub fn finish(self) -> (u64, u64) {
        (self.len, self.digest.finalize())
    }
}

impl Default for Crc64Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute `(length, crc64)` of a local file, reading at most `limit` bytes
/// when a limit is given.
pub async fn crc64_file(path: &Path, limit: Option<u64>) -> std::io::Result<(u64, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Crc64Hasher::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let want = match limit {
            Some(limit) => {
                let remaining = limit.saturating_sub(hasher.len());
                if remaining == 0 {
                    break;
                }
                remaining.min(READ_CHUNK as u64) as usize
            }
            None => READ_CHUNK,
        };

        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn test_crc64_check_value() {
        // Standard check value for CRC-64/XZ
        assert_eq!(crc64(b"123456789"), 0x995D_C9BB_DF19_39FA);
    }

    #[test]
    fn test_crc64_empty_is_zero() {
        assert_eq!(crc64(b""), 0);
    }

    #[test]
    fn test_hasher_tracks_length() {
        let mut hasher = Crc64Hasher::new();
        assert!(hasher.is_empty());
        hasher.update(b"hello ");
        hasher.update(b"world");
        let (len, crc) = hasher.finish();
        assert_eq!(len, 11);
        assert_eq!(crc, crc64(b"hello world"));
    }

    #[tokio::test]
    async fn test_crc64_file_full_and_prefix() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();

        let (len, crc) = crc64_file(file.path(), None).await.unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(crc, crc64(&data));

        let (len, crc) = crc64_file(file.path(), Some(1000)).await.unwrap();
        assert_eq!(len, 1000);
        assert_eq!(crc, crc64(&data[..1000]));
    }

    proptest! {
        #[test]
        fn prop_streaming_matches_one_shot(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            split in 0usize..4096,
        ) {
            let split = split.min(data.len());
            let mut hasher = Crc64Hasher::new();
            hasher.update(&data[..split]);
            hasher.update(&data[split..]);
            let (len, crc) = hasher.finish();
            prop_assert_eq!(len, data.len() as u64);
            prop_assert_eq!(crc, crc64(&data));
        }
    }
}
