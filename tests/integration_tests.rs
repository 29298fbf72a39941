//! bucketcache Integration Tests
//!
//! End-to-end behavior of the cache as the mount layer and operators see it:
//! - Scenarios: limit enforcement, LRU order, delete, truncate, move-out
//! - Properties: presence pairing, size bound, unbounded retention,
//!   round-trip, checksum parity
//! - Concurrency: many writers against one size-limited cache

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use bucketcache::adapters::{DirectoryRemote, InMemoryEventCollector, InMemoryRemote};
use bucketcache::cache::ScanReport;
use bucketcache::domain::ports::{ByteRange, EventPublisher, RemoteObjectRef, RemoteStore};
use bucketcache::{
    AdmissionOutcome, Cache, CacheConfig, CacheContext, CacheKey, ConsistencyVerifier,
    EntryAttrs, Error,
};

const MIB: usize = 1024 * 1024;

fn key(raw: &str) -> CacheKey {
    CacheKey::new(raw).unwrap()
}

fn collector() -> Arc<InMemoryEventCollector> {
    Arc::new(InMemoryEventCollector::new())
}

async fn open_cache(root: &Path, limit: Option<i64>) -> Cache {
    let config = CacheConfig::new(root, "bucket").with_size_limit(limit);
    Cache::open(&config, collector()).await.unwrap()
}

/// Every known key has both records, and the stores agree with the disk
async fn assert_paired(cache: &Cache) -> ScanReport {
    for entry in cache.entries() {
        assert_eq!(
            entry.data_present, entry.meta_present,
            "half-present entry {}",
            entry.relative_path
        );
    }
    let report = cache.scan().await.unwrap();
    assert!(report.is_consistent(), "{:?}", report);
    assert_eq!(report.total_bytes, cache.total_bytes());
    report
}

// =============================================================================
// Scenarios
// =============================================================================

mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_full_size_file_evicted_by_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), Some(5 * MIB as i64)).await;

        let file_a = key("fileA");
        let file_b = key("fileB");
        tokio_test::assert_ok!(cache.write(&file_a, vec![1u8; 5 * MIB], EntryAttrs::now()).await);
        tokio_test::assert_ok!(cache.write(&file_b, vec![2u8; 1024], EntryAttrs::now()).await);
        cache.quiesce().await;

        assert!(!cache.contains(&file_a));
        assert!(cache.contains(&file_b));
        assert_eq!(cache.total_bytes(), 1024);
        assert_paired(&cache).await;
    }

    #[tokio::test]
    async fn test_both_files_kept_without_limit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), None).await;

        cache.write(&key("fileA"), vec![1u8; 5 * MIB], EntryAttrs::now()).await.unwrap();
        cache.write(&key("fileB"), vec![2u8; 1024], EntryAttrs::now()).await.unwrap();
        cache.quiesce().await;

        assert!(cache.contains(&key("fileA")));
        assert!(cache.contains(&key("fileB")));
        assert_eq!(cache.total_bytes(), (5 * MIB + 1024) as u64);
    }

    #[tokio::test]
    async fn test_sequential_writes_evict_least_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let limit = 5 * MIB;
        let cache = open_cache(dir.path(), Some(limit as i64)).await;

        let sizes = [1, 2, 3, 2, 1];
        for (i, size) in sizes.iter().enumerate() {
            let outcome = cache
                .write(&key(&format!("file{}", i)), vec![i as u8; size * MIB], EntryAttrs::now())
                .await
                .unwrap();
            assert!(outcome.is_cached());
            cache.quiesce().await;
            assert!(cache.total_bytes() <= limit as u64);
        }

        // the two most recent files always survive
        assert!(cache.contains(&key("file3")));
        assert!(cache.contains(&key("file4")));
        assert!(!cache.contains(&key("file0")));
        assert!(!cache.contains(&key("file1")));
        assert!(cache.metrics().evictions >= 3);
        assert_paired(&cache).await;
    }

    #[tokio::test]
    async fn test_read_refreshes_lru_position() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), Some(3 * MIB as i64)).await;

        cache.write(&key("old"), vec![0u8; MIB], EntryAttrs::now()).await.unwrap();
        cache.write(&key("mid"), vec![0u8; MIB], EntryAttrs::now()).await.unwrap();
        cache.read(&key("old")).await.unwrap().unwrap();
        cache.write(&key("new"), vec![0u8; 2 * MIB], EntryAttrs::now()).await.unwrap();
        cache.quiesce().await;

        assert!(cache.contains(&key("old")));
        assert!(!cache.contains(&key("mid")));
        assert!(cache.contains(&key("new")));
    }

    #[tokio::test]
    async fn test_delete_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), None).await;
        let k = key("dir/sub/file");

        cache.write(&k, b"some content".to_vec(), EntryAttrs::now()).await.unwrap();
        assert_eq!(cache.remove(&k).await.unwrap(), AdmissionOutcome::Removed);

        let entry = cache.entry(&k);
        assert!(!entry.data_present);
        assert!(!entry.meta_present);
        assert!(!cache.layout().data_path(&k).exists());
        assert!(!cache.layout().stat_path(&k).exists());
    }

    async fn mirror_context(dir: &Path) -> (CacheContext, std::path::PathBuf) {
        let mirror = dir.join("remote");
        tokio::fs::create_dir_all(mirror.join("bucket")).await.unwrap();
        let config = CacheConfig::new(dir.join("cache"), "bucket");
        let ctx = CacheContext::open(config, Arc::new(DirectoryRemote::new(&mirror)), collector())
            .await
            .unwrap();
        (ctx, mirror.join("bucket"))
    }

    #[tokio::test]
    async fn test_truncate_shorter_then_longer_matches_remote() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mirror) = mirror_context(dir.path()).await;
        let k = key("data.bin");
        let content: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

        tokio::fs::write(mirror.join("data.bin"), &content).await.unwrap();
        ctx.cache().write(&k, content.clone(), EntryAttrs::now()).await.unwrap();
        ctx.verify_cached(&k).await.unwrap().unwrap();

        for len in [1000u64, 10_000] {
            let remote = std::fs::OpenOptions::new()
                .write(true)
                .open(mirror.join("data.bin"))
                .unwrap();
            remote.set_len(len).unwrap();
            drop(remote);

            let outcome = ctx.cache().truncate(&k, len).await.unwrap();
            assert_eq!(outcome, AdmissionOutcome::Cached { bytes: len });

            let report = ctx.verify_cached(&k).await.unwrap().unwrap();
            assert_eq!(report.local_len, len);
            assert_eq!(report.remote_len, len);
            assert_eq!(report.remote_crc64, Some(report.local_crc64));
        }

        let cached = ctx.cache().read(&k).await.unwrap().unwrap();
        assert_eq!(&cached[..1000], &content[..1000]);
        assert!(cached[1000..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_divergent_copy_is_a_hard_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mirror) = mirror_context(dir.path()).await;
        let k = key("data.bin");

        tokio::fs::write(mirror.join("data.bin"), b"remote!").await.unwrap();
        ctx.cache().write(&k, b"local!!".to_vec(), EntryAttrs::now()).await.unwrap();

        let err = ctx.verify_cached(&k).await.unwrap_err();
        match err {
            Error::ChecksumMismatch {
                local_len,
                remote_len,
                remote_crc64,
                ..
            } => {
                assert_eq!(local_len, 7);
                assert_eq!(remote_len, 7);
                assert!(remote_crc64.is_some());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    async fn move_out_exact(size: u64) {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let ctx = CacheContext::open(
            CacheConfig::new(dir.path().join("cache"), "bucket"),
            remote,
            collector(),
        )
        .await
        .unwrap();

        let source = dir.path().join("source");
        let file = std::fs::File::create(&source).unwrap();
        file.set_len(size).unwrap();
        drop(file);

        let k = key("big/object");
        let outcome = ctx
            .cache()
            .write(&k, bucketcache::Content::File(source), EntryAttrs::now())
            .await
            .unwrap();
        assert_eq!(outcome, AdmissionOutcome::Cached { bytes: size });

        let dest = dir.path().join("moved");
        assert_eq!(ctx.move_out(&k, &dest).await.unwrap(), size);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), size);
        assert!(!ctx.cache().contains(&k));
    }

    #[tokio::test]
    async fn test_move_out_multipart_size_is_exact() {
        move_out_exact(3 * MIB as u64 + 1).await;
    }

    /// Remote object of `len` bytes: zeros followed by a short tail
    struct ZeroTailRemote {
        len: u64,
        tail: &'static [u8],
    }

    #[async_trait]
    impl RemoteStore for ZeroTailRemote {
        async fn head(&self, bucket: &str, key: &str) -> bucketcache::Result<RemoteObjectRef> {
            Ok(RemoteObjectRef {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_length: self.len,
                crc64: None,
            })
        }

        async fn get(&self, _bucket: &str, _key: &str, range: ByteRange) -> bucketcache::Result<Bytes> {
            let (start, end) = range.clamp(self.len);
            let mut chunk = vec![0u8; (end - start) as usize];
            let tail_start = self.len - self.tail.len() as u64;
            for offset in start.max(tail_start)..end {
                chunk[(offset - start) as usize] = self.tail[(offset - tail_start) as usize];
            }
            Ok(Bytes::from(chunk))
        }
    }

    #[tokio::test]
    async fn test_move_out_very_large_remote_object_is_exact() {
        use std::io::{Read, Seek, SeekFrom};

        let dir = tempfile::tempdir().unwrap();
        let size = 5 * 1024 * MIB as u64 + 12;
        let remote = Arc::new(ZeroTailRemote {
            len: size,
            tail: b"end-of-file!",
        });
        let ctx = CacheContext::open(
            CacheConfig::new(dir.path().join("cache"), "bucket"),
            remote,
            collector(),
        )
        .await
        .unwrap();

        let dest = dir.path().join("moved");
        assert_eq!(ctx.move_out(&key("huge"), &dest).await.unwrap(), size);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), size);

        let mut file = std::fs::File::open(&dest).unwrap();
        file.seek(SeekFrom::End(-12)).unwrap();
        let mut tail = Vec::new();
        file.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, b"end-of-file!");
    }

    #[tokio::test]
    #[ignore = "copies 5 GiB through the cache"]
    async fn test_move_out_very_large_size_is_exact() {
        move_out_exact(5 * 1024 * MIB as u64 + 12).await;
    }
}

// =============================================================================
// Properties
// =============================================================================

mod property_tests {
    use super::*;

    #[tokio::test]
    async fn test_presence_pairing_across_mixed_operations() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), Some(64 * 1024)).await;

        for i in 0..20u32 {
            let k = key(&format!("d{}/f{}", i % 3, i));
            cache.write(&k, vec![i as u8; 8 * 1024], EntryAttrs::now()).await.unwrap();
            if i % 4 == 0 {
                cache.truncate(&k, 100).await.unwrap();
            }
            if i % 5 == 0 {
                cache.rename(&k, &key(&format!("moved/{}", i))).await.unwrap();
            }
            if i % 7 == 0 {
                cache.remove(&k).await.unwrap();
            }
        }
        cache.quiesce().await;

        assert!(cache.total_bytes() <= 64 * 1024);
        assert_paired(&cache).await;
    }

    #[tokio::test]
    async fn test_unbounded_cache_never_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), Some(0)).await;

        for i in 0..10 {
            cache
                .write(&key(&format!("f{}", i)), vec![0u8; MIB], EntryAttrs::now())
                .await
                .unwrap();
        }
        cache.quiesce().await;
        assert!(cache.evict_now().await.is_empty());

        assert_eq!(cache.len(), 10);
        assert_eq!(cache.metrics().evictions, 0);
    }

    #[tokio::test]
    async fn test_round_trip_through_cache_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let k = key("nested/path/object.txt");
        let content = b"exact bytes \x00\xff\n".to_vec();
        {
            let cache = open_cache(dir.path(), None).await;
            cache.write(&k, content.clone(), EntryAttrs::now()).await.unwrap();
            assert_eq!(cache.read(&k).await.unwrap().unwrap().as_ref(), &content[..]);
            cache.shutdown().await;
        }

        let cache = open_cache(dir.path(), None).await;
        assert_eq!(cache.read(&k).await.unwrap().unwrap().as_ref(), &content[..]);
        assert_eq!(
            std::fs::read(cache.layout().data_path(&k)).unwrap(),
            content
        );
    }

    #[tokio::test]
    async fn test_admitted_entries_verify_against_remote() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        let cache = open_cache(dir.path(), None).await;
        let verifier = ConsistencyVerifier::new(remote.clone());

        for (i, len) in [0usize, 1, 4096, MIB + 7].iter().enumerate() {
            let name = format!("obj{}", i);
            let content: Vec<u8> = (0..*len).map(|b| (b * 31 % 256) as u8).collect();
            if i % 2 == 0 {
                remote.put("bucket", &name, content.clone());
            } else {
                remote.put_without_checksum("bucket", &name, content.clone());
            }

            let k = key(&name);
            cache.write(&k, content, EntryAttrs::now()).await.unwrap();
            cache.quiesce().await;

            let report = verifier
                .verify_cached(&cache, "bucket", &name, &k)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(report.local_len, *len as u64);
            assert!(report.mode.is_full());
        }
    }
}

// =============================================================================
// Concurrency
// =============================================================================

mod concurrency_tests {
    use super::*;
    use futures::future::join_all;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_respect_limit() {
        let dir = tempfile::tempdir().unwrap();
        let limit = 256 * 1024u64;
        let events = collector();
        let config = CacheConfig::new(dir.path(), "bucket").with_size_limit(Some(limit as i64));
        let cache = Arc::new(
            Cache::open(&config, events.clone() as Arc<dyn EventPublisher>)
                .await
                .unwrap(),
        );

        let writers = (0..16u8).map(|w| {
            let cache = cache.clone();
            tokio::spawn(async move {
                for i in 0..8u32 {
                    let k = key(&format!("w{}/f{}", w, i % 4));
                    cache
                        .write(&k, vec![w; 16 * 1024 + i as usize], EntryAttrs::now())
                        .await
                        .unwrap();
                }
            })
        });
        for result in join_all(writers).await {
            result.unwrap();
        }
        cache.quiesce().await;

        assert!(cache.total_bytes() <= limit);
        let report = assert_paired(&cache).await;
        assert_eq!(report.entries, cache.len());
        assert!(!events.events_of_type("Admitted").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_writes_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(open_cache(dir.path(), None).await);
        let k = key("contended");

        let writers = (1..=8usize).map(|n| {
            let cache = cache.clone();
            let k = k.clone();
            async move { cache.write(&k, vec![n as u8; n * 1000], EntryAttrs::now()).await }
        });
        for outcome in join_all(writers).await {
            assert!(outcome.unwrap().is_cached());
        }

        let content = cache.read(&k).await.unwrap().unwrap();
        let n = content[0] as usize;
        assert_eq!(content.len(), n * 1000);
        assert!(content.iter().all(|b| *b as usize == n));
        assert_paired(&cache).await;
    }
}
