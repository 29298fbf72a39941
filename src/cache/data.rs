//! Data Store
//!
//! Byte-for-byte copies of cached objects under `<cache_root>/<bucket>/`.
//!
//! # Design
//!
//! - Every write lands in the staging area and is renamed into place, so a
//!   failed write never leaves a partial file under the final key
//! - `total_bytes` is an atomic counter adjusted by size deltas; only
//!   `load` walks the tree
//! - Callers hold the key lock, which serializes updates per key

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::entry::CacheKey;
use super::layout::{prune_empty_parents, rename_into, walk_files, CacheLayout};
use crate::error::{Error, Result};

/// Local content store
pub struct DataStore {
    layout: Arc<CacheLayout>,
    /// Size of every present entry
    sizes: DashMap<CacheKey, u64>,
    /// Sum of `sizes`
    total: AtomicU64,
}

impl DataStore {
    pub fn new(layout: Arc<CacheLayout>) -> Self {
        Self {
            layout,
            sizes: DashMap::new(),
            total: AtomicU64::new(0),
        }
    }

    /// Rebuild sizes from disk and clear the staging area.
    ///
    /// Returns the number of entries found.
    pub async fn load(&self) -> Result<usize> {
        if let Ok(mut entries) = tokio::fs::read_dir(self.layout.tmp_root()).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                debug!(path = %entry.path().display(), "Removing stale staging file");
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }

        let (files, invalid) = walk_files(self.layout.data_root())
            .await
            .map_err(|e| Error::data_store("<scan>", e))?;

        for path in invalid {
            warn!(path = %path.display(), "Removing stray file from data subtree");
            let _ = tokio::fs::remove_file(&path).await;
        }

        self.sizes.clear();
        let mut total = 0u64;
        for (key, len) in &files {
            self.sizes.insert(key.clone(), *len);
            total += len;
        }
        self.total.store(total, Ordering::Release);
        Ok(files.len())
    }

    /// Store `bytes` under `key`, replacing any previous content.
    pub async fn write(&self, key: &CacheKey, bytes: &Bytes) -> Result<u64> {
        let tmp = self.layout.tmp_path();
        let staged = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_data().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;

        self.commit(key, tmp, staged.map(|_| bytes.len() as u64))
            .await
    }

    /// Store a copy of the local file `src` under `key` without buffering it.
    pub async fn write_file(&self, key: &CacheKey, src: &Path) -> Result<u64> {
        let tmp = self.layout.tmp_path();
        let copied = tokio::fs::copy(src, &tmp).await;
        self.commit(key, tmp, copied).await
    }

    /// Resize the content of `key`: growing zero-fills, shrinking discards.
    ///
    /// Returns `None` when the key is not present.
    pub async fn truncate(&self, key: &CacheKey, new_len: u64) -> Result<Option<u64>> {
        if !self.contains(key) {
            return Ok(None);
        }
        let tmp = self.layout.tmp_path();
        let src = self.layout.data_path(key);
        let staged = async {
            tokio::fs::copy(&src, &tmp).await?;
            let file = tokio::fs::OpenOptions::new().write(true).open(&tmp).await?;
            file.set_len(new_len).await?;
            file.sync_data().await?;
            Ok::<_, std::io::Error>(new_len)
        }
        .await;

        self.commit(key, tmp, staged).await.map(Some)
    }

    /// Rename the staged file into place and account for the size change
    async fn commit(
        &self,
        key: &CacheKey,
        tmp: PathBuf,
        staged: std::io::Result<u64>,
    ) -> Result<u64> {
        let dest = self.layout.data_path(key);
        let result = match staged {
            Ok(len) => rename_into(&tmp, &dest).await.map(|_| len),
            Err(e) => Err(e),
        };

        match result {
            Ok(len) => {
                let old = self.sizes.insert(key.clone(), len);
                self.adjust_total(old, Some(len));
                debug!(key = %key, bytes = len, "Data written");
                Ok(len)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(Error::data_store(key.as_str(), e))
            }
        }
    }

    /// Move the content of `from` to `to`, replacing `to`.
    ///
    /// Returns the moved size, or `None` if `from` is not present.
    pub async fn rename(&self, from: &CacheKey, to: &CacheKey) -> Result<Option<u64>> {
        let Some(size) = self.size_of(from) else {
            return Ok(None);
        };
        let src = self.layout.data_path(from);
        let dest = self.layout.data_path(to);

        rename_into(&src, &dest)
            .await
            .map_err(|e| Error::data_store(to.as_str(), e))?;
        prune_empty_parents(&src, self.layout.data_root()).await;

        let removed = self.sizes.remove(from).map(|(_, s)| s);
        self.adjust_total(removed, None);
        let replaced = self.sizes.insert(to.clone(), size);
        self.adjust_total(replaced, Some(size));
        Ok(Some(size))
    }

    /// Read the full content of `key`
    pub async fn read(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        if !self.contains(key) {
            return Ok(None);
        }
        match tokio::fs::read(self.layout.data_path(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::data_store(key.as_str(), e)),
        }
    }

    /// Remove `key`; absent keys are not an error.
    ///
    /// Returns the freed size. On failure the entry stays accounted for.
    pub async fn remove(&self, key: &CacheKey) -> Result<Option<u64>> {
        let path = self.layout.data_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => prune_empty_parents(&path, self.layout.data_root()).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::data_store(key.as_str(), e)),
        }
        let removed = self.sizes.remove(key).map(|(_, s)| s);
        self.adjust_total(removed, None);
        Ok(removed)
    }

    fn adjust_total(&self, old: Option<u64>, new: Option<u64>) {
        let old = old.unwrap_or(0);
        let new = new.unwrap_or(0);
        if new > old {
            self.total.fetch_add(new - old, Ordering::AcqRel);
        } else if old > new {
            self.total.fetch_sub(old - new, Ordering::AcqRel);
        }
    }

    /// Sum of the sizes of all present entries
    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn size_of(&self, key: &CacheKey) -> Option<u64> {
        self.sizes.get(key).map(|s| *s)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.sizes.contains_key(key)
    }

    /// Local path of the content of `key`
    pub fn path(&self, key: &CacheKey) -> PathBuf {
        self.layout.data_path(key)
    }

    /// All present keys
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.sizes.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, DataStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(CacheLayout::new(dir.path(), "bucket"));
        layout.create_dirs().await.unwrap();
        (dir, DataStore::new(layout))
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let (_dir, store) = store().await;
        let k = key("dir/obj");

        store.write(&k, &Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(store.total_bytes(), 5);
        assert_eq!(store.read(&k).await.unwrap().unwrap().as_ref(), b"hello");

        // overwrite adjusts by delta
        store.write(&k, &Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(store.total_bytes(), 2);
        assert_eq!(store.len(), 1);

        assert_eq!(store.remove(&k).await.unwrap(), Some(2));
        assert_eq!(store.total_bytes(), 0);
        assert!(store.read(&k).await.unwrap().is_none());
        assert_eq!(store.remove(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_prior_state() {
        let (_dir, store) = store().await;
        let k = key("blocked");
        // Destination occupied by a non-empty directory: rename must fail.
        tokio::fs::create_dir_all(store.path(&k).join("x")).await.unwrap();

        let err = store.write(&k, &Bytes::from_static(b"data")).await.unwrap_err();
        assert!(matches!(err, Error::DataStore { .. }));
        assert!(!store.contains(&k));
        assert_eq!(store.total_bytes(), 0);

        // nothing left behind in the staging area
        let mut staged = tokio::fs::read_dir(store.layout.tmp_root()).await.unwrap();
        assert!(staged.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncate_shrink_and_grow() {
        let (_dir, store) = store().await;
        let k = key("t");
        store.write(&k, &Bytes::from_static(b"abcdef")).await.unwrap();

        assert_eq!(store.truncate(&k, 3).await.unwrap(), Some(3));
        assert_eq!(store.read(&k).await.unwrap().unwrap().as_ref(), b"abc");
        assert_eq!(store.total_bytes(), 3);

        assert_eq!(store.truncate(&k, 6).await.unwrap(), Some(6));
        assert_eq!(
            store.read(&k).await.unwrap().unwrap().as_ref(),
            b"abc\0\0\0"
        );
        assert_eq!(store.total_bytes(), 6);

        assert_eq!(store.truncate(&key("absent"), 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rename_replaces_destination() {
        let (_dir, store) = store().await;
        let a = key("a/src");
        let b = key("b/dst");
        store.write(&a, &Bytes::from_static(b"12345")).await.unwrap();
        store.write(&b, &Bytes::from_static(b"xy")).await.unwrap();
        assert_eq!(store.total_bytes(), 7);

        assert_eq!(store.rename(&a, &b).await.unwrap(), Some(5));
        assert!(!store.contains(&a));
        assert_eq!(store.size_of(&b), Some(5));
        assert_eq!(store.total_bytes(), 5);
        assert!(!store.layout.data_root().join("a").exists());

        assert_eq!(store.rename(&a, &b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_file_and_load() {
        let (dir, store) = store().await;
        let src = dir.path().join("source.bin");
        tokio::fs::write(&src, vec![7u8; 4096]).await.unwrap();

        let k = key("big");
        assert_eq!(store.write_file(&k, &src).await.unwrap(), 4096);

        tokio::fs::write(store.layout.tmp_root().join("left.part"), b"x")
            .await
            .unwrap();

        let reloaded = DataStore::new(store.layout.clone());
        assert_eq!(reloaded.load().await.unwrap(), 1);
        assert_eq!(reloaded.total_bytes(), 4096);
        assert_eq!(reloaded.keys(), vec![k]);
        assert!(!store.layout.tmp_root().join("left.part").exists());
    }
}
