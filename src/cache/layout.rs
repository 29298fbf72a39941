//! On-disk layout
//!
//! ```text
//! <cache_root>/<bucket>/<key>          data subtree
//! <cache_root>/.<bucket>.stat/<key>    stat subtree (mirrors data path-for-path)
//! <cache_root>/.<bucket>.tmp/<uuid>    staging area for atomic renames
//! ```
//!
//! The staging area lives under the same root so renames into place never
//! cross a filesystem boundary.

use std::path::{Path, PathBuf};

use super::entry::CacheKey;

/// Paths of the cache subtrees for one bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    root: PathBuf,
    data_root: PathBuf,
    stat_root: PathBuf,
    tmp_root: PathBuf,
}

impl CacheLayout {
    pub fn new(cache_root: impl Into<PathBuf>, bucket: &str) -> Self {
        let root = cache_root.into();
        Self {
            data_root: root.join(bucket),
            stat_root: root.join(format!(".{}.stat", bucket)),
            tmp_root: root.join(format!(".{}.tmp", bucket)),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn stat_root(&self) -> &Path {
        &self.stat_root
    }

    pub fn tmp_root(&self) -> &Path {
        &self.tmp_root
    }

    /// Data file of a key
    pub fn data_path(&self, key: &CacheKey) -> PathBuf {
        self.data_root.join(key.to_relative_path())
    }

    /// Stat file of a key
    pub fn stat_path(&self, key: &CacheKey) -> PathBuf {
        self.stat_root.join(key.to_relative_path())
    }

    /// Fresh staging file name
    pub fn tmp_path(&self) -> PathBuf {
        self.tmp_root.join(format!("{}.part", uuid::Uuid::new_v4()))
    }

    /// Create all three subtrees
    pub async fn create_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.data_root).await?;
        tokio::fs::create_dir_all(&self.stat_root).await?;
        tokio::fs::create_dir_all(&self.tmp_root).await?;
        Ok(())
    }
}

/// Ensure the parent directory of `path` exists
pub(crate) async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Attempts made by [`rename_into`] before giving up
const RENAME_ATTEMPTS: usize = 8;

/// Rename `src` to `dest`, creating the parent of `dest` as needed.
///
/// A sibling removal can prune the parent between its creation and the
/// rename; `NotFound` is retried with the parent recreated.
pub(crate) async fn rename_into(src: &Path, dest: &Path) -> std::io::Result<()> {
    let mut attempt = 1;
    loop {
        ensure_parent(dest).await?;
        match tokio::fs::rename(src, dest).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && attempt < RENAME_ATTEMPTS => {
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Remove now-empty directories between `path` and `stop` (exclusive).
///
/// Best effort: stops at the first directory that is not empty or cannot
/// be removed.
pub(crate) async fn prune_empty_parents(path: &Path, stop: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        if tokio::fs::remove_dir(dir).await.is_err() {
            break;
        }
        current = dir.parent();
    }
}

/// Recursively list regular files under `root` as keys.
///
/// Entries whose relative path is not a valid key are returned separately
/// so the caller can clean them up.
pub(crate) async fn walk_files(root: &Path) -> std::io::Result<(Vec<(CacheKey, u64)>, Vec<PathBuf>)> {
    let mut keys = Vec::new();
    let mut invalid = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                let len = entry.metadata().await?.len();
                let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                match CacheKey::from_relative_path(&rel) {
                    Ok(key) => keys.push((key, len)),
                    Err(_) => invalid.push(path),
                }
            } else {
                invalid.push(path);
            }
        }
    }

    keys.sort_by(|a, b| a.0.cmp(&b.0));
    Ok((keys, invalid))
}
