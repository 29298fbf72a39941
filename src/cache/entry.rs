//! Cache Entry Types
//!
//! The key that names an entry in both on-disk subtrees, the attributes
//! persisted in its stat record, and the combined view of the two facets.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Regular file with rw-r--r--
pub const DEFAULT_FILE_MODE: u32 = 0o100644;

/// Relative path of a cached object; mirrors the remote object key
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(String);

impl CacheKey {
    /// Create a key from a mount-relative path such as `dir/file.txt`.
    ///
    /// A single leading `/` is accepted and stripped. Empty components,
    /// `.`/`..`, trailing slashes and NUL bytes are rejected so the key can
    /// never escape the cache subtrees.
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let raw = raw.as_ref();
        let trimmed = raw.strip_prefix('/').unwrap_or(raw);

        if trimmed.is_empty() || trimmed.contains('\0') {
            return Err(Error::InvalidKey(raw.to_string()));
        }
        if trimmed
            .split('/')
            .any(|c| c.is_empty() || c == "." || c == "..")
        {
            return Err(Error::InvalidKey(raw.to_string()));
        }

        Ok(Self(trimmed.to_string()))
    }

    /// Build a key from a path relative to a subtree root
    pub fn from_relative_path(path: &Path) -> Result<Self> {
        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => match part.to_str() {
                    Some(s) => parts.push(s),
                    None => return Err(Error::InvalidKey(path.display().to_string())),
                },
                _ => return Err(Error::InvalidKey(path.display().to_string())),
            }
        }
        Self::new(parts.join("/"))
    }

    /// Key as a `/`-separated string
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relative filesystem path under a subtree root
    pub fn to_relative_path(&self) -> PathBuf {
        self.0.split('/').collect()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// File attributes carried by a mutating filesystem operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryAttrs {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: DateTime<Utc>,
}

impl EntryAttrs {
    /// Default attributes stamped with the current time
    pub fn now() -> Self {
        Self {
            mode: DEFAULT_FILE_MODE,
            uid: 0,
            gid: 0,
            mtime: Utc::now(),
        }
    }
}

impl Default for EntryAttrs {
    fn default() -> Self {
        Self::now()
    }
}

/// Partial attribute update (chmod / chown / utimens)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrChange {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime: Option<DateTime<Utc>>,
}

impl AttrChange {
    /// Apply onto existing attributes
    pub fn apply_to(&self, attrs: &mut EntryAttrs) {
        if let Some(mode) = self.mode {
            attrs.mode = mode;
        }
        if let Some(uid) = self.uid {
            attrs.uid = uid;
        }
        if let Some(gid) = self.gid {
            attrs.gid = gid;
        }
        if let Some(mtime) = self.mtime {
            attrs.mtime = mtime;
        }
    }

    /// True if nothing would change
    pub fn is_empty(&self) -> bool {
        self.mode.is_none() && self.uid.is_none() && self.gid.is_none() && self.mtime.is_none()
    }
}

/// Persisted stat record, one per cached key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRecord {
    /// Content size in bytes; must equal the data file length
    pub size: u64,
    pub attrs: EntryAttrs,
    /// Drives LRU ordering
    pub last_access: DateTime<Utc>,
    /// When the entry was (re)admitted
    pub cached_at: DateTime<Utc>,
}

impl StatRecord {
    /// Record for freshly admitted content
    pub fn new(size: u64, attrs: EntryAttrs, stamp: DateTime<Utc>) -> Self {
        Self {
            size,
            attrs,
            last_access: stamp,
            cached_at: stamp,
        }
    }

    /// Idle time relative to `now`
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_access)
    }
}

/// Content handed to the admission controller
#[derive(Debug, Clone)]
pub enum Content {
    /// In-memory buffer
    Bytes(Bytes),
    /// Local file copied into the data store without buffering
    File(PathBuf),
}

impl From<Bytes> for Content {
    fn from(b: Bytes) -> Self {
        Content::Bytes(b)
    }
}

impl From<Vec<u8>> for Content {
    fn from(v: Vec<u8>) -> Self {
        Content::Bytes(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Content {
    fn from(v: &'static [u8]) -> Self {
        Content::Bytes(Bytes::from_static(v))
    }
}

/// Combined view of one key across the data and metadata stores
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub relative_path: CacheKey,
    pub data_present: bool,
    pub meta_present: bool,
    pub size_bytes: u64,
    pub last_access_time: Option<DateTime<Utc>>,
    pub last_modify_time: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Fully resident (both facets present)
    pub fn is_resident(&self) -> bool {
        self.data_present && self.meta_present
    }

    /// Both facets agree on presence
    pub fn is_consistent(&self) -> bool {
        self.data_present == self.meta_present
    }
}
