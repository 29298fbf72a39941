//! In-Memory Remote Adapter
//!
//! Implements the `RemoteStore` port over a map of buffers. Objects can be
//! stored with or without a server-side checksum so both verification
//! paths can be exercised.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::checksum::crc64;
use crate::domain::ports::{ByteRange, RemoteObjectRef, RemoteStore};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    report_crc: bool,
}

/// Remote store held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    objects: RwLock<HashMap<(String, String), StoredObject>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object; `head` reports its CRC-64
    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.insert(bucket, key, data.into(), true);
    }

    /// Store an object whose `head` carries no checksum
    pub fn put_without_checksum(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.insert(bucket, key, data.into(), false);
    }

    fn insert(&self, bucket: &str, key: &str, data: Bytes, report_crc: bool) {
        self.objects.write().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject { data, report_crc },
        );
    }

    /// Remove an object, returning whether it existed
    pub fn remove(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .write()
            .remove(&(bucket.to_string(), key.to_string()))
            .is_some()
    }

    /// Move an object within a bucket
    pub fn rename(&self, bucket: &str, from: &str, to: &str) -> Result<()> {
        let mut objects = self.objects.write();
        let object = objects
            .remove(&(bucket.to_string(), from.to_string()))
            .ok_or_else(|| not_found(bucket, from))?;
        objects.insert((bucket.to_string(), to.to_string()), object);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn object(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| not_found(bucket, key))
    }
}

fn not_found(bucket: &str, key: &str) -> Error {
    Error::ObjectNotFound {
        bucket: bucket.to_string(),
        key: key.to_string(),
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn head(&self, bucket: &str, key: &str) -> Result<RemoteObjectRef> {
        let object = self.object(bucket, key)?;
        Ok(RemoteObjectRef {
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_length: object.data.len() as u64,
            crc64: object.report_crc.then(|| crc64(&object.data)),
        })
    }

    async fn get(&self, bucket: &str, key: &str, range: ByteRange) -> Result<Bytes> {
        let object = self.object(bucket, key)?;
        let (start, end) = range.clamp(object.data.len() as u64);
        Ok(object.data.slice(start as usize..end as usize))
    }
}
