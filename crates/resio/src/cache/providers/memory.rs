//! # Memory Cache Provider
//!
//! Blobs are append-only byte vectors shared between the writer and every
//! reader. Metadata survives only as long as the provider instance.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::cache::providers::provider::{BlobReader, BlobWriter, CacheProvider};
use crate::cache::types::{BlobId, CacheResult, EntryMetadata};
use crate::error::CacheError;

type SharedBlob = Arc<RwLock<Vec<u8>>>;

/// In-memory cache provider
#[derive(Default)]
pub struct MemoryCache {
    blobs: Mutex<HashMap<BlobId, SharedBlob>>,
    committed: Mutex<HashMap<BlobId, EntryMetadata>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently held
    pub fn blob_count(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Total bytes held across all blobs
    pub fn total_bytes(&self) -> u64 {
        self.blobs
            .lock()
            .values()
            .map(|blob| blob.read().len() as u64)
            .sum()
    }
}

struct MemoryBlobWriter {
    blob: SharedBlob,
}

struct MemoryBlobReader {
    blob: SharedBlob,
}

#[async_trait]
impl BlobWriter for MemoryBlobWriter {
    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.blob.write().extend_from_slice(data);
        Ok(())
    }

    async fn truncate(&mut self) -> io::Result<()> {
        self.blob.write().clear();
        Ok(())
    }
}

#[async_trait]
impl BlobReader for MemoryBlobReader {
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.blob.read();
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    async fn create(&self, blob: &BlobId) -> CacheResult<Box<dyn BlobWriter>> {
        let shared = SharedBlob::default();
        self.blobs.lock().insert(blob.clone(), shared.clone());
        Ok(Box::new(MemoryBlobWriter { blob: shared }))
    }

    async fn open(&self, blob: &BlobId) -> CacheResult<Box<dyn BlobReader>> {
        let shared = self.blobs.lock().get(blob).cloned().ok_or_else(|| {
            CacheError::from(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no blob {blob}"),
            ))
        })?;
        Ok(Box::new(MemoryBlobReader { blob: shared }))
    }

    async fn commit(&self, metadata: &EntryMetadata) -> CacheResult<()> {
        self.committed
            .lock()
            .insert(metadata.blob.clone(), metadata.clone());
        Ok(())
    }

    async fn remove(&self, blob: &BlobId) -> CacheResult<()> {
        // Readers keep their own handle on the bytes until they detach
        self.blobs.lock().remove(blob);
        self.committed.lock().remove(blob);
        debug!(blob = %blob, "Removed blob from memory cache");
        Ok(())
    }

    async fn load(&self) -> CacheResult<Vec<EntryMetadata>> {
        let blobs = self.blobs.lock();
        Ok(self
            .committed
            .lock()
            .values()
            .filter(|meta| {
                meta.complete
                    && blobs
                        .get(&meta.blob)
                        .is_some_and(|b| b.read().len() as u64 == meta.bytes_written)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ResourceKey;

    fn meta(blob: &BlobId, bytes: u64, complete: bool) -> EntryMetadata {
        EntryMetadata {
            key: ResourceKey::new("k"),
            blob: blob.clone(),
            bytes_written: bytes,
            declared_size: Some(bytes),
            media_type: None,
            complete,
            cached_at: 0,
        }
    }

    #[tokio::test]
    async fn readers_see_appended_prefix() {
        let cache = MemoryCache::new();
        let blob = BlobId::generate(&ResourceKey::new("k"));
        let mut writer = cache.create(&blob).await.unwrap();
        let mut reader = cache.open(&blob).await.unwrap();

        writer.append(b"hello ").await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(reader.read_at(0, &mut buf).await.unwrap(), 6);
        assert_eq!(&buf[..6], b"hello ");

        writer.append(b"world").await.unwrap();
        assert_eq!(reader.read_at(6, &mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"world");
        assert_eq!(reader.read_at(11, &mut buf).await.unwrap(), 0);
        assert_eq!(cache.total_bytes(), 11);
    }

    #[tokio::test]
    async fn truncate_discards_bytes() {
        let cache = MemoryCache::new();
        let blob = BlobId::generate(&ResourceKey::new("k"));
        let mut writer = cache.create(&blob).await.unwrap();
        writer.append(b"stale").await.unwrap();
        writer.truncate().await.unwrap();

        let mut reader = cache.open(&blob).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read_at(0, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn load_returns_only_complete_entries() {
        let cache = MemoryCache::new();
        let done = BlobId::generate(&ResourceKey::new("done"));
        let partial = BlobId::generate(&ResourceKey::new("partial"));

        let mut w = cache.create(&done).await.unwrap();
        w.append(b"abc").await.unwrap();
        cache.commit(&meta(&done, 3, true)).await.unwrap();

        let mut w = cache.create(&partial).await.unwrap();
        w.append(b"ab").await.unwrap();
        cache.commit(&meta(&partial, 0, false)).await.unwrap();

        let loaded = cache.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].blob, done);
    }

    #[tokio::test]
    async fn removed_blob_stays_readable_for_open_readers() {
        let cache = MemoryCache::new();
        let blob = BlobId::generate(&ResourceKey::new("k"));
        let mut writer = cache.create(&blob).await.unwrap();
        writer.append(b"keep").await.unwrap();
        let mut reader = cache.open(&blob).await.unwrap();

        cache.remove(&blob).await.unwrap();
        assert_eq!(cache.blob_count(), 0);
        assert!(cache.open(&blob).await.is_err());

        let mut buf = [0u8; 4];
        assert_eq!(reader.read_at(0, &mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"keep");
    }
}
