//! # Cache Provider
//!
//! This module defines the storage traits that all cache backends must follow.
//! A blob is append-only while its entry fills: one writer, any number of
//! readers, each reader with its own cursor.

use async_trait::async_trait;

use crate::cache::types::{BlobId, CacheResult, EntryMetadata};

/// A storage backend for cache blobs and their metadata
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Create an empty blob and return its writer
    async fn create(&self, blob: &BlobId) -> CacheResult<Box<dyn BlobWriter>>;

    /// Open an independent reader over an existing blob
    async fn open(&self, blob: &BlobId) -> CacheResult<Box<dyn BlobReader>>;

    /// Persist entry metadata. A complete record replaces the previous one atomically.
    async fn commit(&self, metadata: &EntryMetadata) -> CacheResult<()>;

    /// Delete a blob and its metadata
    async fn remove(&self, blob: &BlobId) -> CacheResult<()>;

    /// Committed complete entries. Incomplete leftovers are discarded.
    async fn load(&self) -> CacheResult<Vec<EntryMetadata>>;
}

/// Append side of a blob
#[async_trait]
pub trait BlobWriter: Send + Sync {
    /// Append `data`; once this returns, readers can read the bytes
    async fn append(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Drop every byte written so far
    async fn truncate(&mut self) -> std::io::Result<()>;
}

/// Positional read side of a blob
#[async_trait]
pub trait BlobReader: Send + Sync {
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;
}
