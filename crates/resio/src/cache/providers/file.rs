//! # File Cache
//!
//! This module implements a file-based persistent cache provider.
//!
//! Every blob is stored as `<blob>.data` next to a `<blob>.meta` JSON record.
//! Metadata is written to a temporary file and renamed into place, so the
//! completeness flag flips atomically.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{self, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::cache::providers::provider::{BlobReader, BlobWriter, CacheProvider};
use crate::cache::types::{BlobId, CacheResult, EntryMetadata};
use crate::error::CacheError;

const DATA_EXTENSION: &str = "data";
const META_EXTENSION: &str = "meta";
const TEMP_EXTENSION: &str = "tmp";

#[derive(Debug, Clone)]
pub struct FileCache {
    cache_dir: PathBuf,
    initialized: Arc<AtomicBool>,
}

impl FileCache {
    /// Create a new file cache with the specified directory
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Initialize the cache directory
    pub(crate) async fn ensure_initialized(&self) -> io::Result<()> {
        // Fast path - already initialized
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        // create_dir_all is idempotent, so racing initializers are harmless
        fs::create_dir_all(&self.cache_dir).await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Get the path for a cached blob
    fn data_path(&self, blob: &BlobId) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{DATA_EXTENSION}", blob.as_str()))
    }

    /// Get the metadata path for a cached blob
    fn meta_path(&self, blob: &BlobId) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{META_EXTENSION}", blob.as_str()))
    }

    async fn remove_quietly(path: &Path) {
        if let Err(e) = fs::remove_file(path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = ?path, error = %e, "Failed to remove cache file");
            }
        }
    }

    /// Whether `path` is a data, metadata or temporary file of some blob.
    fn is_blob_file(path: &Path) -> bool {
        let extension = path.extension().and_then(|ext| ext.to_str());
        let stem = path.file_stem().and_then(|stem| stem.to_str());
        match (extension, stem) {
            (Some(DATA_EXTENSION | META_EXTENSION | TEMP_EXTENSION), Some(stem)) => {
                BlobId::parse(stem).is_some()
            }
            _ => false,
        }
    }

    /// Read and validate one metadata record; None means the entry must be discarded.
    async fn validate(&self, meta_path: &Path) -> Option<EntryMetadata> {
        let bytes = match fs::read(meta_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to read cache metadata file");
                return None;
            }
        };

        let metadata: EntryMetadata = match serde_json::from_slice(&bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to parse cache metadata");
                return None;
            }
        };

        if !metadata.complete {
            debug!(key = %metadata.key, blob = %metadata.blob, "Discarding incomplete cache entry");
            return None;
        }

        match fs::metadata(self.data_path(&metadata.blob)).await {
            Ok(data) if data.len() == metadata.bytes_written => Some(metadata),
            Ok(data) => {
                warn!(
                    key = %metadata.key,
                    expected = metadata.bytes_written,
                    actual = data.len(),
                    "Cache data length disagrees with metadata"
                );
                None
            }
            Err(e) => {
                warn!(key = %metadata.key, error = %e, "Cache data file missing");
                None
            }
        }
    }
}

struct FileBlobWriter {
    file: fs::File,
}

struct FileBlobReader {
    file: fs::File,
    position: u64,
}

#[async_trait]
impl BlobWriter for FileBlobWriter {
    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        // Readers use separate handles; the write must have landed before we return
        self.file.flush().await
    }

    async fn truncate(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.set_len(0).await?;
        self.file.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobReader for FileBlobReader {
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if self.position != offset {
            self.file.seek(SeekFrom::Start(offset)).await?;
            self.position = offset;
        }
        let read = self.file.read(buf).await?;
        self.position += read as u64;
        Ok(read)
    }
}

#[async_trait]
impl CacheProvider for FileCache {
    async fn create(&self, blob: &BlobId) -> CacheResult<Box<dyn BlobWriter>> {
        self.ensure_initialized().await?;

        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.data_path(blob))
            .await?;

        Ok(Box::new(FileBlobWriter { file }))
    }

    async fn open(&self, blob: &BlobId) -> CacheResult<Box<dyn BlobReader>> {
        let file = fs::File::open(self.data_path(blob)).await?;
        Ok(Box::new(FileBlobReader { file, position: 0 }))
    }

    async fn commit(&self, metadata: &EntryMetadata) -> CacheResult<()> {
        self.ensure_initialized().await?;

        let meta_path = self.meta_path(&metadata.blob);
        let temp_path = meta_path.with_extension(TEMP_EXTENSION);

        let json = serde_json::to_vec(metadata)
            .map_err(|e| CacheError::metadata(format!("Failed to serialize metadata: {e}")))?;

        if let Err(e) = fs::write(&temp_path, &json).await {
            warn!(path = ?temp_path, error = %e, "Failed to write cache metadata file");
            return Err(e.into());
        }

        // Rename makes the new record visible in one step
        if let Err(e) = fs::rename(&temp_path, &meta_path).await {
            warn!(
                from = ?temp_path,
                to = ?meta_path,
                error = %e,
                "Failed to rename temporary metadata file"
            );
            Self::remove_quietly(&temp_path).await;
            return Err(e.into());
        }

        debug!(key = %metadata.key, complete = metadata.complete, "Committed cache metadata");
        Ok(())
    }

    async fn remove(&self, blob: &BlobId) -> CacheResult<()> {
        let data_path = self.data_path(blob);
        let meta_path = self.meta_path(blob);

        // Metadata first: a data file without metadata is an orphan that load() sweeps
        let meta_result = fs::remove_file(&meta_path).await;
        let data_result = fs::remove_file(&data_path).await;

        match (meta_result, data_result) {
            (Err(e), _) if e.kind() != io::ErrorKind::NotFound => {
                warn!(path = ?meta_path, error = %e, "Failed to remove cache metadata file");
                Err(e.into())
            }
            (_, Err(e)) if e.kind() != io::ErrorKind::NotFound => {
                warn!(path = ?data_path, error = %e, "Failed to remove cache data file");
                Err(e.into())
            }
            _ => {
                debug!(blob = %blob, "Removed blob from file cache");
                Ok(())
            }
        }
    }

    async fn load(&self) -> CacheResult<Vec<EntryMetadata>> {
        self.ensure_initialized().await?;

        let mut metas = Vec::new();
        let mut others = Vec::new();
        let mut entries = fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            // Anything not named like one of our blobs belongs to someone else
            if !Self::is_blob_file(&path) {
                continue;
            }
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(META_EXTENSION) => metas.push(path),
                _ => others.push(path),
            }
        }

        let mut loaded = Vec::new();
        let mut live_blobs = HashSet::new();
        for meta_path in metas {
            match self.validate(&meta_path).await {
                Some(metadata) => {
                    live_blobs.insert(self.data_path(&metadata.blob));
                    loaded.push(metadata);
                }
                None => {
                    Self::remove_quietly(&meta_path).await;
                    Self::remove_quietly(&meta_path.with_extension(DATA_EXTENSION)).await;
                }
            }
        }

        // Orphaned data files and interrupted metadata writes
        for path in others {
            if path.is_file() && !live_blobs.contains(&path) {
                Self::remove_quietly(&path).await;
            }
        }

        debug!(count = loaded.len(), dir = ?self.cache_dir, "Loaded cache entries from disk");
        Ok(loaded)
    }
}
