//! # Resource Cache
//!
//! Keyed index of cache entries over a pluggable storage provider.
//! Entries that fail or get cancelled unlink themselves from the index; their
//! storage is deleted once the last reader or writer lets go.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::entry::{CacheReader, CacheWriter, EntryContext, EntryIndex, EntryShared};
use crate::cache::providers::{CacheProvider, FileCache, MemoryCache};
use crate::cache::types::{
    BlobId, CacheConfig, CacheResult, EntryMetadata, EvictionPolicy, EvictionReport, Removal,
};
use crate::error::CacheError;
use crate::events::StatusPublisher;
use crate::key::{ResourceDescriptor, ResourceKey};
use crate::status::DownloadStatus;

const DEFAULT_CACHE_DIR: &str = "resio-cache";

/// Cache of downloaded resources, shared by cloning
#[derive(Clone)]
pub struct ResourceCache {
    index: Arc<EntryIndex>,
    ctx: Arc<EntryContext>,
    config: Arc<CacheConfig>,
}

impl ResourceCache {
    /// Create a cache with the provider selected by `config` and load the
    /// entries a previous run completed.
    pub async fn open(
        mut config: CacheConfig,
        publisher: Arc<StatusPublisher>,
    ) -> CacheResult<Self> {
        let provider: Arc<dyn CacheProvider> = if config.persistent {
            // If no disk cache path provided, use system temp
            let dir = config
                .disk_cache_path
                .get_or_insert_with(|| std::env::temp_dir().join(DEFAULT_CACHE_DIR))
                .clone();
            let file_cache = FileCache::new(dir);
            file_cache.ensure_initialized().await?;
            Arc::new(file_cache)
        } else {
            Arc::new(MemoryCache::new())
        };

        Self::with_provider(config, provider, publisher).await
    }

    /// Create a cache over an existing provider.
    pub async fn with_provider(
        config: CacheConfig,
        provider: Arc<dyn CacheProvider>,
        publisher: Arc<StatusPublisher>,
    ) -> CacheResult<Self> {
        let index = Arc::new(Mutex::new(HashMap::new()));
        let ctx = Arc::new(EntryContext {
            provider,
            publisher,
            index: Arc::downgrade(&index),
            max_entry_size: config.max_entry_size,
        });

        let cache = Self {
            index,
            ctx,
            config: Arc::new(config),
        };
        cache.rehydrate().await?;
        Ok(cache)
    }

    async fn rehydrate(&self) -> CacheResult<()> {
        let loaded = self.ctx.provider.load().await?;
        if loaded.is_empty() {
            return Ok(());
        }

        let mut index = self.index.lock();
        for metadata in loaded {
            let key = metadata.key.clone();
            if index.contains_key(&key) {
                // Two complete records for one key; keep the first
                debug!(key = %key, blob = %metadata.blob, "Skipping duplicate cache record");
                continue;
            }
            index.insert(key, EntryShared::rehydrated(metadata, self.ctx.clone()));
        }
        info!(entries = index.len(), "Restored cache entries");
        Ok(())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Begin a new entry. Fails if any entry, complete or filling, exists.
    pub fn put(&self, descriptor: &ResourceDescriptor) -> CacheResult<CacheWriter> {
        let key = descriptor.key.clone();
        let mut index = self.index.lock();
        if index.contains_key(&key) {
            return Err(CacheError::AlreadyExists { key });
        }

        let base = EntryMetadata {
            blob: BlobId::generate(&key),
            key: key.clone(),
            bytes_written: 0,
            declared_size: descriptor.declared_size,
            media_type: descriptor.media_type.clone(),
            complete: false,
            cached_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let entry = EntryShared::started(base, self.ctx.clone());
        let writer = entry
            .writer()
            .ok_or_else(|| CacheError::metadata("fresh entry refused its writer"))?;
        debug!(key = %key, blob = %entry.blob(), "Created cache entry");
        index.insert(key.clone(), entry);
        drop(index);

        self.ctx
            .publisher
            .publish(&key, DownloadStatus::Started, None, 0);
        Ok(writer)
    }

    /// Reader over an entry, complete or still filling.
    pub fn get(&self, key: &ResourceKey) -> Option<CacheReader> {
        let entry = self.index.lock().get(key).cloned()?;
        entry.reader()
    }

    /// Whether a complete entry exists for `key`
    pub fn contains_complete(&self, key: &ResourceKey) -> bool {
        self.state(key) == Some(DownloadStatus::Complete)
    }

    /// Evict one entry according to the configured [`EvictionPolicy`].
    pub async fn remove(&self, key: &ResourceKey) -> CacheResult<Removal> {
        let (entry, claimed) = {
            let mut index = self.index.lock();
            let Some(entry) = index.get(key).cloned() else {
                return Err(CacheError::NotFound { key: key.clone() });
            };

            let claimed = match self.config.eviction_policy {
                EvictionPolicy::Fail => {
                    entry.doom_if_idle().map_err(|holders| CacheError::InUse {
                        key: key.clone(),
                        holders,
                    })?;
                    true
                }
                EvictionPolicy::Defer => entry.doom(),
            };
            index.remove(key);
            (entry, claimed)
        };

        if claimed {
            entry.purge().await?;
            info!(key = %key, "Evicted cache entry");
            Ok(Removal::Removed)
        } else {
            info!(key = %key, holders = entry.holders(), "Cache entry in use, eviction deferred");
            Ok(Removal::Deferred)
        }
    }

    /// Evict every entry.
    pub async fn remove_all(&self) -> CacheResult<EvictionReport> {
        self.remove_many(self.keys()).await
    }

    /// Evict the given entries, reporting each outcome.
    pub async fn remove_many(
        &self,
        keys: impl IntoIterator<Item = ResourceKey>,
    ) -> CacheResult<EvictionReport> {
        let mut report = EvictionReport::default();
        for key in keys {
            match self.remove(&key).await {
                Ok(Removal::Removed) => report.removed.push(key),
                Ok(Removal::Deferred) => report.deferred.push(key),
                Err(CacheError::InUse { .. }) => report.in_use.push(key),
                Err(CacheError::NotFound { .. }) => report.missing.push(key),
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Bytes stored for `key`, 0 when absent
    pub fn size_cached(&self, key: &ResourceKey) -> u64 {
        self.index
            .lock()
            .get(key)
            .map(|entry| entry.written())
            .unwrap_or(0)
    }

    /// Status of the entry for `key`
    pub fn state(&self, key: &ResourceKey) -> Option<DownloadStatus> {
        self.index.lock().get(key).map(|entry| entry.status())
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<_> = self.index.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("entries", &self.len())
            .field("config", &self.config)
            .finish()
    }
}
