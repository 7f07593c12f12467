//! # Cache Types
//!
//! This module defines common types used across the caching system.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::key::ResourceKey;

/// Storage handle of one cache entry. Unique per entry, so a fresh entry never
/// collides with an evicted one for the same key that readers still hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    pub fn generate(key: &ResourceKey) -> Self {
        let name = key.to_filename();
        Self(format!("{}-{}", &name[..16], uuid::Uuid::new_v4().simple()))
    }

    /// Recognise a name produced by [`generate`](Self::generate).
    pub fn parse(name: &str) -> Option<Self> {
        let (prefix, id) = name.split_once('-')?;
        let hex = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit());
        if hex(prefix, 16) && hex(id, 32) {
            Some(Self(name.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted record of a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub key: ResourceKey,
    pub blob: BlobId,
    /// Bytes written when this record was committed
    pub bytes_written: u64,
    pub declared_size: Option<u64>,
    pub media_type: Option<String>,
    /// Flipped exactly once, after every byte is written
    pub complete: bool,
    /// When the entry was created (seconds since the UNIX epoch)
    pub cached_at: u64,
}

/// What `remove` does with an entry that still has readers or a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Unlink the entry now, delete its storage once the last holder detaches
    #[default]
    Defer,
    /// Refuse with `CacheError::InUse`
    Fail,
}

/// Outcome of evicting a single entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Storage deleted
    Removed,
    /// Unlinked; storage goes away when the last holder detaches
    Deferred,
}

/// Outcome of evicting a batch of entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed: Vec<ResourceKey>,
    pub deferred: Vec<ResourceKey>,
    /// Entries left alone because they are in use (`EvictionPolicy::Fail`)
    pub in_use: Vec<ResourceKey>,
    pub missing: Vec<ResourceKey>,
}

impl EvictionReport {
    pub fn is_clean(&self) -> bool {
        self.in_use.is_empty() && self.missing.is_empty()
    }
}

/// Configuration for the cache system
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Persist entries on disk; when false the cache lives in memory only
    pub persistent: bool,
    /// Path for disk cache storage (system temp dir when None)
    pub disk_cache_path: Option<PathBuf>,
    /// Behaviour of eviction requests against busy entries
    pub eviction_policy: EvictionPolicy,
    /// Largest entry accepted, in bytes
    pub max_entry_size: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persistent: true,
            disk_cache_path: None,
            eviction_policy: EvictionPolicy::default(),
            max_entry_size: None,
        }
    }
}

impl CacheConfig {
    pub fn in_memory() -> Self {
        Self {
            persistent: false,
            ..Self::default()
        }
    }

    pub fn on_disk(path: impl Into<PathBuf>) -> Self {
        Self {
            persistent: true,
            disk_cache_path: Some(path.into()),
            ..Self::default()
        }
    }
}

/// Result of a cache operation
pub type CacheResult<T> = std::result::Result<T, CacheError>;
