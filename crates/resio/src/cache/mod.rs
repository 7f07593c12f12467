//! # Cache System
//!
//! Keyed storage for downloaded resources. An entry is written by exactly one
//! [`CacheWriter`] while any number of [`CacheReader`]s follow it, each with
//! its own cursor.

mod entry;
pub mod providers;
mod store;
mod types;

pub(crate) use entry::EntryShared;
pub use entry::{CacheReader, CacheWriter};
pub use store::ResourceCache;
pub use types::{
    BlobId, CacheConfig, CacheResult, EntryMetadata, EvictionPolicy, EvictionReport, Removal,
};

pub use providers::{BlobReader, BlobWriter, CacheProvider, FileCache, MemoryCache};
