//! # Cache Providers
//!
//! This module contains different cache provider implementations.

pub mod file;
pub mod memory;
pub mod provider;

pub use file::FileCache;
pub use memory::MemoryCache;
pub use provider::{BlobReader, BlobWriter, CacheProvider};
