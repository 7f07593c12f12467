//! # Resio
//!
//! A library for reliable retrieval and caching of large remote resources.
//! Each resource is fetched at most once per concurrent demand; callers read
//! bytes as they arrive while the same bytes are persisted for later requests.
//!
//! ## Features
//!
//! - De-duplication of concurrent downloads per resource key
//! - Streaming reads from a cache entry that is still filling
//! - Retry with exponential backoff, resuming from the cached offset
//! - Memory and file cache providers with deferred eviction
//! - Ordered lifecycle events for every download

pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod key;
pub mod manager;
pub mod retriever;
pub mod retry;
pub mod status;
pub mod stream;

#[cfg(test)]
pub(crate) mod test_utils;

pub use builder::{DownloadManagerConfigBuilder, HttpRetrieverConfigBuilder};
pub use cache::{
    CacheConfig, CacheProvider, CacheReader, CacheWriter, EvictionPolicy, EvictionReport,
    FileCache, MemoryCache, Removal, ResourceCache,
};
pub use config::{DownloadManagerConfig, HttpRetrieverConfig};
pub use error::{CacheError, DownloadError, FetchError};
pub use events::{StatusEvent, StatusPublisher, StatusSink};
pub use http::{HttpRetriever, create_client};
pub use key::{ResourceDescriptor, ResourceKey};
pub use manager::DownloadManager;
pub use retriever::{ByteStream, ResumableRetriever, Retriever};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use status::{DownloadStatus, InvalidTransition};
pub use stream::ResourceStream;
