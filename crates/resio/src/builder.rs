//! # Configuration builders
//!
//! Fluent builders for [`DownloadManagerConfig`] and [`HttpRetrieverConfig`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use resio_engine::{DownloadManagerConfig, EvictionPolicy, HttpRetrieverConfig};
//!
//! let config = DownloadManagerConfig::builder()
//!     .with_in_memory_cache()
//!     .with_eviction_policy(EvictionPolicy::Fail)
//!     .with_max_retries(5)
//!     .with_base_delay(Duration::from_millis(250))
//!     .with_cancel_grace_period(Duration::from_secs(2))
//!     .build();
//!
//! let http = HttpRetrieverConfig::builder()
//!     .with_connect_timeout(Duration::from_secs(15))
//!     .with_user_agent("MyApp/1.0")
//!     .with_header("X-Api-Key", "my-secret-key")
//!     .build();
//! ```

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::cache::{CacheConfig, EvictionPolicy};
use crate::config::{DownloadManagerConfig, HttpRetrieverConfig};
use crate::retry::RetryPolicy;

/// Builder for creating DownloadManagerConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct DownloadManagerConfigBuilder {
    /// Internal config being built
    config: DownloadManagerConfig,
}

impl DownloadManagerConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: DownloadManagerConfig::default(),
        }
    }

    /// Set the cache configuration
    pub fn with_cache_config(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    /// Keep cached resources in memory only
    pub fn with_in_memory_cache(mut self) -> Self {
        self.config.cache.persistent = false;
        self.config.cache.disk_cache_path = None;
        self
    }

    /// Persist cached resources under `path`
    pub fn with_cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cache.persistent = true;
        self.config.cache.disk_cache_path = Some(path.into());
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.config.cache.eviction_policy = policy;
        self
    }

    /// Reject entries larger than `limit` bytes
    pub fn with_max_entry_size(mut self, limit: u64) -> Self {
        self.config.cache.max_entry_size = Some(limit);
        self
    }

    /// Replace the whole retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay = delay;
        self
    }

    /// Bound the total time spent retrying one download
    pub fn with_max_elapsed(mut self, elapsed: Duration) -> Self {
        self.config.retry.max_elapsed = elapsed;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.config.retry.jitter = jitter;
        self
    }

    pub fn with_cancel_grace_period(mut self, grace: Duration) -> Self {
        self.config.cancel_grace_period = grace;
        self
    }

    /// Number of failed or cancelled outcomes remembered for `state()`
    pub fn with_outcome_capacity(mut self, capacity: u64) -> Self {
        self.config.outcome_capacity = capacity;
        self
    }

    pub fn with_outcome_ttl(mut self, ttl: Duration) -> Self {
        self.config.outcome_ttl = ttl;
        self
    }

    /// Build the DownloadManagerConfig instance
    pub fn build(self) -> DownloadManagerConfig {
        self.config
    }
}

impl Default for DownloadManagerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating HttpRetrieverConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct HttpRetrieverConfigBuilder {
    config: HttpRetrieverConfig,
}

impl HttpRetrieverConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: HttpRetrieverConfig::default(),
        }
    }

    /// Set the overall timeout for the entire HTTP request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the connection timeout (time to establish initial connection)
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the read timeout (maximum time between receiving data chunks)
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Set whether to follow redirects
    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a custom HTTP header
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.headers.insert(name, value);
        }
        self
    }

    /// Set all HTTP headers, replacing any existing headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.headers = headers;
        self
    }

    /// Route every request through `url`
    pub fn with_proxy(mut self, url: impl Into<String>) -> Self {
        self.config.proxy = Some(url.into());
        self.config.use_system_proxy = false; // Explicit proxy overrides system proxy
        self
    }

    /// Set whether to use system proxy settings if available
    pub fn with_system_proxy(mut self, use_system_proxy: bool) -> Self {
        // Only set system proxy if no explicit proxy is configured
        if self.config.proxy.is_none() {
            self.config.use_system_proxy = use_system_proxy;
        }
        self
    }

    /// Set whether to accept invalid certificates
    ///
    /// # Warning
    /// This is unsafe and should only be used for testing or in controlled environments.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.config.danger_accept_invalid_certs = accept;
        self
    }

    /// Build the HttpRetrieverConfig instance
    pub fn build(self) -> HttpRetrieverConfig {
        self.config
    }
}

impl Default for HttpRetrieverConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_builder_defaults() {
        let config = DownloadManagerConfigBuilder::new().build();
        assert!(config.cache.persistent);
        assert_eq!(config.cache.eviction_policy, EvictionPolicy::Defer);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.retry.max_delay, Duration::from_secs(10));
        assert!(config.retry.jitter);
    }

    #[test]
    fn test_manager_builder_customization() {
        let config = DownloadManagerConfigBuilder::new()
            .with_cache_dir("/var/cache/resio")
            .with_eviction_policy(EvictionPolicy::Fail)
            .with_max_entry_size(1 << 20)
            .with_max_retries(7)
            .with_jitter(false)
            .with_cancel_grace_period(Duration::from_millis(200))
            .build();

        assert_eq!(
            config.cache.disk_cache_path,
            Some(PathBuf::from("/var/cache/resio"))
        );
        assert_eq!(config.cache.eviction_policy, EvictionPolicy::Fail);
        assert_eq!(config.cache.max_entry_size, Some(1 << 20));
        assert_eq!(config.retry.max_retries, 7);
        assert!(!config.retry.jitter);
        assert_eq!(config.cancel_grace_period, Duration::from_millis(200));

        let memory = DownloadManagerConfigBuilder::new()
            .with_cache_dir("/tmp/x")
            .with_in_memory_cache()
            .build();
        assert!(!memory.cache.persistent);
        assert!(memory.cache.disk_cache_path.is_none());
    }

    #[test]
    fn test_http_builder_customization() {
        let config = HttpRetrieverConfigBuilder::new()
            .with_timeout(Duration::from_secs(60))
            .with_connect_timeout(Duration::from_secs(20))
            .with_follow_redirects(false)
            .with_user_agent("CustomUserAgent/1.0")
            .with_header("X-Custom-Header", "CustomValue")
            .with_system_proxy(false)
            .build();

        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert!(!config.follow_redirects);
        assert_eq!(config.user_agent, "CustomUserAgent/1.0");
        assert!(!config.use_system_proxy);

        let header_value = config.headers.get("X-Custom-Header").unwrap();
        assert_eq!(header_value.to_str().unwrap(), "CustomValue");
        assert_eq!(
            config.headers.get(reqwest::header::ACCEPT_ENCODING).unwrap(),
            "identity"
        );
    }

    #[test]
    fn test_explicit_proxy_disables_system_proxy() {
        let config = HttpRetrieverConfigBuilder::new()
            .with_proxy("http://proxy.example.com:8080")
            .with_system_proxy(true)
            .build();

        assert_eq!(
            config.proxy.as_deref(),
            Some("http://proxy.example.com:8080")
        );
        assert!(!config.use_system_proxy);
    }
}
