use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::cache::CacheConfig;
use crate::retry::RetryPolicy;

const DEFAULT_USER_AGENT: &str = concat!("resio/", env!("CARGO_PKG_VERSION"));

/// Configurable options for the download manager
#[derive(Debug, Clone)]
pub struct DownloadManagerConfig {
    /// Cache configuration
    pub cache: CacheConfig,

    /// Retry behaviour of the producer
    pub retry: RetryPolicy,

    /// How long a cancelled producer may keep running before it is aborted
    pub cancel_grace_period: Duration,

    /// Number of terminal outcomes remembered for keys no longer cached
    pub outcome_capacity: u64,

    /// How long a terminal outcome is remembered
    pub outcome_ttl: Duration,
}

impl Default for DownloadManagerConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            retry: RetryPolicy::default(),
            cancel_grace_period: Duration::from_secs(5),
            outcome_capacity: 1024,
            outcome_ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl DownloadManagerConfig {
    pub fn builder() -> crate::builder::DownloadManagerConfigBuilder {
        crate::builder::DownloadManagerConfigBuilder::new()
    }
}

/// Configurable options for the HTTP retriever
#[derive(Debug, Clone)]
pub struct HttpRetrieverConfig {
    /// Overall timeout for the entire HTTP request
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    /// Explicit proxy URL (optional)
    pub proxy: Option<String>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,

    pub danger_accept_invalid_certs: bool, // For reqwest's `danger_accept_invalid_certs`
}

impl Default for HttpRetrieverConfig {
    fn default() -> Self {
        Self {
            // Large resources take a while; stalls are caught by the read timeout
            timeout: Duration::from_secs(60 * 60),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpRetrieverConfig::get_default_headers(),
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
        }
    }
}

impl HttpRetrieverConfig {
    pub fn builder() -> crate::builder::HttpRetrieverConfigBuilder {
        crate::builder::HttpRetrieverConfigBuilder::new()
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        // Byte offsets of ranged requests must match the stored bytes
        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("identity"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers
    }
}
