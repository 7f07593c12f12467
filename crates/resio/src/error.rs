use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

use crate::key::ResourceKey;
use crate::status::InvalidTransition;

/// Errors returned synchronously by cache bookkeeping operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache entry for `{key}` already exists")]
    AlreadyExists { key: ResourceKey },

    #[error("cache entry for `{key}` is in use by {holders} holder(s)")]
    InUse { key: ResourceKey, holders: usize },

    #[error("no cache entry for `{key}`")]
    NotFound { key: ResourceKey },

    #[error("cache entry for `{key}` would exceed {limit} bytes")]
    EntryTooLarge { key: ResourceKey, limit: u64 },

    #[error("cache entry for `{key}` would hold {received} bytes but {declared} were declared")]
    ExceedsDeclaredSize {
        key: ResourceKey,
        declared: u64,
        received: u64,
    },

    #[error("cache metadata error: {reason}")]
    Metadata { reason: String },

    #[error("cache I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl CacheError {
    pub fn metadata(reason: impl Into<String>) -> Self {
        Self::Metadata {
            reason: reason.into(),
        }
    }
}

/// A failure of a single fetch attempt, classified once as transient or terminal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("connection failed: {reason}")]
    Connection { reason: String },

    #[error("fetch timed out: {reason}")]
    Timeout { reason: String },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    #[error("access denied to {resource}")]
    Unauthorized { resource: String },

    #[error("stream ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    #[error("received {received} bytes but {declared} were declared")]
    LengthMismatch { declared: u64, received: u64 },

    #[error("entry exceeds the cache limit of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("cache storage error: {reason}")]
    Storage { reason: String },

    #[error("invalid descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    #[error("{reason}")]
    Other { reason: String, retryable: bool },
}

impl FetchError {
    /// A failure worth another attempt (connection reset, flaky upstream, ...).
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Other {
            reason: reason.into(),
            retryable: true,
        }
    }

    /// A failure no retry can fix.
    pub fn terminal(reason: impl Into<String>) -> Self {
        Self::Other {
            reason: reason.into(),
            retryable: false,
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        let url = url.into();
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => Self::NotFound { resource: url },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Self::Unauthorized { resource: url }
            }
            _ => Self::HttpStatus { status, url },
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage {
            reason: err.to_string(),
        }
    }

    pub fn invalid_descriptor(reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } | Self::Truncated { .. } => true,
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Other { retryable, .. } => *retryable,
            Self::NotFound { .. }
            | Self::Unauthorized { .. }
            | Self::LengthMismatch { .. }
            | Self::TooLarge { .. }
            | Self::Storage { .. }
            | Self::InvalidDescriptor { .. } => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                reason: err.to_string(),
            };
        }
        if err.is_connect() {
            return Self::Connection {
                reason: err.to_string(),
            };
        }
        if let Some(status) = err.status() {
            let url = err.url().map(|u| u.to_string()).unwrap_or_default();
            return Self::http_status(status, url);
        }
        Self::Other {
            reason: err.to_string(),
            retryable: err.is_request() || err.is_body() || err.is_decode(),
        }
    }
}

/// The producer reports cache write failures as fetch failures; none are retried.
impl From<CacheError> for FetchError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::EntryTooLarge { limit, .. } => Self::TooLarge { limit },
            CacheError::ExceedsDeclaredSize {
                declared, received, ..
            } => Self::LengthMismatch { declared, received },
            other => Self::storage(other),
        }
    }
}

/// Errors surfaced to callers of the download manager and to followers.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("download of `{key}` failed: {source}")]
    DownloadFailed {
        key: ResourceKey,
        source: Arc<FetchError>,
    },

    #[error("download of `{key}` restarted from zero after {delivered} bytes were read")]
    Restarted { key: ResourceKey, delivered: u64 },

    #[error("operation timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("cache error: {source}")]
    Cache {
        #[from]
        source: CacheError,
    },

    #[error("storage I/O error: {source}")]
    Storage {
        #[from]
        source: std::io::Error,
    },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl DownloadError {
    pub fn failed(key: ResourceKey, source: Arc<FetchError>) -> Self {
        Self::DownloadFailed { key, source }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The fetch failure behind a `DownloadFailed`, if any.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            Self::DownloadFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<DownloadError> for std::io::Error {
    fn from(err: DownloadError) -> Self {
        let kind = match &err {
            DownloadError::Cancelled => std::io::ErrorKind::Interrupted,
            DownloadError::Timeout { .. } => std::io::ErrorKind::TimedOut,
            DownloadError::Storage { source } => source.kind(),
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
