//! # HTTP Retriever
//!
//! A [`Retriever`] over `reqwest`. The descriptor's `uri` names the resource;
//! ranged opens send `Range: bytes=<offset>-`. Servers that ignore the range
//! and answer 200 get the already-cached prefix skipped client side.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, StatusCode, header};
use rustls::{ClientConfig, crypto::aws_lc_rs};
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::HttpRetrieverConfig;
use crate::error::{DownloadError, FetchError};
use crate::key::ResourceDescriptor;
use crate::retriever::{ByteStream, ResumableRetriever, Retriever};

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &HttpRetrieverConfig) -> Result<Client, DownloadError> {
    // Create the crypto provider
    let provider = Arc::new(aws_lc_rs::default_provider());

    // Build platform default TLS configuration
    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| DownloadError::configuration(format!("TLS protocol versions: {e}")))?
        .with_platform_verifier()
        .map_err(|e| DownloadError::configuration(format!("platform certificate verifier: {e}")))?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5) // Allow multiple connections to same host
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config)
        .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    // Set up proxy configuration
    if let Some(proxy_url) = &config.proxy {
        // Explicit proxy configuration takes precedence
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| DownloadError::configuration(format!("invalid proxy {proxy_url}: {e}")))?;
        client_builder = client_builder.proxy(proxy);
        info!(proxy_url = %proxy_url, "Using explicitly configured proxy for downloads");
    } else if config.use_system_proxy {
        // reqwest will use system proxy settings by default when we don't call no_proxy()
        info!("Using system proxy settings for downloads");
    } else {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled for downloads");
    }

    client_builder
        .build()
        .map_err(|e| DownloadError::configuration(format!("failed to build HTTP client: {e}")))
}

/// Fetches resources over HTTP(S), resuming with range requests
#[derive(Debug, Clone)]
pub struct HttpRetriever {
    client: Client,
}

impl HttpRetriever {
    pub fn new(config: &HttpRetrieverConfig) -> Result<Self, DownloadError> {
        Ok(Self {
            client: create_client(config)?,
        })
    }

    /// Use an already configured client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn request(
        &self,
        descriptor: &ResourceDescriptor,
        offset: u64,
    ) -> Result<ByteStream, FetchError> {
        let url = resource_url(descriptor)?;

        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }

        debug!(key = %descriptor.key, url = %url, offset, "Sending request");
        let response = request.send().await?;
        let status = response.status();

        let skip = match status {
            StatusCode::PARTIAL_CONTENT => 0,
            s if s.is_success() => {
                if offset > 0 {
                    warn!(key = %descriptor.key, offset, "Server ignored range request, skipping prefix");
                }
                offset
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                return Err(FetchError::LengthMismatch {
                    declared: descriptor.declared_size.unwrap_or(offset),
                    received: offset,
                });
            }
            s => return Err(FetchError::http_status(s, url.as_str())),
        };

        let stream = response.bytes_stream().map(|chunk| chunk.map_err(FetchError::from));
        if skip == 0 {
            return Ok(Box::pin(stream));
        }
        Ok(Box::pin(skip_prefix(stream, skip)))
    }
}

fn resource_url(descriptor: &ResourceDescriptor) -> Result<Url, FetchError> {
    let uri = descriptor.uri.as_deref().ok_or_else(|| {
        FetchError::invalid_descriptor(format!("`{}` has no uri", descriptor.key))
    })?;
    let url = Url::parse(uri)
        .map_err(|e| FetchError::invalid_descriptor(format!("invalid uri {uri}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(FetchError::invalid_descriptor(format!(
            "unsupported scheme `{scheme}` in {uri}"
        ))),
    }
}

/// Drop the first `skip` bytes of `stream`.
fn skip_prefix<S>(stream: S, skip: u64) -> impl futures::Stream<Item = Result<Bytes, FetchError>>
where
    S: futures::Stream<Item = Result<Bytes, FetchError>> + Send,
{
    stream.scan(skip, |remaining, chunk| {
        let item = match chunk {
            Ok(mut bytes) if *remaining > 0 => {
                let cut = (*remaining).min(bytes.len() as u64) as usize;
                *remaining -= cut as u64;
                Some(Ok(bytes.split_off(cut)))
            }
            other => Some(other),
        };
        futures::future::ready(item)
    })
    .filter(|chunk| futures::future::ready(!matches!(chunk, Ok(bytes) if bytes.is_empty())))
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn open(&self, descriptor: &ResourceDescriptor) -> Result<ByteStream, FetchError> {
        self.request(descriptor, 0).await
    }

    fn resumable(&self) -> Option<&dyn ResumableRetriever> {
        Some(self)
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[async_trait]
impl ResumableRetriever for HttpRetriever {
    async fn open_at(
        &self,
        descriptor: &ResourceDescriptor,
        offset: u64,
    ) -> Result<ByteStream, FetchError> {
        self.request(descriptor, offset).await
    }
}
