//! # Resource Stream
//!
//! The handle a caller of [`DownloadManager::download`](crate::DownloadManager::download)
//! reads from. Every follower reads the shared cache entry with its own
//! cursor; closing one never disturbs the others.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::io::StreamReader;

use crate::cache::CacheReader;
use crate::error::DownloadError;
use crate::key::ResourceKey;
use crate::manager::FollowerGuard;
use crate::status::DownloadStatus;

/// Default chunk size of [`ResourceStream::into_bytes_stream`]
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A follower of one resource download, or a reader over a cached copy
pub struct ResourceStream {
    reader: CacheReader,
    /// Present while a producer may still be filling the entry
    follower: Option<FollowerGuard>,
}

impl ResourceStream {
    pub(crate) fn cached(reader: CacheReader) -> Self {
        Self {
            reader,
            follower: None,
        }
    }

    pub(crate) fn following(reader: CacheReader, follower: FollowerGuard) -> Self {
        Self {
            reader,
            follower: Some(follower),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        self.reader.key()
    }

    /// Whether this stream was served from an already complete entry
    pub fn is_cache_hit(&self) -> bool {
        self.follower.is_none()
    }

    pub fn media_type(&self) -> Option<&str> {
        self.reader.media_type()
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.reader.declared_size()
    }

    /// Read the next bytes into `buf`.
    ///
    /// Waits until at least one byte is available. Returns 0 at the end of a
    /// completed resource; a failed download surfaces as
    /// [`DownloadError::DownloadFailed`] rather than a short read. If the
    /// download had to start over after this stream consumed bytes, reads
    /// fail with [`DownloadError::Restarted`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, DownloadError> {
        self.reader.read(buf).await
    }

    /// Wait until a [`read`](Self::read) would not block. Consumes nothing.
    pub async fn ready(&mut self) -> Result<(), DownloadError> {
        self.reader.ready().await
    }

    /// Like [`read`](Self::read) but gives up after `timeout`. The stream stays
    /// usable and the download is unaffected.
    pub async fn read_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, DownloadError> {
        match tokio::time::timeout(timeout, self.reader.read(buf)).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Timeout { elapsed: timeout }),
        }
    }

    /// Read everything that remains.
    pub async fn read_to_end(&mut self) -> Result<Bytes, DownloadError> {
        let mut out = BytesMut::new();
        let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
        loop {
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(out.freeze());
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Bytes this follower has consumed
    pub fn bytes_delivered(&self) -> u64 {
        self.reader.position()
    }

    /// Bytes currently in the cache entry
    pub fn bytes_available(&self) -> u64 {
        self.reader.available()
    }

    /// Lifecycle status of the download behind this stream
    pub fn state(&self) -> DownloadStatus {
        self.reader.status()
    }

    /// Detach this follower. The last follower to detach before completion
    /// cancels the download.
    pub fn close(self) {}

    /// Chunked [`futures::Stream`] view; ends after the last byte or the first error.
    pub fn into_bytes_stream(
        self,
        chunk_size: usize,
    ) -> BoxStream<'static, Result<Bytes, DownloadError>> {
        let chunk_size = chunk_size.max(1);
        stream::unfold(Some(self), move |state| async move {
            let mut follower = state?;
            let mut buf = BytesMut::zeroed(chunk_size);
            match follower.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(buf.freeze()), Some(follower)))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }

    /// [`tokio::io::AsyncRead`] view over the remaining bytes.
    pub fn into_async_read(
        self,
    ) -> StreamReader<BoxStream<'static, Result<Bytes, DownloadError>>, Bytes> {
        StreamReader::new(self.into_bytes_stream(DEFAULT_CHUNK_SIZE))
    }
}

impl std::fmt::Debug for ResourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStream")
            .field("key", self.key())
            .field("delivered", &self.bytes_delivered())
            .field("cache_hit", &self.is_cache_hit())
            .finish()
    }
}
