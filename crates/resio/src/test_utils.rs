//! Scripted retrievers for exercising the download manager without a network.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::FetchError;
use crate::key::ResourceDescriptor;
use crate::retriever::{ByteStream, ResumableRetriever, Retriever};

/// Macro to initialize tracing for tests
///
/// Usage:
/// - `init_test_tracing!()` - uses DEBUG level (default)
/// - `init_test_tracing!(INFO)` - uses specified level
#[macro_export]
macro_rules! init_test_tracing {
    () => {
        $crate::init_test_tracing!(DEBUG);
    };
    ($level:ident) => {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::$level)
            .with_test_writer()
            .try_init();
    };
}

// Re-export the macro
#[allow(unused_imports)]
pub use crate::init_test_tracing;

/// Deterministic resource content of `len` bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// What one call to `open`/`open_at` produces
pub enum Attempt {
    /// The open itself fails
    Refuse(FetchError),
    /// Chunks yielded in order, each after `delay`
    Chunks {
        chunks: Vec<Result<Bytes, FetchError>>,
        delay: Duration,
    },
}

impl Attempt {
    /// Serve `data` in `chunk`-sized pieces
    pub fn serve(data: &[u8], chunk: usize) -> Self {
        Self::Chunks {
            chunks: data
                .chunks(chunk.max(1))
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect(),
            delay: Duration::ZERO,
        }
    }

    /// Serve `data` slowly
    pub fn trickle(data: &[u8], chunk: usize, delay: Duration) -> Self {
        match Self::serve(data, chunk) {
            Self::Chunks { chunks, .. } => Self::Chunks { chunks, delay },
            refused => refused,
        }
    }

    /// Serve `data` then fail with `error`
    pub fn broken(data: &[u8], chunk: usize, error: FetchError) -> Self {
        match Self::serve(data, chunk) {
            Self::Chunks { mut chunks, delay } => {
                chunks.push(Err(error));
                Self::Chunks { chunks, delay }
            }
            refused => refused,
        }
    }

    fn into_stream(self) -> Result<ByteStream, FetchError> {
        match self {
            Self::Refuse(e) => Err(e),
            Self::Chunks { chunks, delay } => Ok(Box::pin(stream::unfold(
                chunks.into_iter(),
                move |mut chunks| async move {
                    let chunk = chunks.next()?;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Some((chunk, chunks))
                },
            ))),
        }
    }
}

/// Plays back one scripted [`Attempt`] per open and records every offset asked for.
pub struct ScriptedRetriever {
    attempts: Mutex<VecDeque<Attempt>>,
    offsets: Mutex<Vec<u64>>,
    opens: AtomicUsize,
    resumable: bool,
}

impl ScriptedRetriever {
    pub fn new(attempts: impl IntoIterator<Item = Attempt>) -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(attempts.into_iter().collect()),
            offsets: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            resumable: false,
        })
    }

    pub fn resumable(attempts: impl IntoIterator<Item = Attempt>) -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(attempts.into_iter().collect()),
            offsets: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            resumable: true,
        })
    }

    /// Calls to `open` and `open_at`
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Offset requested by each open, in order
    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().clone()
    }

    fn next(&self, offset: u64) -> Result<ByteStream, FetchError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.offsets.lock().push(offset);
        let attempt = self
            .attempts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Attempt::Refuse(FetchError::terminal("script exhausted")));
        attempt.into_stream()
    }
}

#[async_trait]
impl Retriever for ScriptedRetriever {
    async fn open(&self, _descriptor: &ResourceDescriptor) -> Result<ByteStream, FetchError> {
        self.next(0)
    }

    fn resumable(&self) -> Option<&dyn ResumableRetriever> {
        if self.resumable { Some(self) } else { None }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[async_trait]
impl ResumableRetriever for ScriptedRetriever {
    async fn open_at(
        &self,
        _descriptor: &ResourceDescriptor,
        offset: u64,
    ) -> Result<ByteStream, FetchError> {
        self.next(offset)
    }
}

/// A retriever whose single stream is fed by the test through a channel.
pub struct ChannelRetriever {
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Result<Bytes, FetchError>>>>,
    opens: AtomicUsize,
}

impl ChannelRetriever {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<Result<Bytes, FetchError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let retriever = Arc::new(Self {
            receiver: Mutex::new(Some(rx)),
            opens: AtomicUsize::new(0),
        });
        (retriever, tx)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Retriever for ChannelRetriever {
    async fn open(&self, _descriptor: &ResourceDescriptor) -> Result<ByteStream, FetchError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let rx = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| FetchError::terminal("channel already opened"))?;
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            let chunk = rx.recv().await?;
            Some((chunk, rx))
        })))
    }
}
