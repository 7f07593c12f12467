//! # Download Manager
//!
//! De-duplicates concurrent requests per [`ResourceKey`], runs one producer
//! task per in-flight key and hands every caller a [`ResourceStream`] over
//! the shared cache entry.
//!
//! Lock order: the in-flight index is taken before the cache index. Neither
//! is held across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::StreamExt;
use moka::sync::Cache;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CacheWriter, EntryShared, EvictionReport, ResourceCache};
use crate::config::DownloadManagerConfig;
use crate::error::{DownloadError, FetchError};
use crate::events::{StatusEvent, StatusPublisher, StatusSink};
use crate::key::{ResourceDescriptor, ResourceKey};
use crate::retriever::{Retriever, open_from};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::status::DownloadStatus;
use crate::stream::ResourceStream;

type InFlightIndex = Mutex<HashMap<ResourceKey, Arc<InFlightDownload>>>;

/// The single producer of one key and the followers attached to it.
pub(crate) struct InFlightDownload {
    entry: Arc<EntryShared>,
    /// Only changed while the in-flight index is locked
    followers: AtomicUsize,
    cancel: CancellationToken,
    producer: OnceLock<AbortHandle>,
}

impl InFlightDownload {
    /// Signal the producer and abort it if it outlives `grace`.
    fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();

        let Some(producer) = self.producer.get().cloned() else {
            return;
        };
        let key = self.entry.key().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if !producer.is_finished() {
                        warn!(key = %key, grace = ?grace, "Producer ignored cancellation, aborting");
                        producer.abort();
                    }
                });
            }
            Err(_) => producer.abort(),
        }
    }
}

/// State shared by the manager, its producers and its followers.
struct ManagerShared {
    in_flight: InFlightIndex,
    /// Last FAILED/CANCELLED outcome of keys whose entry was discarded
    outcomes: Cache<ResourceKey, DownloadStatus>,
    cancel_grace_period: Duration,
}

impl ManagerShared {
    /// Remove `download` from the index unless a newer download replaced it.
    fn unlink(
        index: &mut HashMap<ResourceKey, Arc<InFlightDownload>>,
        download: &Arc<InFlightDownload>,
    ) -> bool {
        let key = download.entry.key();
        if index.get(key).is_some_and(|d| Arc::ptr_eq(d, download)) {
            index.remove(key);
            return true;
        }
        false
    }

    fn record_outcome(&self, key: &ResourceKey, status: DownloadStatus) {
        match status {
            DownloadStatus::Failed | DownloadStatus::Cancelled => {
                self.outcomes.insert(key.clone(), status)
            }
            DownloadStatus::Complete => self.outcomes.invalidate(key),
            _ => {}
        }
    }

    /// Cancel `download` while the index is locked by the caller.
    fn cancel_locked(
        &self,
        index: &mut HashMap<ResourceKey, Arc<InFlightDownload>>,
        download: &Arc<InFlightDownload>,
        reason: &str,
    ) -> bool {
        if !download.entry.cancel(Some(reason.to_string())) {
            return false;
        }
        Self::unlink(index, download);
        self.record_outcome(download.entry.key(), DownloadStatus::Cancelled);
        download.shutdown(self.cancel_grace_period);
        true
    }
}

/// Keeps a follower attached to an in-flight download.
///
/// Dropping the last guard before the download settles cancels it.
pub(crate) struct FollowerGuard {
    download: Arc<InFlightDownload>,
    shared: Arc<ManagerShared>,
}

impl Drop for FollowerGuard {
    fn drop(&mut self) {
        let mut index = self.shared.in_flight.lock();
        let remaining = self.download.followers.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 || self.download.entry.status().is_terminal() {
            return;
        }

        if self
            .shared
            .cancel_locked(&mut index, &self.download, "all followers detached")
        {
            info!(key = %self.download.entry.key(), "Last follower detached, download cancelled");
        }
    }
}

/// Why a producer stopped before completing.
enum Interrupt {
    Cancelled,
    Failed(Arc<FetchError>),
}

impl From<FetchError> for Interrupt {
    fn from(err: FetchError) -> Self {
        Self::Failed(Arc::new(err))
    }
}

/// The task that copies retriever output into the cache entry.
struct Producer {
    descriptor: ResourceDescriptor,
    retriever: Arc<dyn Retriever>,
    writer: CacheWriter,
    download: Arc<InFlightDownload>,
    shared: Arc<ManagerShared>,
    retry: RetryPolicy,
}

impl Producer {
    async fn run(mut self) {
        let key = self.descriptor.key.clone();
        debug!(key = %key, retriever = self.retriever.name(), "Producer started");

        match self.drive().await {
            Ok(()) => {
                info!(key = %key, bytes = self.writer.written(), "Download complete");
            }
            Err(Interrupt::Cancelled) => {
                debug!(key = %key, bytes = self.writer.written(), "Producer stopped by cancellation");
                self.writer.cancel(Some("download cancelled".to_string()));
            }
            Err(Interrupt::Failed(e)) => {
                error!(key = %key, error = %e, "Download failed");
                self.writer.fail(e);
            }
        }

        let status = self.writer.status();
        {
            let mut index = self.shared.in_flight.lock();
            ManagerShared::unlink(&mut index, &self.download);
        }
        self.shared.record_outcome(&key, status);
    }

    /// Attempt, retry and resume until the entry settles.
    async fn drive(&mut self) -> Result<(), Interrupt> {
        let mut state = RetryState::new();
        loop {
            let error = match self.attempt().await {
                Ok(()) => return Ok(()),
                Err(Interrupt::Cancelled) => return Err(Interrupt::Cancelled),
                Err(Interrupt::Failed(e)) => e,
            };

            let after = match self.retry.decide(&mut state, error.clone()) {
                RetryDecision::Retry { after } => after,
                RetryDecision::GiveUp => return Err(Interrupt::Failed(error)),
            };

            warn!(
                key = %self.descriptor.key,
                attempt = state.attempt,
                max_retries = self.retry.max_retries,
                delay = ?after,
                error = %error,
                "Fetch attempt failed, retrying"
            );
            if self
                .writer
                .transition(DownloadStatus::Retrying, Some(error.to_string()))
                .is_err()
            {
                return Err(Interrupt::Cancelled);
            }

            tokio::select! {
                biased;
                _ = self.download.cancel.cancelled() => return Err(Interrupt::Cancelled),
                _ = tokio::time::sleep(after) => {}
            }
        }
    }

    /// One fetch attempt, resuming from the cached offset when possible.
    async fn attempt(&mut self) -> Result<(), Interrupt> {
        let token = self.download.cancel.clone();
        let offset = self.writer.written();

        let (mut stream, start) = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Interrupt::Cancelled),
            opened = open_from(self.retriever.as_ref(), &self.descriptor, offset) => opened?,
        };

        if start != offset {
            debug!(key = %self.descriptor.key, discarded = offset, "Retriever cannot resume, restarting entry");
            self.writer.restart().await.map_err(FetchError::from)?;
        } else if offset > 0 {
            debug!(key = %self.descriptor.key, offset, "Resuming download");
        }

        if self
            .writer
            .transition(DownloadStatus::InProgress, None)
            .is_err()
        {
            return Err(Interrupt::Cancelled);
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Interrupt::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => self.writer.append(&chunk).await.map_err(FetchError::from)?,
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        self.writer.verify_length()?;

        match self.writer.commit().await {
            Ok(()) => Ok(()),
            Err(DownloadError::InvalidTransition(_)) => Err(Interrupt::Cancelled),
            Err(e) => Err(FetchError::storage(e).into()),
        }
    }
}

/// Orchestrates managed downloads over a [`ResourceCache`]
#[derive(Clone)]
pub struct DownloadManager {
    cache: ResourceCache,
    shared: Arc<ManagerShared>,
    publisher: Arc<StatusPublisher>,
    config: Arc<DownloadManagerConfig>,
}

impl DownloadManager {
    /// Create a manager, opening the cache described by `config.cache`
    pub async fn new(config: DownloadManagerConfig) -> Result<Self, DownloadError> {
        let publisher = Arc::new(StatusPublisher::new());
        let cache = ResourceCache::open(config.cache.clone(), publisher.clone()).await?;
        Ok(Self::with_cache(config, cache, publisher))
    }

    /// Create a manager over an existing cache. `publisher` must be the one
    /// the cache was opened with.
    pub fn with_cache(
        config: DownloadManagerConfig,
        cache: ResourceCache,
        publisher: Arc<StatusPublisher>,
    ) -> Self {
        let outcomes = Cache::builder()
            .max_capacity(config.outcome_capacity)
            .time_to_live(config.outcome_ttl)
            .build();

        Self {
            cache,
            shared: Arc::new(ManagerShared {
                in_flight: Mutex::new(HashMap::new()),
                outcomes,
                cancel_grace_period: config.cancel_grace_period,
            }),
            publisher,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &DownloadManagerConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn publisher(&self) -> &Arc<StatusPublisher> {
        &self.publisher
    }

    /// Receive every status event from now on
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<StatusEvent> {
        self.publisher.subscribe()
    }

    /// Forward status events to `sink` from a background task
    pub fn register_sink(&self, sink: Arc<dyn StatusSink>) -> tokio::task::JoinHandle<()> {
        self.publisher.register(sink)
    }

    /// Start or join the download of `descriptor`.
    ///
    /// A complete cache entry is served without fetching; a download already
    /// in flight for the key gains a follower; otherwise a producer task is
    /// spawned. At most one producer runs per key.
    #[instrument(skip(self, descriptor, retriever), fields(key = %descriptor.key), level = "debug")]
    pub async fn download(
        &self,
        descriptor: &ResourceDescriptor,
        retriever: Arc<dyn Retriever>,
    ) -> Result<ResourceStream, DownloadError> {
        let key = &descriptor.key;
        let mut index = self.shared.in_flight.lock();

        if let Some(reader) = self.cache.get(key) {
            if reader.status() == DownloadStatus::Complete {
                debug!(key = %key, "Serving from cache");
                return Ok(ResourceStream::cached(reader));
            }
        }

        if let Some(download) = index.get(key).cloned() {
            let live = !matches!(
                download.entry.status(),
                DownloadStatus::Failed | DownloadStatus::Cancelled
            );
            if live {
                if let Some(reader) = download.entry.reader() {
                    download.followers.fetch_add(1, Ordering::AcqRel);
                    debug!(
                        key = %key,
                        followers = download.followers.load(Ordering::Acquire),
                        "Attached to in-flight download"
                    );
                    let guard = FollowerGuard {
                        download,
                        shared: self.shared.clone(),
                    };
                    return Ok(ResourceStream::following(reader, guard));
                }
            }
            // Settled unsuccessfully; its producer is winding down
            ManagerShared::unlink(&mut index, &download);
        }

        let writer = self.cache.put(descriptor)?;
        let entry = writer.shared().clone();
        let reader = entry.reader().ok_or_else(|| {
            DownloadError::configuration(format!("cache entry for `{key}` vanished"))
        })?;

        let download = Arc::new(InFlightDownload {
            entry,
            followers: AtomicUsize::new(1),
            cancel: CancellationToken::new(),
            producer: OnceLock::new(),
        });
        index.insert(key.clone(), download.clone());
        drop(index);

        let producer = Producer {
            descriptor: descriptor.clone(),
            retriever,
            writer,
            download: download.clone(),
            shared: self.shared.clone(),
            retry: self.config.retry.clone(),
        };
        let handle = tokio::spawn(producer.run());
        let _ = download.producer.set(handle.abort_handle());

        info!(key = %key, "Download started");
        let guard = FollowerGuard {
            download,
            shared: self.shared.clone(),
        };
        Ok(ResourceStream::following(reader, guard))
    }

    /// [`download`](Self::download) that gives up when no byte arrives
    /// within `deadline`.
    ///
    /// On timeout the caller detaches like any closed follower; other
    /// followers and the download itself are unaffected.
    pub async fn download_with_timeout(
        &self,
        descriptor: &ResourceDescriptor,
        retriever: Arc<dyn Retriever>,
        deadline: Duration,
    ) -> Result<ResourceStream, DownloadError> {
        let mut stream = self.download(descriptor, retriever).await?;
        match tokio::time::timeout(deadline, stream.ready()).await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!(key = %descriptor.key, deadline = ?deadline, "No data before deadline, detaching");
                Err(DownloadError::Timeout { elapsed: deadline })
            }
        }
    }

    /// Cancel an in-flight download; its followers read `Cancelled`.
    pub fn cancel(&self, key: &ResourceKey) -> bool {
        let mut index = self.shared.in_flight.lock();
        let Some(download) = index.get(key).cloned() else {
            return false;
        };
        let cancelled = self
            .shared
            .cancel_locked(&mut index, &download, "cancelled by operator");
        if cancelled {
            info!(key = %key, "Download cancelled by operator");
        }
        cancelled
    }

    /// Evict the cache entries of `keys`.
    pub async fn remove_by_ids<I, K>(&self, keys: I) -> Result<EvictionReport, DownloadError>
    where
        I: IntoIterator<Item = K>,
        K: Into<ResourceKey>,
    {
        let keys: Vec<ResourceKey> = keys.into_iter().map(Into::into).collect();
        let report = self.cache.remove_many(keys).await?;
        info!(
            removed = report.removed.len(),
            deferred = report.deferred.len(),
            in_use = report.in_use.len(),
            missing = report.missing.len(),
            "Evicted cache entries"
        );
        Ok(report)
    }

    /// Evict every cache entry.
    pub async fn remove_all(&self) -> Result<EvictionReport, DownloadError> {
        Ok(self.cache.remove_all().await?)
    }

    /// Bytes stored for `key`, whether complete or still downloading
    pub fn bytes_cached(&self, key: &ResourceKey) -> u64 {
        if let Some(download) = self.shared.in_flight.lock().get(key) {
            return download.entry.written();
        }
        self.cache.size_cached(key)
    }

    /// Current status of `key`, or its last outcome if the entry was discarded
    pub fn state(&self, key: &ResourceKey) -> Option<DownloadStatus> {
        if let Some(download) = self.shared.in_flight.lock().get(key) {
            return Some(download.entry.status());
        }
        self.cache
            .state(key)
            .or_else(|| self.shared.outcomes.get(key))
    }

    /// Number of downloads with an active producer
    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Followers attached to the in-flight download of `key`
    pub fn follower_count(&self, key: &ResourceKey) -> usize {
        self.shared
            .in_flight
            .lock()
            .get(key)
            .map(|d| d.followers.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("cache", &self.cache)
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}
