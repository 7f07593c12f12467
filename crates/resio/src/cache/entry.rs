//! # Cache Entries
//!
//! One entry is shared between a single [`CacheWriter`] and any number of
//! [`CacheReader`]s. The writer appends into the provider blob and then
//! advances the published length through a `watch` channel; readers only ever
//! read below the length they observed, so what they see is always a prefix of
//! the final content.
//!
//! A restart truncates the blob under the entry's reset gate and bumps the
//! generation. Readers hold the gate for reading while they copy bytes out.
//! A reader that already handed out bytes of an older generation fails with
//! [`DownloadError::Restarted`]; a reader still at offset zero moves on to the
//! new generation.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, warn};

use crate::cache::providers::provider::{BlobReader, BlobWriter, CacheProvider};
use crate::cache::types::{BlobId, CacheResult, EntryMetadata};
use crate::error::{CacheError, DownloadError, FetchError};
use crate::events::StatusPublisher;
use crate::key::ResourceKey;
use crate::status::{DownloadStatus, InvalidTransition};

/// Live entries by key.
pub(crate) type EntryIndex = Mutex<HashMap<ResourceKey, Arc<EntryShared>>>;

/// State broadcast to readers on every write and transition.
#[derive(Debug, Clone)]
pub(crate) struct EntrySnapshot {
    pub status: DownloadStatus,
    /// Bytes readable from the blob
    pub written: u64,
    /// Bumped on every restart
    pub generation: u64,
    /// Last error, set when the entry fails
    pub error: Option<Arc<FetchError>>,
}

/// Collaborators shared by every entry of one cache.
pub(crate) struct EntryContext {
    pub provider: Arc<dyn CacheProvider>,
    pub publisher: Arc<StatusPublisher>,
    pub index: Weak<EntryIndex>,
    pub max_entry_size: Option<u64>,
}

#[derive(Debug, Default)]
struct Residency {
    holders: usize,
    doomed: bool,
    purged: bool,
}

impl Residency {
    /// Claim the purge if nothing holds the entry any more.
    fn claim_purge(&mut self) -> bool {
        if self.doomed && self.holders == 0 && !self.purged {
            self.purged = true;
            return true;
        }
        false
    }
}

pub(crate) struct EntryShared {
    base: EntryMetadata,
    state: watch::Sender<EntrySnapshot>,
    residency: Mutex<Residency>,
    reset_gate: RwLock<()>,
    ctx: Arc<EntryContext>,
}

impl EntryShared {
    /// A fresh entry in STARTED. Does not publish.
    pub(crate) fn started(base: EntryMetadata, ctx: Arc<EntryContext>) -> Arc<Self> {
        Self::with_snapshot(
            base,
            EntrySnapshot {
                status: DownloadStatus::Started,
                written: 0,
                generation: 0,
                error: None,
            },
            ctx,
        )
    }

    /// An entry loaded back from storage.
    pub(crate) fn rehydrated(base: EntryMetadata, ctx: Arc<EntryContext>) -> Arc<Self> {
        let written = base.bytes_written;
        Self::with_snapshot(
            base,
            EntrySnapshot {
                status: DownloadStatus::Complete,
                written,
                generation: 0,
                error: None,
            },
            ctx,
        )
    }

    fn with_snapshot(
        base: EntryMetadata,
        snapshot: EntrySnapshot,
        ctx: Arc<EntryContext>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(snapshot);
        Arc::new(Self {
            base,
            state,
            residency: Mutex::new(Residency::default()),
            reset_gate: RwLock::new(()),
            ctx,
        })
    }

    pub(crate) fn key(&self) -> &ResourceKey {
        &self.base.key
    }

    pub(crate) fn blob(&self) -> &BlobId {
        &self.base.blob
    }

    pub(crate) fn snapshot(&self) -> EntrySnapshot {
        self.state.borrow().clone()
    }

    pub(crate) fn status(&self) -> DownloadStatus {
        self.state.borrow().status
    }

    pub(crate) fn written(&self) -> u64 {
        self.state.borrow().written
    }

    pub(crate) fn holders(&self) -> usize {
        self.residency.lock().holders
    }

    /// Apply a validated transition and publish it while the state is locked,
    /// so events for one key come out in transition order.
    pub(crate) fn transition(
        &self,
        next: DownloadStatus,
        detail: Option<String>,
        error: Option<Arc<FetchError>>,
    ) -> Result<(), InvalidTransition> {
        let mut result = Ok(());
        self.state.send_if_modified(|snap| match snap.status.transition(next) {
            Ok(status) => {
                snap.status = status;
                if error.is_some() {
                    snap.error = error;
                }
                self.ctx
                    .publisher
                    .publish(&self.base.key, status, detail, snap.written);
                true
            }
            Err(e) => {
                result = Err(e);
                false
            }
        });
        result
    }

    /// Transition to FAILED and discard the entry. False if already terminal.
    pub(crate) fn fail(&self, error: Arc<FetchError>) -> bool {
        let detail = Some(error.to_string());
        match self.transition(DownloadStatus::Failed, detail, Some(error)) {
            Ok(()) => {
                self.detach();
                true
            }
            Err(e) => {
                debug!(key = %self.base.key, error = %e, "Entry already settled, not failing");
                false
            }
        }
    }

    /// Transition to CANCELLED and discard the entry. False if already terminal.
    pub(crate) fn cancel(&self, detail: Option<String>) -> bool {
        match self.transition(DownloadStatus::Cancelled, detail, None) {
            Ok(()) => {
                self.detach();
                true
            }
            Err(e) => {
                debug!(key = %self.base.key, error = %e, "Entry already settled, not cancelling");
                false
            }
        }
    }

    /// Unlink from the cache index (if still linked) and schedule deletion.
    pub(crate) fn detach(&self) {
        if let Some(index) = self.ctx.index.upgrade() {
            let mut index = index.lock();
            let linked = index
                .get(&self.base.key)
                .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), self));
            if linked {
                index.remove(&self.base.key);
            }
        }
        if self.doom() {
            self.purge_in_background();
        }
    }

    /// Register a holder. Fails once the storage is gone.
    fn acquire(&self) -> bool {
        let mut residency = self.residency.lock();
        if residency.purged {
            return false;
        }
        residency.holders += 1;
        true
    }

    fn release(&self) {
        let claimed = {
            let mut residency = self.residency.lock();
            residency.holders = residency.holders.saturating_sub(1);
            residency.claim_purge()
        };
        if claimed {
            self.purge_in_background();
        }
    }

    /// Mark for deletion. True when the caller now owns the purge.
    pub(crate) fn doom(&self) -> bool {
        let mut residency = self.residency.lock();
        residency.doomed = true;
        residency.claim_purge()
    }

    /// Mark for deletion only if nobody holds the entry; on success the caller
    /// owns the purge. Otherwise returns the holder count.
    pub(crate) fn doom_if_idle(&self) -> Result<(), usize> {
        let mut residency = self.residency.lock();
        if residency.holders > 0 {
            return Err(residency.holders);
        }
        residency.doomed = true;
        residency.purged = true;
        Ok(())
    }

    /// Delete the storage now. Only the owner of a claimed purge calls this.
    pub(crate) async fn purge(&self) -> CacheResult<()> {
        self.ctx.provider.remove(&self.base.blob).await
    }

    fn purge_in_background(&self) {
        let provider = self.ctx.provider.clone();
        let blob = self.base.blob.clone();
        let key = self.base.key.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match provider.remove(&blob).await {
                        Ok(()) => debug!(key = %key, blob = %blob, "Purged detached cache entry"),
                        Err(e) => {
                            error!(key = %key, blob = %blob, error = %e, "Failed to purge cache entry")
                        }
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, blob = %blob, "No runtime available, cache entry storage left behind");
            }
        }
    }

    fn metadata(&self, bytes_written: u64, complete: bool) -> EntryMetadata {
        EntryMetadata {
            bytes_written,
            complete,
            ..self.base.clone()
        }
    }

    /// Open a reader positioned at the start. None once the storage is gone.
    pub(crate) fn reader(self: &Arc<Self>) -> Option<CacheReader> {
        if !self.acquire() {
            return None;
        }
        let rx = self.state.subscribe();
        let generation = rx.borrow().generation;
        Some(CacheReader {
            entry: self.clone(),
            rx,
            blob: None,
            position: 0,
            generation,
        })
    }

    /// The single writer of a fresh entry.
    pub(crate) fn writer(self: &Arc<Self>) -> Option<CacheWriter> {
        if !self.acquire() {
            return None;
        }
        Some(CacheWriter {
            entry: self.clone(),
            blob: None,
            finished: false,
        })
    }
}

/// Append side of a cache entry. Dropping an unfinished writer fails the entry.
pub struct CacheWriter {
    entry: Arc<EntryShared>,
    blob: Option<Box<dyn BlobWriter>>,
    finished: bool,
}

impl CacheWriter {
    pub fn key(&self) -> &ResourceKey {
        self.entry.key()
    }

    /// Bytes written so far in the current attempt
    pub fn written(&self) -> u64 {
        self.entry.written()
    }

    pub fn status(&self) -> DownloadStatus {
        self.entry.status()
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.entry.base.declared_size
    }

    pub(crate) fn shared(&self) -> &Arc<EntryShared> {
        &self.entry
    }

    async fn blob(&mut self) -> CacheResult<&mut Box<dyn BlobWriter>> {
        if self.blob.is_none() {
            let blob = self.entry.ctx.provider.create(self.entry.blob()).await?;
            // Record the entry as incomplete so a crash mid-fetch is swept on load
            self.entry
                .ctx
                .provider
                .commit(&self.entry.metadata(0, false))
                .await?;
            self.blob = Some(blob);
        }
        match self.blob.as_mut() {
            Some(blob) => Ok(blob),
            None => Err(CacheError::metadata("blob writer unavailable")),
        }
    }

    /// Append a chunk and make it visible to readers.
    pub async fn append(&mut self, data: &[u8]) -> CacheResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let len = data.len() as u64;
        let written = self.entry.written();
        if let Some(declared) = self.entry.base.declared_size {
            if written + len > declared {
                return Err(CacheError::ExceedsDeclaredSize {
                    key: self.entry.key().clone(),
                    declared,
                    received: written + len,
                });
            }
        }
        if let Some(limit) = self.entry.ctx.max_entry_size {
            if written + len > limit {
                return Err(CacheError::EntryTooLarge {
                    key: self.entry.key().clone(),
                    limit,
                });
            }
        }

        self.blob().await?.append(data).await?;
        self.entry.state.send_modify(|snap| snap.written += len);
        Ok(())
    }

    /// Discard everything written so far and begin a new generation.
    pub async fn restart(&mut self) -> CacheResult<()> {
        let Some(blob) = self.blob.as_mut() else {
            return Ok(());
        };

        let _gate = self.entry.reset_gate.write().await;
        blob.truncate().await?;
        self.entry.state.send_modify(|snap| {
            snap.written = 0;
            snap.generation += 1;
        });
        debug!(key = %self.entry.key(), "Restarted cache entry");
        Ok(())
    }

    /// Check the written length against the declared size.
    pub fn verify_length(&self) -> Result<(), FetchError> {
        let received = self.entry.written();
        match self.entry.base.declared_size {
            Some(expected) if received < expected => {
                Err(FetchError::Truncated { expected, received })
            }
            Some(declared) if received > declared => {
                Err(FetchError::LengthMismatch { declared, received })
            }
            _ => Ok(()),
        }
    }

    /// Move to a non-terminal status (IN_PROGRESS, RETRYING).
    pub fn transition(
        &self,
        next: DownloadStatus,
        detail: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.entry.transition(next, detail, None)
    }

    /// Persist the entry as complete and publish COMPLETE.
    pub async fn commit(&mut self) -> Result<(), DownloadError> {
        // Zero-length resources never appended
        self.blob().await?;

        let status = self.entry.status();
        if status.is_terminal() {
            self.finished = true;
            return Err(InvalidTransition {
                from: status,
                to: DownloadStatus::Complete,
            }
            .into());
        }

        let written = self.entry.written();
        self.entry
            .ctx
            .provider
            .commit(&self.entry.metadata(written, true))
            .await?;

        self.finished = true;
        self.entry
            .transition(DownloadStatus::Complete, None, None)
            .map_err(DownloadError::from)
    }

    /// Publish FAILED and discard the entry.
    pub fn fail(&mut self, error: Arc<FetchError>) {
        self.finished = true;
        self.entry.fail(error);
    }

    /// Publish CANCELLED and discard the entry.
    pub fn cancel(&mut self, detail: Option<String>) {
        self.finished = true;
        self.entry.cancel(detail);
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if !self.finished && !self.entry.status().is_terminal() {
            warn!(key = %self.entry.key(), "Cache writer dropped before the entry settled");
            self.entry.fail(Arc::new(FetchError::terminal(
                "writer dropped before completion",
            )));
        }
        self.entry.release();
    }
}

impl std::fmt::Debug for CacheWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWriter")
            .field("key", self.entry.key())
            .field("blob", self.entry.blob())
            .field("written", &self.entry.written())
            .finish()
    }
}

/// Independent cursor over a cache entry, complete or still filling.
pub struct CacheReader {
    entry: Arc<EntryShared>,
    rx: watch::Receiver<EntrySnapshot>,
    blob: Option<Box<dyn BlobReader>>,
    position: u64,
    /// Generation the bytes handed out so far belong to
    generation: u64,
}

impl CacheReader {
    pub fn key(&self) -> &ResourceKey {
        self.entry.key()
    }

    /// Bytes handed out by this reader
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes currently in the entry
    pub fn available(&self) -> u64 {
        self.entry.written()
    }

    pub fn status(&self) -> DownloadStatus {
        self.entry.status()
    }

    pub fn media_type(&self) -> Option<&str> {
        self.entry.base.media_type.as_deref()
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.entry.base.declared_size
    }

    pub(crate) fn shared(&self) -> &Arc<EntryShared> {
        &self.entry
    }

    async fn blob(&mut self) -> CacheResult<&mut Box<dyn BlobReader>> {
        if self.blob.is_none() {
            self.blob = Some(self.entry.ctx.provider.open(self.entry.blob()).await?);
        }
        match self.blob.as_mut() {
            Some(blob) => Ok(blob),
            None => Err(CacheError::metadata("blob reader unavailable")),
        }
    }

    /// Adopt a new generation, unless bytes of the old one were already read.
    fn follow_generation(&mut self, generation: u64) -> Result<(), DownloadError> {
        if self.position > 0 {
            return Err(DownloadError::Restarted {
                key: self.entry.key().clone(),
                delivered: self.position,
            });
        }
        self.generation = generation;
        Ok(())
    }

    /// Latest snapshot, or the error this reader must surface.
    fn observe(&mut self) -> Result<EntrySnapshot, DownloadError> {
        let snap = self.rx.borrow_and_update().clone();
        match snap.status {
            DownloadStatus::Failed => {
                let error = snap
                    .error
                    .unwrap_or_else(|| Arc::new(FetchError::terminal("download failed")));
                return Err(DownloadError::failed(self.entry.key().clone(), error));
            }
            DownloadStatus::Cancelled => return Err(DownloadError::Cancelled),
            _ => {}
        }
        if snap.generation != self.generation {
            self.follow_generation(snap.generation)?;
        }
        Ok(snap)
    }

    /// Wait until the next [`read`](Self::read) would return without blocking.
    pub async fn ready(&mut self) -> Result<(), DownloadError> {
        loop {
            let snap = self.observe()?;
            if self.position < snap.written || snap.status == DownloadStatus::Complete {
                return Ok(());
            }
            if self.rx.changed().await.is_err() {
                return Err(DownloadError::Cancelled);
            }
        }
    }

    /// Read the next bytes. Waits while the entry is filling; returns 0 once
    /// the entry is complete and fully read.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, DownloadError> {
        loop {
            let snap = self.observe()?;

            if buf.is_empty() {
                return Ok(0);
            }

            if self.position < snap.written {
                let entry = self.entry.clone();
                let _gate = entry.reset_gate.read().await;
                // A restart may have happened while waiting for the gate
                let current = entry.snapshot();
                if current.generation != self.generation {
                    continue;
                }
                let written = current.written;
                if self.position < written {
                    let position = self.position;
                    let want = buf.len().min((written - position) as usize);
                    let read = self.blob().await?.read_at(position, &mut buf[..want]).await?;
                    if read == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "cache blob shorter than its published length",
                        )
                        .into());
                    }
                    self.position += read as u64;
                    return Ok(read);
                }
                continue;
            }

            if snap.status == DownloadStatus::Complete {
                return Ok(0);
            }

            if self.rx.changed().await.is_err() {
                return Err(DownloadError::Cancelled);
            }
        }
    }
}

impl Drop for CacheReader {
    fn drop(&mut self) {
        self.entry.release();
    }
}

impl std::fmt::Debug for CacheReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheReader")
            .field("key", self.entry.key())
            .field("position", &self.position)
            .finish()
    }
}
