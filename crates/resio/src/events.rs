//! # Status events
//!
//! Lifecycle transitions are fanned out to listeners through unbounded
//! per-listener channels so that publishing never waits on a consumer.
//! Events for one key are always published from inside the entry's state
//! update, which fixes their order.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::key::ResourceKey;
use crate::status::DownloadStatus;

/// A single lifecycle transition of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub key: ResourceKey,
    pub status: DownloadStatus,
    /// Human readable context (error text on RETRYING/FAILED, ...)
    pub detail: Option<String>,
    /// Bytes in the cache entry at the time of the transition
    pub bytes_so_far: u64,
    /// Milliseconds since the UNIX epoch
    pub timestamp_ms: u64,
}

impl StatusEvent {
    pub fn new(
        key: ResourceKey,
        status: DownloadStatus,
        detail: Option<String>,
        bytes_so_far: u64,
    ) -> Self {
        Self {
            key,
            status,
            detail,
            bytes_so_far,
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

/// Error reported by a sink; logged by the publisher, never propagated.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// External consumer of status events (activity feed, notifications, ...).
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn deliver(&self, event: &StatusEvent) -> Result<(), SinkError>;
}

/// Publishes lifecycle transitions to every registered listener.
#[derive(Default)]
pub struct StatusPublisher {
    listeners: Mutex<Vec<mpsc::UnboundedSender<StatusEvent>>>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    /// Drive `sink` from a dedicated task. Must be called within a tokio runtime.
    pub fn register(&self, sink: Arc<dyn StatusSink>) -> tokio::task::JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.deliver(&event).await {
                    warn!(
                        key = %event.key,
                        status = %event.status,
                        error = %e,
                        "Failed to deliver status event"
                    );
                }
            }
        })
    }

    pub fn publish(
        &self,
        key: &ResourceKey,
        status: DownloadStatus,
        detail: Option<String>,
        bytes_so_far: u64,
    ) {
        let event = StatusEvent::new(key.clone(), status, detail, bytes_so_far);

        match &event.detail {
            Some(detail) => info!(key = %event.key, status = %event.status, bytes = bytes_so_far, detail = %detail, "Download status changed"),
            None => info!(key = %event.key, status = %event.status, bytes = bytes_so_far, "Download status changed"),
        }

        let mut listeners = self.listeners.lock();
        listeners.retain(|tx| match tx.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!("Dropping closed status listener");
                false
            }
        });
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl std::fmt::Debug for StatusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPublisher")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
