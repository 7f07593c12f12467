//! # Retriever Capabilities
//!
//! This module defines the traits the download manager fetches through.
//! A retriever only opens byte streams; retries, caching and fan-out to
//! followers are the manager's job.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::FetchError;
use crate::key::ResourceDescriptor;

/// A type alias for a boxed byte stream produced by a retriever
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

/// Base retrieval capability
///
/// Opens the resource named by a descriptor from its start.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Open a byte stream over the whole resource
    async fn open(&self, descriptor: &ResourceDescriptor) -> Result<ByteStream, FetchError>;

    /// Ranged capability, if this retriever has one
    fn resumable(&self) -> Option<&dyn ResumableRetriever> {
        None
    }

    /// Short name used in logs
    fn name(&self) -> &str {
        "retriever"
    }
}

/// Optional resumable capability
///
/// Enables opening a resource from a specific byte offset.
#[async_trait]
pub trait ResumableRetriever: Send + Sync {
    /// Open a byte stream starting at `offset`
    async fn open_at(
        &self,
        descriptor: &ResourceDescriptor,
        offset: u64,
    ) -> Result<ByteStream, FetchError>;
}

/// Open `descriptor` at `offset`, falling back to a full fetch when the
/// retriever cannot resume. Returns the stream and the offset it starts at.
pub async fn open_from(
    retriever: &dyn Retriever,
    descriptor: &ResourceDescriptor,
    offset: u64,
) -> Result<(ByteStream, u64), FetchError> {
    if offset > 0 {
        if let Some(resumable) = retriever.resumable() {
            let stream = resumable.open_at(descriptor, offset).await?;
            return Ok((stream, offset));
        }
    }
    Ok((retriever.open(descriptor).await?, 0))
}
