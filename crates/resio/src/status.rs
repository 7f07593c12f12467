//! # Download lifecycle
//!
//! `STARTED -> IN_PROGRESS -> {RETRYING -> IN_PROGRESS}* -> COMPLETE | FAILED | CANCELLED`
//!
//! The transition table lives in [`DownloadStatus::can_transition_to`]; every
//! status change in the crate goes through [`DownloadStatus::transition`].

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    /// Entry created, no bytes produced yet
    Started,
    /// Bytes flowing from the retriever into the cache
    InProgress,
    /// A transient failure occurred and another attempt is pending
    Retrying,
    /// Every follower detached before completion, or an operator cancelled
    Cancelled,
    /// Retries exhausted or a terminal error occurred
    Failed,
    /// All bytes written and confirmed
    Complete,
}

/// Rejected status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: DownloadStatus,
    pub to: DownloadStatus,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Complete)
    }

    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;

        match (self, next) {
            (Started, InProgress) | (Started, Retrying) => true,
            (InProgress, Retrying) | (InProgress, Complete) => true,
            (Retrying, InProgress) | (Retrying, Retrying) => true,
            (Started | InProgress | Retrying, Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn transition(self, next: DownloadStatus) -> Result<DownloadStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Retrying => "RETRYING",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
            Self::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
