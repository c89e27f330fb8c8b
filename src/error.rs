//! Error types for visitq.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{EntryState, VisitId, VisitStatus};

/// How the sync queue should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    /// Network, timeout, unavailable backend. Retried with backoff.
    Transient,
    /// Backend rejected the write. Retried a bounded number of times.
    Permanent,
    /// Retrying the same request cannot succeed; the caller must re-decide.
    NotRetryable,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("visit not found: {0}")]
    VisitNotFound(VisitId),

    #[error("no linked user for care recipient {0}")]
    LinkedUserNotFound(String),

    #[error("invalid visit transition: {from} -> {to}")]
    InvalidTransition { from: VisitStatus, to: VisitStatus },

    #[error("mutation for visit {visit_id} superseded by remote status {status}")]
    ConflictDiscarded {
        visit_id: VisitId,
        status: VisitStatus,
    },

    #[error("commit failed ({retry:?}): {message}")]
    CommitFailed { retry: RetryClass, message: String },

    #[error("check-in location is {distance_m:.1} m from the visit site (limit {radius_m:.1} m)")]
    OutsideGeofence { distance_m: f64, radius_m: f64 },

    #[error("invalid proof: {0}")]
    InvalidProof(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("queue entry not found: {0}")]
    QueueEntryNotFound(u64),

    #[error("invalid queue entry transition: {from} -> {to}")]
    InvalidEntryTransition { from: EntryState, to: EntryState },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::CommitFailed {
            retry: RetryClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::CommitFailed {
            retry: RetryClass::Permanent,
            message: message.into(),
        }
    }

    /// Build a commit failure from an HTTP status returned by the backend.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self::CommitFailed {
            retry: classify_http_status(status),
            message: format!("backend returned {status}: {}", message.into()),
        }
    }

    /// Classify for the sync queue's retry policy.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::CommitFailed { retry, .. } => *retry,
            Self::Http(e) if e.is_decode() => RetryClass::Permanent,
            Self::Http(_) => RetryClass::Transient,
            _ => RetryClass::NotRetryable,
        }
    }

    /// The referenced visit or party no longer exists remotely.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::VisitNotFound(_) | Self::LinkedUserNotFound(_))
    }
}

/// Classify an HTTP status into retry behavior.
pub fn classify_http_status(status: u16) -> RetryClass {
    match status {
        408 | 409 | 423 | 425 | 429 => RetryClass::Transient,
        500..=599 => RetryClass::Transient,
        _ => RetryClass::Permanent,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
