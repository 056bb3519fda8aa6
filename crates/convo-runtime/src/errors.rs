//! Runtime error types.

use std::fmt;

use serde::{Deserialize, Serialize};

use convo_core::UsageError;
use convo_store::StoreError;

/// Why a blocking wait ended without an answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller's cancellation token fired, or the user canceled.
    Canceled,
    /// The deadline passed first.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => write!(f, "canceled"),
            Self::DeadlineExceeded => write!(f, "deadline_exceeded"),
        }
    }
}

/// Coarse error taxonomy surfaced to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Validation,
    Cancellation,
    Storage,
}

/// Errors from runtime services.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Ledger, payload, or object store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An answer never satisfied the requested schema.
    #[error("Validation failed after {attempts} attempt(s): {message}")]
    Validation {
        /// Last validation message.
        message: String,
        /// Attempts made.
        attempts: u32,
    },

    /// A blocking wait was canceled or timed out.
    #[error("Cancelled: {reason}")]
    Cancelled {
        /// Token/user cancel or deadline.
        reason: CancelReason,
    },

    /// The requested schema is not a valid JSON Schema.
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// A match pattern failed to compile.
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Operation not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The external summarizer failed.
    #[error("Summarizer error: {0}")]
    Summarizer(String),

    /// A usage report was rejected.
    #[error("Invalid usage: {0}")]
    InvalidUsage(#[from] UsageError),
}

impl RuntimeError {
    pub fn cancelled(reason: CancelReason) -> Self {
        Self::Cancelled { reason }
    }

    /// Map onto the caller-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => match e {
                StoreError::NotFound { .. } => ErrorKind::NotFound,
                StoreError::InvalidState(_) | StoreError::Conflict(_) => ErrorKind::InvalidState,
                StoreError::Config(_) => ErrorKind::Validation,
                _ => ErrorKind::Storage,
            },
            Self::Validation { .. }
            | Self::InvalidSchema(_)
            | Self::InvalidPattern(_)
            | Self::InvalidUsage(_) => ErrorKind::Validation,
            Self::Cancelled { .. } => ErrorKind::Cancellation,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Summarizer(_) => ErrorKind::Storage,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Summarizer(_) => true,
            _ => false,
        }
    }

    /// Category string for logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Validation { .. } => "validation",
            Self::Cancelled { .. } => "cancelled",
            Self::InvalidSchema(_) => "invalid_schema",
            Self::InvalidPattern(_) => "invalid_pattern",
            Self::InvalidState(_) => "invalid_state",
            Self::Summarizer(_) => "summarizer",
            Self::InvalidUsage(_) => "invalid_usage",
        }
    }
}

/// Convenience type alias for runtime results.
pub type Result<T> = std::result::Result<T, RuntimeError>;
