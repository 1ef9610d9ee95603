//! Pipeline error types and write-failure classification
//!
//! Log-write failures are categorized to drive the retry policy:
//! - **Transient**: throttled, busy or unreachable log service; retry with jittered backoff
//! - **Permanent**: malformed or oversized payload; drop without retry

use serde::Serialize;
use strum::{AsRefStr, Display};
use thiserror::Error;

/// Category of a write failure for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary failure - retry with exponential backoff
    Transient,
    /// Unrecoverable for this record - drop immediately
    Permanent,
}

impl ErrorCategory {
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

/// Failure returned by a [`LogWriter`](crate::LogWriter).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// Throttled, busy, timed out or disconnected.
    #[error("transient write failure: {0}")]
    Transient(String),

    /// The log service will never accept this record.
    #[error("permanent write failure: {0}")]
    Permanent(String),
}

impl WriteError {
    pub fn transient(reason: impl Into<String>) -> Self {
        WriteError::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        WriteError::Permanent(reason.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            WriteError::Transient(_) => ErrorCategory::Transient,
            WriteError::Permanent(_) => ErrorCategory::Permanent,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            WriteError::Transient(reason) | WriteError::Permanent(reason) => reason,
        }
    }
}

/// Pipeline construction and lifecycle errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid settings; raised before anything starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// `start` called twice
    #[error("Pipeline already started")]
    AlreadyStarted,

    /// `start` called after `shutdown`
    #[error("Pipeline has been shut down")]
    Stopped,
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Config(message.into())
    }
}
