//! Common error types for the sync engine.

use thiserror::Error;

/// Top-level error type for sync engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Request rejected before anything was persisted.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Delivery attempt against the remote authority failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Delivery attempt did not complete in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Storage layer failed. Fatal for the current cycle.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing or invalid credential.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Credential is valid but lacks the capability.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The scheduler is not running or dropped a request.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// A dispatch cycle for the same scope is already running.
    #[error("Cycle already in progress for scope {0}")]
    CycleInProgress(String),
}

impl Error {
    /// Delivery-level failures that leave the entry eligible for retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_) | Error::Io(_))
    }

    /// Failures that abort a whole dispatch cycle.
    pub fn is_fatal_for_cycle(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
