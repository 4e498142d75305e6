use std::time::Duration;

use thiserror::Error;

/// Errors raised by a `StoreClient`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),
}

/// Errors surfaced by the lock engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock on {key}")]
    AcquireTimeout { key: String, waited: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Lease on {key} was lost; mutual exclusion no longer holds")]
    LockLost { key: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl LockError {
    /// Whether the caller may reasonably retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::AcquireTimeout { .. } | LockError::Store(_))
    }
}
