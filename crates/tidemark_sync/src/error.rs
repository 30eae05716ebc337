//! Error types for the sync engine.

use thiserror::Error;
use tidemark_store::StoreError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network failure talking to the remote gateway.
    #[error("network failure: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Authentication failure. Fatal to the sync session; never
    /// retried by the engine.
    #[error("authentication failure: {0}")]
    Auth(String),

    /// Storage failure in the local store. Fatal to the current
    /// cycle; the cycle aborts and the next trigger retries the same
    /// work.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    /// Gateway response did not match the request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Cycle cancelled at a batch boundary.
    #[error("sync cancelled")]
    Cancelled,

    /// Connectivity lost; the cycle aborted at a batch boundary.
    #[error("offline")]
    Offline,

    /// Engine is stopped (identity revoked or shut down).
    #[error("engine stopped")]
    Stopped,

    /// A cycle is already in progress; the trigger was recorded.
    #[error("sync cycle already in progress")]
    CycleInProgress,
}

impl SyncError {
    /// Creates a retryable network failure.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network failure.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the next trigger may succeed without outside
    /// intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { retryable, .. } => *retryable,
            SyncError::Storage(_) | SyncError::Offline => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::network_retryable("connection reset").is_retryable());
        assert!(!SyncError::network_fatal("bad certificate").is_retryable());
        assert!(SyncError::Offline.is_retryable());
        assert!(!SyncError::Auth("token expired".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::Offline.to_string(), "offline");
        assert!(SyncError::network_retryable("timed out")
            .to_string()
            .contains("timed out"));
    }
}
