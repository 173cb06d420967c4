//! Error types for sync sessions.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that abort a whole sync session.
///
/// Transient transport failures, version conflicts and per-operation
/// rejections are handled inside the session and reported in its summary;
/// only the conditions below end a session early. Cloneable so the outcome
/// can be handed to every caller that joined the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No valid credential, or the remote store refused it.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Malformed or unexpected response from the remote store.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local database failure.
    #[error("local store error: {0}")]
    Store(String),

    /// The session was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl From<crate::Error> for SyncError {
    fn from(error: crate::Error) -> Self {
        Self::Store(error.to_string())
    }
}
