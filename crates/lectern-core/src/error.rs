//! Error types for lectern-core

use thiserror::Error;

/// Result type alias using lectern-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in lectern-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record, operation or conflict not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A local store invariant was violated
    #[error("Local store corruption: {0}")]
    Corruption(String),
}
