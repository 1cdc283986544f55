//! Error types for store operations.

use thiserror::Error;

/// Errors that can occur in the data-share store.
#[derive(Debug, Error)]
pub enum Error {
    /// Key was empty or otherwise unusable.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Database connection or operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The durable backend has no open connection.
    #[error("Backend is closed")]
    Closed,

    /// Stored data could not be interpreted.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
