//! Error types for the runner core library.

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for runner operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (bad file, failed pre-flight validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),
}
