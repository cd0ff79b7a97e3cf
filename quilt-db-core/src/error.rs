//! Error types for quilt-db-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// Clock invariants violated (shape mismatch after validation)
    #[error("Clock error: {0}")]
    Clock(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Another process owns the data directory
    #[error("Storage locked: {0}")]
    StorageLocked(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Operation attempted after close
    #[error("Closed")]
    Closed,

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a clock error
    pub fn clock(msg: impl Into<String>) -> Self {
        Error::Clock(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Create a storage-locked error
    pub fn storage_locked(msg: impl Into<String>) -> Self {
        Error::StorageLocked(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an I/O error
    pub fn io(msg: impl Into<String>) -> Self {
        Error::Io(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
