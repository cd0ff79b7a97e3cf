//! Error types for quilt-db-clone

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, CloneError>;

/// Clone engine error type
#[derive(Error, Debug)]
pub enum CloneError {
    /// Malformed clone configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Bootstrap could not complete; the clone has closed
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    /// Malformed JSON subject on the write surface
    #[error("Bad subject: {0}")]
    BadSubject(String),

    /// Operation attempted after close
    #[error("Clone closed")]
    Closed,

    /// Dataset error (constraint failures surface through here)
    #[error(transparent)]
    Dataset(#[from] quilt_db_dataset::DatasetError),

    /// Remoting error
    #[error(transparent)]
    Remotes(#[from] quilt_db_remotes::RemotesError),

    /// Core error
    #[error(transparent)]
    Core(#[from] quilt_db_core::Error),
}

impl CloneError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        CloneError::Config(msg.into())
    }

    /// Create a bootstrap error
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        CloneError::Bootstrap(msg.into())
    }

    /// Create a bad-subject error
    pub fn bad_subject(msg: impl Into<String>) -> Self {
        CloneError::BadSubject(msg.into())
    }

    /// True when a local write was vetoed by a constraint
    pub fn is_constraint_failure(&self) -> bool {
        matches!(self, CloneError::Dataset(e) if e.is_constraint_failure())
    }
}
