//! Error types for quilt-db-constraint

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, ConstraintError>;

/// Constraint error type
#[derive(Error, Debug)]
pub enum ConstraintError {
    /// The proposed update violates the invariant; no state change happens
    #[error("Constraint failed: {0}")]
    Failed(String),

    /// Malformed constraint configuration
    #[error("Constraint config error: {0}")]
    Config(String),

    /// Underlying read error
    #[error(transparent)]
    Core(#[from] quilt_db_core::Error),
}

impl ConstraintError {
    /// Create a failed-check error
    pub fn failed(msg: impl Into<String>) -> Self {
        ConstraintError::Failed(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        ConstraintError::Config(msg.into())
    }
}
