//! Error types for quilt-db-dataset

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, DatasetError>;

/// Dataset error type
#[derive(Error, Debug)]
pub enum DatasetError {
    /// A received delta fails to decode or references impossible triples.
    /// Fatal for the receiver: it implies protocol divergence.
    #[error("Bad update: {0}")]
    BadUpdate(String),

    /// The local write was rejected by a constraint; no state change
    #[error(transparent)]
    Constraint(#[from] quilt_db_constraint::ConstraintError),

    /// Journal chain inconsistency
    #[error("Journal error: {0}")]
    Journal(String),

    /// Rev-up is impossible from the requested causal point
    #[error("Cannot rev-up from the requested time")]
    CannotRevup,

    /// Underlying core/storage error
    #[error(transparent)]
    Core(#[from] quilt_db_core::Error),
}

impl DatasetError {
    /// Create a bad-update error
    pub fn bad_update(msg: impl Into<String>) -> Self {
        DatasetError::BadUpdate(msg.into())
    }

    /// Create a journal error
    pub fn journal(msg: impl Into<String>) -> Self {
        DatasetError::Journal(msg.into())
    }

    /// True when this error means a local write was vetoed (retryable by
    /// the caller with a different patch)
    pub fn is_constraint_failure(&self) -> bool {
        matches!(
            self,
            DatasetError::Constraint(quilt_db_constraint::ConstraintError::Failed(_))
        )
    }
}
