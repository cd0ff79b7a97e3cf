//! Error types for quilt-db-remotes

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, RemotesError>;

/// Remoting error type
#[derive(Error, Debug)]
pub enum RemotesError {
    /// No presence peers are visible; retry after a presence change
    #[error("No peers visible on the control topic")]
    NoneVisible,

    /// A request exceeded its deadline; retryable with a different peer
    #[error("Send timed out after {0} ms")]
    SendTimeout(u64),

    /// A peer answered a request with an error
    #[error("Peer error: {0}")]
    Peer(String),

    /// A message failed to decode
    #[error("Bad message: {0}")]
    BadMessage(String),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation attempted after close
    #[error("Clone closed")]
    Closed,

    /// Underlying core error
    #[error(transparent)]
    Core(#[from] quilt_db_core::Error),
}

impl RemotesError {
    /// Create a bad-message error
    pub fn bad_message(msg: impl Into<String>) -> Self {
        RemotesError::BadMessage(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        RemotesError::Transport(msg.into())
    }

    /// Create a peer error
    pub fn peer(msg: impl Into<String>) -> Self {
        RemotesError::Peer(msg.into())
    }
}
