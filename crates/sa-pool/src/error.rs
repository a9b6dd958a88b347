//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no service account available for remote: {0}")]
    Exhausted(String),

    #[error("ban store error: {0}")]
    Store(#[from] ban_store::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
