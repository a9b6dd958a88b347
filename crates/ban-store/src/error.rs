//! Error types for ban store operations

/// Errors from ban store persistence.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("ban store parse error: {0}")]
    Parse(String),
}

/// Result alias for ban store operations.
pub type Result<T> = std::result::Result<T, Error>;
