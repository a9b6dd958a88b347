//! Error types for the reissue server

/// Errors from starting or running a reissue server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed locating free port for the service account server: {0}")]
    PortAllocation(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for reissue server operations.
pub type Result<T> = std::result::Result<T, Error>;
