//! Settings errors

use std::path::PathBuf;

use thiserror::Error;

/// Why a settings file could not be turned into a usable configuration.
///
/// File errors carry the path they came from; the binary adds no further
/// context of its own.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Parsed, but a value is out of range or two values conflict
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Error {
    /// Settings file the error came from, if any.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Error::Read { path, .. } | Error::Parse { path, .. } => Some(path),
            Error::Invalid(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
