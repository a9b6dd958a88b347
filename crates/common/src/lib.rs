//! Shared types for the service account broker
//!
//! Holds the settings error type used by the binary and the remote-path
//! helpers every crate agrees on (`remote:path` → `remote`).

mod error;
pub mod remote;

pub use error::{Error, Result};
pub use remote::{remote_name, sequence_hint};
