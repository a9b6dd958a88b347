//! Persistent ban cache for quota-limited remotes and service accounts
//!
//! A ban maps a key (bare remote name or absolute credential file path) to an
//! absolute UTC expiry. The store is a JSON file rewritten atomically on every
//! change, so bans survive the scheduled, short-lived CLI runs that produce them.
//!
//! Ban lifecycle:
//! 1. Transfer reports quota exhaustion → `BanStore::ban` with a duration
//! 2. Every lease attempt checks `BanStore::is_banned`
//! 3. A check that finds an expired ban deletes it (lazy expiry)
//! 4. Optional `spawn_sweep_task` purges expired bans periodically

pub mod error;
pub mod store;
pub mod sweep;

pub use error::{Error, Result};
pub use store::{BanEntry, BanStore};
pub use sweep::spawn_sweep_task;
