//! Service account pool for quota-limited remotes
//!
//! Loads the credential files configured for each remote, leases one usable
//! credential per remote to each transfer attempt, and routes bans into the
//! shared `BanStore`. Transfer attempts export the leased file path under the
//! remote's env var so the transfer tool picks it up.
//!
//! Credential lifecycle:
//! 1. `Catalog::load` lists `*.json` files per remote, ordered by file index
//! 2. `CredentialPool::lease` issues the first credential that is neither
//!    banned nor temp-leased to a sibling attempt
//! 3. With parallelism > 1 the issued credential is temp-leased for a cool-down
//! 4. Transfer exits with a quota status → `ban_credential`, lease again, retry
//! 5. Transfer succeeds → `release` drops the temp-lease early
//! 6. Ban expires → the credential is issued again

pub mod catalog;
pub mod env;
pub mod error;
pub mod exit;
pub mod pool;

pub use catalog::{Catalog, Credential, FsLister, PathLister, RemoteCredentials};
pub use env::{DEFAULT_ENV_PREFIX, service_account_env_var};
pub use error::{Error, Result};
pub use exit::{NextStep, TransferOutcome, classify_exit, next_step};
pub use pool::{CredentialPool, IssuedCredential, PoolSettings};
