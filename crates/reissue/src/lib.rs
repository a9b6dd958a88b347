//! Live service account reissue for running transfers
//!
//! gclone-style transfer tools can call back mid-transfer when the provider
//! rejects their service account, instead of exiting and being relaunched.
//! Each transfer operation starts its own `ReissueServer` on a local port and
//! passes the URL to the tool; every server leases from the one shared
//! `CredentialPool`.
//!
//! Request flow:
//! 1. Tool POSTs `{"old": <rejected file>, "remote": <remote>}`
//! 2. First report of `old` → ban it, lease a replacement, cache the answer
//! 3. Repeat reports of `old` within the cache window → same replacement,
//!    up to the hit cap
//! 4. Hit cap exceeded or window expired → treated as a new report

pub mod cache;
pub mod error;
pub mod port;
pub mod server;

pub use cache::{DEFAULT_CACHE_TTL, DEFAULT_MAX_HITS, ReissueCache};
pub use error::{Error, Result};
pub use server::{DEFAULT_BAN_HOURS, ReissueServer, ReissueSettings, ReissueState, build_router, should_start};
