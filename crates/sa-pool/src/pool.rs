//! Credential leasing and ban bookkeeping
//!
//! The pool hands out at most one credential per remote per call. A candidate
//! is skipped when it is banned (the provider rejected it; durable, long TTL)
//! or temp-leased (a sibling attempt may still be using it; in memory,
//! shorter TTL). Keeping the two apart means a credential that is merely busy
//! is never banned, and a banned one is never retried before its ban lapses.
//!
//! The whole scan runs under one pool-wide mutex, so two concurrent leases can
//! never receive the same credential for the same remote. Temp-lease expiry is
//! lazy: an expired lease is dropped when the scan reaches it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ban_store::{BanEntry, BanStore};
use chrono::{DateTime, Utc};
use rand::RngExt;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::catalog::{Catalog, Credential, RemoteCredentials};
use crate::error::{Error, Result};

/// Default temp-lease cool-down after a lease with parallelism > 1.
pub const DEFAULT_LEASE_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of transfer attempts that may run at once. Above 1, issued
    /// credentials are temp-leased so siblings don't receive them.
    pub parallelism: usize,
    /// How long a temp-lease holds unless released earlier.
    pub lease_cooldown: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            parallelism: 1,
            lease_cooldown: DEFAULT_LEASE_COOLDOWN,
        }
    }
}

/// A credential leased to one transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    pub remote_name: String,
    pub env_var: String,
    pub path: String,
}

impl IssuedCredential {
    /// `(name, value)` pair to export into the transfer tool's environment.
    pub fn env_pair(&self) -> (String, String) {
        (self.env_var.clone(), self.path.clone())
    }
}

/// Service account pool shared by every transfer attempt and reissue server
/// in the process.
pub struct CredentialPool {
    catalog: Catalog,
    bans: Arc<BanStore>,
    settings: PoolSettings,
    /// Temp-leases (credential path → expiry). Held for the whole lease scan.
    leases: Mutex<HashMap<String, Instant>>,
}

impl CredentialPool {
    /// Create a pool over a loaded catalog.
    pub fn new(catalog: Catalog, bans: Arc<BanStore>, settings: PoolSettings) -> Self {
        info!(
            credentials = catalog.count(),
            parallelism = settings.parallelism,
            "service account pool initialized"
        );
        Self {
            catalog,
            bans,
            settings,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Lease one credential for each distinct remote in `remote_paths`.
    ///
    /// Remotes without catalogued credentials are skipped. If any remote has
    /// no usable credential the whole call fails with `Exhausted` and nothing
    /// is issued.
    pub async fn lease<S: AsRef<str>>(&self, remote_paths: &[S]) -> Result<Vec<IssuedCredential>> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        let mut issued = Vec::new();
        let mut seen = HashSet::new();

        for remote_path in remote_paths {
            let remote_path = remote_path.as_ref();
            let remote_name = common::remote_name(remote_path);
            if remote_name.is_empty() {
                trace!(remote_path, "no remote determined, not providing service account");
                continue;
            }

            let Some(remote) = self
                .catalog
                .get(remote_name)
                .filter(|r| !r.credentials.is_empty())
            else {
                trace!(remote = remote_name, "no service accounts loaded, not providing service account");
                continue;
            };

            if !seen.insert(remote_name.to_lowercase()) {
                continue;
            }

            match self.first_available(remote, &mut leases, now).await {
                Some(credential) => issued.push(IssuedCredential {
                    remote_name: remote.remote_name.clone(),
                    env_var: remote.env_var.clone(),
                    path: credential.path.clone(),
                }),
                None => {
                    warn!(remote = remote_name, "no more service accounts available");
                    metrics::counter!("sa_pool_exhausted_total", "remote" => remote_name.to_string())
                        .increment(1);
                    return Err(Error::Exhausted(remote_name.to_string()));
                }
            }
        }

        if self.settings.parallelism > 1 {
            let until = now + self.settings.lease_cooldown;
            for credential in &issued {
                leases.insert(credential.path.clone(), until);
            }
        }

        for credential in &issued {
            debug!(remote = %credential.remote_name, path = %credential.path, "issued service account");
            metrics::counter!("sa_pool_leases_total", "remote" => credential.remote_name.clone())
                .increment(1);
        }

        Ok(issued)
    }

    /// Drop the temp-leases for `issued` before their cool-down ends.
    pub async fn release(&self, issued: &[IssuedCredential]) {
        let mut leases = self.leases.lock().await;
        for credential in issued {
            if leases.remove(&credential.path).is_some() {
                debug!(path = %credential.path, "released service account");
            }
        }
    }

    /// Number of distinct catalogued credential files.
    pub fn count(&self) -> usize {
        self.catalog.count()
    }

    /// Ban a remote (`remote:path` is normalized to `remote`).
    pub async fn ban_remote(&self, remote_path: &str, hours: u64) -> Result<DateTime<Utc>> {
        let remote_name = common::remote_name(remote_path);
        let expires_at = self.bans.ban(remote_name, hours).await?;
        metrics::counter!("sa_pool_bans_total", "kind" => "remote").increment(1);
        Ok(expires_at)
    }

    /// Ban a credential file path.
    pub async fn ban_credential(&self, path: &str, hours: u64) -> Result<DateTime<Utc>> {
        let expires_at = self.bans.ban(path, hours).await?;
        metrics::counter!("sa_pool_bans_total", "kind" => "credential").increment(1);
        Ok(expires_at)
    }

    /// Lift a ban on a remote name or credential path.
    pub async fn unban(&self, key: &str) -> Result<bool> {
        Ok(self.bans.unban(key).await?)
    }

    /// First banned remote among `remote_paths`, if any.
    pub async fn any_remote_banned<S: AsRef<str>>(&self, remote_paths: &[S]) -> Option<BanEntry> {
        self.bans.any_banned(remote_paths).await
    }

    /// A random catalogued credential for the remote, ignoring bans and leases.
    ///
    /// For operations that need *some* credential to authenticate but won't
    /// consume upload quota.
    pub fn random(&self, remote_path: &str) -> Option<String> {
        let remote_name = common::remote_name(remote_path);
        let remote = self.catalog.get(remote_name)?;
        if remote.credentials.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..remote.credentials.len());
        Some(remote.credentials[idx].path.clone())
    }

    /// The loaded catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The shared ban store.
    pub fn bans(&self) -> &Arc<BanStore> {
        &self.bans
    }

    /// First credential of `remote` that is neither banned nor temp-leased.
    async fn first_available<'a>(
        &self,
        remote: &'a RemoteCredentials,
        leases: &mut HashMap<String, Instant>,
        now: Instant,
    ) -> Option<&'a Credential> {
        for credential in &remote.credentials {
            if self.bans.is_banned(&credential.path).await.is_some() {
                continue;
            }

            match leases.get(&credential.path) {
                Some(until) if *until > now => continue,
                Some(_) => {
                    trace!(path = %credential.path, "temp-lease expired");
                    leases.remove(&credential.path);
                }
                None => {}
            }

            return Some(credential);
        }
        None
    }
}
