//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The ban store path may come from SA_BROKER_BAN_STORE so one config file
//! can serve hosts with different state directories.

use reissue::{DEFAULT_BAN_HOURS, DEFAULT_CACHE_TTL, DEFAULT_MAX_HITS, ReissueSettings};
use sa_pool::{DEFAULT_ENV_PREFIX, PoolSettings};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var overriding `store.path`.
pub const BAN_STORE_ENV: &str = "SA_BROKER_BAN_STORE";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Remote name → service account folders, searched in order
    #[serde(default)]
    pub remotes: HashMap<String, Vec<PathBuf>>,
    #[serde(default)]
    pub reissue: ReissueConfig,
    #[serde(default)]
    pub sweep: Option<SweepConfig>,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

/// Ban store location
#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Credential pool settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_lease_cooldown")]
    pub lease_cooldown_secs: u64,
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
}

/// Reissue callback server settings
#[derive(Debug, Deserialize)]
pub struct ReissueConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_ban_hours")]
    pub ban_hours: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_max_hits")]
    pub max_hits: u32,
}

/// Background purge of expired bans
#[derive(Debug, Deserialize)]
pub struct SweepConfig {
    pub interval_secs: u64,
}

/// Prometheus scrape endpoint for `serve`
#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    pub listen_addr: SocketAddr,
}

fn default_parallelism() -> usize {
    1
}

fn default_lease_cooldown() -> u64 {
    24 * 60 * 60
}

fn default_env_prefix() -> String {
    DEFAULT_ENV_PREFIX.to_string()
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_ban_hours() -> u64 {
    DEFAULT_BAN_HOURS
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL.as_secs()
}

fn default_max_hits() -> u32 {
    DEFAULT_MAX_HITS
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            lease_cooldown_secs: default_lease_cooldown(),
            env_prefix: default_env_prefix(),
        }
    }
}

impl Default for ReissueConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ban_hours: default_ban_hours(),
            cache_ttl_secs: default_cache_ttl(),
            max_hits: default_max_hits(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| common::Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents).map_err(|source| common::Error::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Ok(p) = std::env::var(BAN_STORE_ENV) {
            config.store.path = Some(PathBuf::from(p));
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.store.path.is_none() {
            return Err(common::Error::Invalid(format!(
                "store.path must be set (or {BAN_STORE_ENV})"
            )));
        }

        if self.pool.parallelism == 0 {
            return Err(common::Error::Invalid(
                "parallelism must be greater than 0".into(),
            ));
        }

        if self.pool.lease_cooldown_secs == 0 {
            return Err(common::Error::Invalid(
                "lease_cooldown_secs must be greater than 0".into(),
            ));
        }

        if self.pool.env_prefix.is_empty() {
            return Err(common::Error::Invalid("env_prefix must not be empty".into()));
        }

        for (remote, folders) in &self.remotes {
            if remote.is_empty() || remote.contains(':') {
                return Err(common::Error::Invalid(format!(
                    "remote name must be non-empty and contain no ':', got: {remote:?}"
                )));
            }
            if folders.is_empty() {
                return Err(common::Error::Invalid(format!(
                    "remote {remote} has no service account folders"
                )));
            }
        }

        // The reissue protocol is unauthenticated
        if !self.reissue.host.is_loopback() {
            return Err(common::Error::Invalid(format!(
                "reissue host must be a loopback address, got {}",
                self.reissue.host
            )));
        }

        if self.reissue.ban_hours == 0 {
            return Err(common::Error::Invalid(
                "ban_hours must be greater than 0".into(),
            ));
        }

        if self.reissue.cache_ttl_secs == 0 {
            return Err(common::Error::Invalid(
                "cache_ttl_secs must be greater than 0".into(),
            ));
        }

        if let Some(sweep) = &self.sweep
            && sweep.interval_secs == 0
        {
            return Err(common::Error::Invalid(
                "sweep interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Ban store file. Always set after a successful `load`.
    pub fn store_path(&self) -> common::Result<&Path> {
        self.store
            .path
            .as_deref()
            .ok_or_else(|| common::Error::Invalid("store.path is not set".into()))
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            parallelism: self.pool.parallelism,
            lease_cooldown: Duration::from_secs(self.pool.lease_cooldown_secs),
        }
    }

    pub fn reissue_settings(&self) -> ReissueSettings {
        ReissueSettings {
            host: self.reissue.host,
            ban_hours: self.reissue.ban_hours,
            cache_ttl: Duration::from_secs(self.reissue.cache_ttl_secs),
            max_hits: self.reissue.max_hits,
        }
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep
            .as_ref()
            .map(|s| Duration::from_secs(s.interval_secs))
    }

    /// Address for the Prometheus exporter, if configured.
    pub fn metrics_listen_addr(&self) -> Option<SocketAddr> {
        self.metrics.as_ref().map(|m| m.listen_addr)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("sa-broker.toml")
    }
}
