//! Operator commands over one pool and ban store
//!
//! Output for scripts goes to the supplied writer (stdout in the binary);
//! diagnostics go through `tracing`.

use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ban_store::{BanStore, spawn_sweep_task};
use reissue::{ReissueServer, ReissueSettings, should_start};
use sa_pool::{
    Catalog, CredentialPool, FsLister, IssuedCredential, NextStep, classify_exit, next_step,
    service_account_env_var,
};
use tracing::{info, warn};

use crate::config::Config;

/// What a ban key refers to.
#[derive(Debug, PartialEq, Eq)]
pub enum BanTarget<'a> {
    /// Absolute service account file path
    Credential(&'a str),
    /// Remote name, normalized from `remote:path`
    Remote(&'a str),
}

impl<'a> BanTarget<'a> {
    pub fn parse(key: &'a str) -> Self {
        if Path::new(key).is_absolute() {
            BanTarget::Credential(key)
        } else {
            BanTarget::Remote(common::remote_name(key))
        }
    }

    fn key(&self) -> &'a str {
        match self {
            BanTarget::Credential(k) | BanTarget::Remote(k) => *k,
        }
    }
}

pub struct Broker {
    pool: Arc<CredentialPool>,
    reissue: ReissueSettings,
}

impl Broker {
    /// Open the ban store and load every configured remote's credentials.
    pub async fn open(config: &Config) -> Result<Self> {
        let store_path = config.store_path()?;
        let bans = BanStore::load(store_path.to_path_buf())
            .await
            .with_context(|| format!("failed to open ban store {}", store_path.display()))?;

        let mut catalog = Catalog::new(config.remotes.clone(), config.pool.env_prefix.clone());
        let remotes: Vec<String> = config.remotes.keys().cloned().collect();
        let loaded = catalog.load(&FsLister, &remotes);
        info!(
            remotes = loaded,
            service_accounts = catalog.count(),
            "loaded service accounts"
        );

        let pool = CredentialPool::new(catalog, Arc::new(bans), config.pool_settings());
        Ok(Self::new(Arc::new(pool), config.reissue_settings()))
    }

    pub fn new(pool: Arc<CredentialPool>, reissue: ReissueSettings) -> Self {
        Self { pool, reissue }
    }

    fn bans(&self) -> &Arc<BanStore> {
        self.pool.bans()
    }

    /// Lease service accounts and print `ENV=path` per remote.
    pub async fn lease(&self, remotes: &[String], out: &mut impl Write) -> Result<()> {
        if let Some(ban) = self.pool.any_remote_banned(remotes).await {
            bail!("remote {} is banned until {}", ban.key, ban.expires_at.to_rfc3339());
        }

        let issued = self.pool.lease(remotes).await?;
        for credential in &issued {
            let (name, value) = credential.env_pair();
            writeln!(out, "{name}={value}")?;
        }
        Ok(())
    }

    pub async fn ban(&self, key: &str, hours: Option<u64>, out: &mut impl Write) -> Result<()> {
        let hours = hours.unwrap_or(self.reissue.ban_hours);
        let target = BanTarget::parse(key);
        let expires_at = match target {
            BanTarget::Credential(path) => self.pool.ban_credential(path, hours).await?,
            BanTarget::Remote(remote) => self.pool.ban_remote(remote, hours).await?,
        };
        writeln!(out, "{}\t{}", target.key(), expires_at.to_rfc3339())?;
        Ok(())
    }

    pub async fn unban(&self, key: &str, out: &mut impl Write) -> Result<()> {
        let key = BanTarget::parse(key).key();
        if self.pool.unban(key).await? {
            info!(key, "lifted ban");
            writeln!(out, "unbanned {key}")?;
        } else {
            writeln!(out, "{key} was not banned")?;
        }
        Ok(())
    }

    /// Print live bans as `key<TAB>expiry`.
    pub async fn list_bans(&self, out: &mut impl Write) -> Result<()> {
        for entry in self.bans().entries().await {
            writeln!(out, "{}\t{}", entry.key, entry.expires_at.to_rfc3339())?;
        }
        Ok(())
    }

    pub async fn purge(&self, out: &mut impl Write) -> Result<()> {
        let purged = self.bans().purge_expired().await?;
        writeln!(out, "purged {purged} expired bans")?;
        Ok(())
    }

    /// Print `remote<TAB>total<TAB>available` per configured remote, with the
    /// remote's own ban expiry appended when it is banned.
    pub async fn status(&self, out: &mut impl Write) -> Result<()> {
        let catalog = self.pool.catalog();
        for remote in catalog.configured_remotes() {
            let credentials = catalog
                .get(remote)
                .map(|r| r.credentials.as_slice())
                .unwrap_or_default();

            let mut available = 0;
            for credential in credentials {
                if self.bans().is_banned(&credential.path).await.is_none() {
                    available += 1;
                }
            }

            write!(out, "{remote}\t{}\t{available}", credentials.len())?;
            if let Some(expires_at) = self.bans().is_banned(remote).await {
                write!(out, "\tbanned until {}", expires_at.to_rfc3339())?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    /// Apply a transfer exit status: ban what failed and print the executor's
    /// next step (`done`, `retry` or `abort`).
    pub async fn report(
        &self,
        code: i32,
        remote_path: &str,
        credentials: &[String],
        out: &mut impl Write,
    ) -> Result<()> {
        let remote_name = common::remote_name(remote_path);
        let env_var = self
            .pool
            .catalog()
            .get(remote_name)
            .map(|r| r.env_var.clone())
            .unwrap_or_else(|| {
                service_account_env_var(self.pool.catalog().env_prefix(), remote_name)
            });
        let issued: Vec<IssuedCredential> = credentials
            .iter()
            .map(|path| IssuedCredential {
                remote_name: remote_name.to_string(),
                env_var: env_var.clone(),
                path: path.clone(),
            })
            .collect();

        let outcome = classify_exit(code);
        let step = match next_step(outcome, &issued) {
            NextStep::Done => {
                self.pool.release(&issued).await;
                "done"
            }
            NextStep::BanAndRetry(paths) => {
                for path in &paths {
                    self.pool
                        .ban_credential(path, self.reissue.ban_hours)
                        .await
                        .with_context(|| format!("failed banning service account {path}"))?;
                    warn!(code, path = %path, "transfer failed with retryable exit code, banned service account");
                }
                "retry"
            }
            NextStep::BanRemoteAndAbort => {
                self.pool
                    .ban_remote(remote_name, self.reissue.ban_hours)
                    .await
                    .with_context(|| format!("failed banning remote {remote_name}"))?;
                warn!(code, remote = remote_name, "transfer failed without service accounts, banned remote");
                "abort"
            }
            NextStep::Abort => {
                warn!(code, remote = remote_name, "transfer failed with non-retryable exit code");
                "abort"
            }
        };
        writeln!(out, "{step}")?;
        Ok(())
    }

    /// Run a reissue server for `remotes` until `shutdown` resolves.
    ///
    /// The server URL is printed as soon as it is listening.
    pub async fn serve(
        &self,
        remotes: &[String],
        sweep_interval: Option<Duration>,
        out: &mut impl Write,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        if let Some(ban) = self.pool.any_remote_banned(remotes).await {
            bail!("remote {} is banned until {}", ban.key, ban.expires_at.to_rfc3339());
        }
        if !should_start(true, &self.pool) {
            bail!("no service accounts loaded, not starting reissue server");
        }

        let sweep = sweep_interval.map(|interval| spawn_sweep_task(self.bans().clone(), interval));

        let server = ReissueServer::start(remotes.join(","), self.pool.clone(), self.reissue.clone())
            .await
            .context("failed to start reissue server")?;
        writeln!(out, "{}", server.url())?;
        out.flush()?;

        shutdown.await;

        let stopped = server.stop().await;
        if let Some(handle) = sweep {
            handle.abort();
        }
        stopped.context("reissue server did not stop cleanly")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_pool::{DEFAULT_ENV_PREFIX, PoolSettings};
    use std::collections::HashMap;

    async fn test_broker(dir: &tempfile::TempDir, files: &[&str]) -> (Broker, Vec<String>) {
        let sa_dir = dir.path().join("sa");
        std::fs::create_dir_all(&sa_dir).unwrap();
        for name in files {
            std::fs::write(sa_dir.join(name), "{}").unwrap();
        }

        let mut catalog = Catalog::new(
            HashMap::from([
                ("gdrive".to_string(), vec![sa_dir]),
                ("backup".to_string(), vec![dir.path().join("missing")]),
            ]),
            DEFAULT_ENV_PREFIX,
        );
        catalog.load(&FsLister, &["gdrive", "backup"]);
        let bans = BanStore::load(dir.path().join("bans.json")).await.unwrap();
        let pool = CredentialPool::new(catalog, Arc::new(bans), PoolSettings::default());

        let paths = pool
            .catalog()
            .get("gdrive")
            .map(|r| r.credentials.iter().map(|c| c.path.clone()).collect())
            .unwrap_or_default();
        (Broker::new(Arc::new(pool), ReissueSettings::default()), paths)
    }

    fn output(buf: Vec<u8>) -> String {
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn ban_target_classifies_keys() {
        assert_eq!(
            BanTarget::parse("/opt/sa/sa1.json"),
            BanTarget::Credential("/opt/sa/sa1.json")
        );
        assert_eq!(BanTarget::parse("gdrive:media/tv"), BanTarget::Remote("gdrive"));
        assert_eq!(BanTarget::parse("gdrive"), BanTarget::Remote("gdrive"));
    }

    #[tokio::test]
    async fn lease_prints_env_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, paths) = test_broker(&dir, &["sa1.json", "sa2.json"]).await;

        let mut out = Vec::new();
        broker.lease(&["gdrive:media".into()], &mut out).await.unwrap();
        assert_eq!(
            output(out),
            format!("RCLONE_CONFIG_GDRIVE_SERVICE_ACCOUNT_FILE={}\n", paths[0])
        );
    }

    #[tokio::test]
    async fn lease_refuses_banned_remote() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = test_broker(&dir, &["sa1.json"]).await;

        broker.ban("gdrive:media", Some(1), &mut Vec::new()).await.unwrap();
        let err = broker
            .lease(&["gdrive:media".into()], &mut Vec::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gdrive is banned"), "got: {err}");
    }

    #[tokio::test]
    async fn ban_unban_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, paths) = test_broker(&dir, &["sa1.json"]).await;

        broker.ban(&paths[0], None, &mut Vec::new()).await.unwrap();
        broker.ban("gdrive:media", Some(2), &mut Vec::new()).await.unwrap();

        let mut out = Vec::new();
        broker.list_bans(&mut out).await.unwrap();
        let listed = output(out);
        assert!(listed.contains(&paths[0]));
        assert!(listed.lines().any(|l| l.starts_with("gdrive\t")));

        let mut out = Vec::new();
        broker.unban("gdrive:media", &mut out).await.unwrap();
        assert_eq!(output(out), "unbanned gdrive\n");

        let mut out = Vec::new();
        broker.unban("gdrive", &mut out).await.unwrap();
        assert_eq!(output(out), "gdrive was not banned\n");
    }

    #[tokio::test]
    async fn status_counts_available_service_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, paths) = test_broker(&dir, &["sa1.json", "sa2.json", "sa3.json"]).await;
        broker.ban(&paths[1], Some(1), &mut Vec::new()).await.unwrap();

        let mut out = Vec::new();
        broker.status(&mut out).await.unwrap();
        assert_eq!(output(out), "backup\t0\t0\ngdrive\t3\t2\n");
    }

    #[tokio::test]
    async fn report_fatal_exit_bans_credentials_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, paths) = test_broker(&dir, &["sa1.json", "sa2.json"]).await;

        let mut out = Vec::new();
        broker
            .report(7, "gdrive:media", &[paths[0].clone()], &mut out)
            .await
            .unwrap();
        assert_eq!(output(out), "retry\n");
        assert!(broker.bans().is_banned(&paths[0]).await.is_some());

        // The retry gets the next service account
        let mut out = Vec::new();
        broker.lease(&["gdrive:media".into()], &mut out).await.unwrap();
        assert!(output(out).ends_with(&format!("={}\n", paths[1])));
    }

    #[tokio::test]
    async fn report_fatal_exit_without_credentials_bans_remote() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = test_broker(&dir, &["sa1.json"]).await;

        let mut out = Vec::new();
        broker.report(7, "gdrive:media", &[], &mut out).await.unwrap();
        assert_eq!(output(out), "abort\n");
        assert!(broker.bans().is_banned("gdrive").await.is_some());
    }

    #[tokio::test]
    async fn report_other_exits_do_not_ban() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, paths) = test_broker(&dir, &["sa1.json"]).await;

        for (code, expected) in [(0, "done\n"), (3, "abort\n"), (8, "abort\n")] {
            let mut out = Vec::new();
            broker
                .report(code, "gdrive:media", &[paths[0].clone()], &mut out)
                .await
                .unwrap();
            assert_eq!(output(out), expected, "code {code}");
        }
        assert!(broker.bans().entries().await.is_empty());
    }

    #[tokio::test]
    async fn purge_reports_count() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = test_broker(&dir, &["sa1.json"]).await;
        broker
            .bans()
            .ban_until("stale", chrono_past())
            .await
            .unwrap();

        let mut out = Vec::new();
        broker.purge(&mut out).await.unwrap();
        assert_eq!(output(out), "purged 1 expired bans\n");
    }

    fn chrono_past() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now() - chrono::Duration::hours(1)
    }

    #[tokio::test]
    async fn serve_prints_url_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = test_broker(&dir, &["sa1.json"]).await;

        let mut out = Vec::new();
        broker
            .serve(
                &["gdrive:media".into()],
                Some(Duration::from_secs(3600)),
                &mut out,
                tokio::time::sleep(Duration::from_millis(20)),
            )
            .await
            .unwrap();
        assert!(output(out).starts_with("http://127.0.0.1:"));
    }

    #[tokio::test]
    async fn serve_refuses_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, _) = test_broker(&dir, &[]).await;

        let err = broker
            .serve(&["backup:media".into()], None, &mut Vec::new(), async {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no service accounts"), "got: {err}");
    }
}
