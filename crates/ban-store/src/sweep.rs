//! Periodic ban sweep
//!
//! Expired bans are already dropped lazily whenever their key is checked.
//! Long-running processes (a `serve` session, a daemonized scheduler) can also
//! run this task so keys that are never checked again don't linger on disk.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::BanStore;

/// Spawn a background task that purges expired bans every `interval`.
///
/// Purge failures are logged and retried on the next tick. Returns a
/// `JoinHandle`; abort it to stop sweeping.
pub fn spawn_sweep_task(store: Arc<BanStore>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; the store was just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sweep_cycle(&store).await;
        }
    })
}

/// Run one sweep.
async fn sweep_cycle(store: &BanStore) {
    match store.purge_expired().await {
        Ok(0) => {}
        Ok(removed) => debug!(removed, "ban sweep removed expired entries"),
        Err(e) => warn!(error = %e, "ban sweep failed, will retry next cycle"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};

    #[tokio::test]
    async fn sweep_cycle_drops_expired_bans() {
        let dir = tempfile::tempdir().unwrap();
        let store = BanStore::load(dir.path().join("bans.json")).await.unwrap();
        store
            .ban_until("gdrive", Utc::now() - TimeDelta::seconds(1))
            .await
            .unwrap();
        store.ban("onedrive", 1).await.unwrap();

        sweep_cycle(&store).await;

        let contents = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert!(!contents.contains("gdrive"));
        assert!(contents.contains("onedrive"));
    }

    #[tokio::test]
    async fn sweep_task_runs_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BanStore::load(dir.path().join("bans.json")).await.unwrap());
        store
            .ban_for("gdrive", Duration::from_millis(10))
            .await
            .unwrap();

        let handle = spawn_sweep_task(store.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.abort();

        let contents = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert!(!contents.contains("gdrive"), "expired ban should be swept: {contents}");
    }
}
