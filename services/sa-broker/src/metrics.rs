//! Prometheus metrics exposition
//!
//! The pool and reissue server record on the `metrics` facade:
//!
//! - `sa_pool_leases_total` (counter): label `remote`
//! - `sa_pool_exhausted_total` (counter): label `remote`
//! - `sa_pool_bans_total` (counter): label `kind` (`remote` or `credential`)
//! - `reissue_requests_total` (counter): label `outcome`
//!
//! `serve` installs the exporter so a scraper can read them from
//! `http://<listen_addr>/metrics`.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Attach help text to every counter the broker emits.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "sa_pool_leases_total",
        "Service accounts handed out, by remote"
    );
    metrics::describe_counter!(
        "sa_pool_exhausted_total",
        "Lease requests that found no usable service account, by remote"
    );
    metrics::describe_counter!(
        "sa_pool_bans_total",
        "Bans recorded through the pool, by kind"
    );
    metrics::describe_counter!(
        "reissue_requests_total",
        "Reissue callback requests, by outcome"
    );
}

/// Install the global recorder with an HTTP scrape listener on `listen`.
///
/// Must be called from inside the tokio runtime; the listener runs as a task
/// on it.
pub fn install_exporter(listen: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .with_context(|| format!("failed to start metrics exporter on {listen}"))?;
    describe_metrics();
    info!(%listen, "metrics exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_without_recorder_is_a_no_op() {
        describe_metrics();
    }

    #[test]
    fn described_counters_render_with_help_text() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        describe_metrics();
        metrics::counter!("sa_pool_leases_total", "remote" => "gdrive").increment(2);
        metrics::counter!("reissue_requests_total", "outcome" => "issued").increment(1);

        let output = handle.render();
        assert!(
            output.contains("# HELP sa_pool_leases_total Service accounts handed out"),
            "got: {output}"
        );
        assert!(
            output.contains("sa_pool_leases_total{remote=\"gdrive\"} 2"),
            "got: {output}"
        );
        assert!(
            output.contains("reissue_requests_total{outcome=\"issued\"} 1"),
            "got: {output}"
        );
    }

    #[tokio::test]
    async fn exporter_serves_scrapes_over_http() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let listen = listener.local_addr().unwrap();
        drop(listener);

        install_exporter(listen).unwrap();
        metrics::counter!("sa_pool_exhausted_total", "remote" => "gdrive").increment(1);

        // The listener task starts asynchronously
        let mut body = String::new();
        for _ in 0..50 {
            if let Ok(resp) = reqwest::get(format!("http://{listen}/metrics")).await {
                body = resp.text().await.unwrap();
                if body.contains("sa_pool_exhausted_total") {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(
            body.contains("sa_pool_exhausted_total{remote=\"gdrive\"} 1"),
            "got: {body}"
        );
    }
}
