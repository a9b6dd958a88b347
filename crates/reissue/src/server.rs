//! Reissue callback server
//!
//! One server per transfer operation, bound to a loopback port from the
//! shared registry. The whole request (cache lookup, ban, lease) runs under
//! the server's cache mutex, so concurrent reports of the same credential see
//! one consistent answer.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use sa_pool::CredentialPool;
use serde::Deserialize;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{DEFAULT_CACHE_TTL, DEFAULT_MAX_HITS, ReissueCache};
use crate::error::{Error, Result};
use crate::port::{PortClaim, claim_listener};

/// Default ban applied to a reported credential.
pub const DEFAULT_BAN_HOURS: u64 = 25;

/// Reissue server tuning.
#[derive(Debug, Clone)]
pub struct ReissueSettings {
    /// Interface to bind; loopback unless the tool runs elsewhere
    pub host: IpAddr,
    pub ban_hours: u64,
    pub cache_ttl: Duration,
    pub max_hits: u32,
}

impl Default for ReissueSettings {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ban_hours: DEFAULT_BAN_HOURS,
            cache_ttl: DEFAULT_CACHE_TTL,
            max_hits: DEFAULT_MAX_HITS,
        }
    }
}

/// Handler state for one server.
#[derive(Clone)]
pub struct ReissueState {
    pub name: String,
    pub pool: Arc<CredentialPool>,
    pub settings: ReissueSettings,
    pub cache: Arc<Mutex<ReissueCache>>,
}

impl ReissueState {
    pub fn new(name: impl Into<String>, pool: Arc<CredentialPool>, settings: ReissueSettings) -> Self {
        let cache = ReissueCache::new(settings.cache_ttl, settings.max_hits);
        Self {
            name: name.into(),
            pool,
            settings,
            cache: Arc::new(Mutex::new(cache)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReissueRequest {
    old: String,
    remote: String,
}

/// Router answering reissue requests on every path.
pub fn build_router(state: ReissueState) -> Router {
    Router::new().fallback(reissue_handler).with_state(state)
}

async fn reissue_handler(State(state): State<ReissueState>, method: Method, body: Bytes) -> Response {
    if method != Method::POST {
        metrics::counter!("reissue_requests_total", "outcome" => "method_not_allowed").increment(1);
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let mut cache = state.cache.lock().await;

    let request = match serde_json::from_slice::<ReissueRequest>(&body) {
        Ok(r) if !r.old.is_empty() && !r.remote.is_empty() => r,
        Ok(_) => {
            warn!(server = %state.name, "reissue request missing old or remote");
            return failed("malformed");
        }
        Err(e) => {
            warn!(server = %state.name, error = %e, "failed decoding reissue request");
            return failed("malformed");
        }
    };

    let now = Instant::now();
    if let Some(replacement) = cache.lookup(&request.old, now) {
        metrics::counter!("reissue_requests_total", "outcome" => "cached").increment(1);
        return replacement_response(replacement);
    }

    match state
        .pool
        .ban_credential(&request.old, state.settings.ban_hours)
        .await
    {
        Ok(expires_at) => {
            debug!(server = %state.name, path = %request.old, %expires_at, "banned reported service account")
        }
        Err(e) => {
            error!(server = %state.name, path = %request.old, error = %e, "failed banning service account");
            return failed("ban_failed");
        }
    }

    let issued = match state.pool.lease(&[request.remote.as_str()]).await {
        Ok(issued) => issued,
        Err(e) => {
            warn!(server = %state.name, remote = %request.remote, error = %e, "failed reissuing service account");
            return failed("exhausted");
        }
    };
    let Some(credential) = issued.into_iter().next() else {
        warn!(server = %state.name, remote = %request.remote, "no service account for remote");
        return failed("exhausted");
    };

    cache.insert(&request.old, &credential.path, now);
    debug!(
        server = %state.name,
        old = %request.old,
        replacement = %credential.path,
        "reissued service account"
    );
    metrics::counter!("reissue_requests_total", "outcome" => "issued").increment(1);
    replacement_response(credential.path)
}

fn replacement_response(path: String) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], path).into_response()
}

fn failed(outcome: &'static str) -> Response {
    metrics::counter!("reissue_requests_total", "outcome" => outcome).increment(1);
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

/// Whether a transfer should get a reissue server at all.
pub fn should_start(supports_reissue: bool, pool: &CredentialPool) -> bool {
    supports_reissue && pool.count() > 0
}

/// A running reissue server. Dropping it signals shutdown and frees its port.
pub struct ReissueServer {
    name: String,
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<std::io::Result<()>>>,
    _claim: PortClaim,
}

impl ReissueServer {
    /// Claim a port and start serving reissue requests from `pool`.
    pub async fn start(
        name: impl Into<String>,
        pool: Arc<CredentialPool>,
        settings: ReissueSettings,
    ) -> Result<Self> {
        let name = name.into();
        let (listener, claim) = claim_listener(settings.host).await?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Io(format!("reading bound address: {e}")))?;

        let app = build_router(ReissueState::new(name.clone(), pool, settings));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(server = %name, %addr, "started service account server");
        Ok(Self {
            name,
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            _claim: claim,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL handed to the transfer tool.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Shut down gracefully and wait for in-flight requests to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(Error::Io(format!("server error: {e}"))),
                Err(e) => return Err(Error::Io(format!("server task failed: {e}"))),
            }
        }
        info!(server = %self.name, addr = %self.addr, "stopped service account server");
        Ok(())
    }
}

impl Drop for ReissueServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
