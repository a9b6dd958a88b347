//! Local port allocation for reissue servers
//!
//! Concurrent transfer operations each run their own server, so the process
//! keeps one table of claimed ports. A port stays claimed until the server
//! that holds it is stopped or dropped.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{LazyLock, Mutex, PoisonError};

use tokio::net::TcpListener;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Bind attempts before giving up.
const MAX_ATTEMPTS: usize = 32;

static CLAIMED_PORTS: LazyLock<Mutex<HashSet<u16>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// A claimed port. Dropping it returns the port to the pool.
#[derive(Debug)]
pub struct PortClaim {
    port: u16,
}

impl PortClaim {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        CLAIMED_PORTS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
        trace!(port = self.port, "released port");
    }
}

/// Bind an ephemeral port on `host` that no sibling server has claimed.
///
/// The returned listener is already bound, so the port cannot be taken
/// between allocation and serving.
pub async fn claim_listener(host: IpAddr) -> Result<(TcpListener, PortClaim)> {
    for _ in 0..MAX_ATTEMPTS {
        let listener = TcpListener::bind(SocketAddr::new(host, 0))
            .await
            .map_err(|e| Error::PortAllocation(format!("binding {host}: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::PortAllocation(format!("reading bound address: {e}")))?
            .port();

        let claimed = CLAIMED_PORTS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port);
        if claimed {
            debug!(port, "found free port for service account server");
            return Ok((listener, PortClaim { port }));
        }
        trace!(port, "port already claimed by a sibling server, retrying");
    }

    Err(Error::PortAllocation(format!(
        "no unclaimed port on {host} after {MAX_ATTEMPTS} attempts"
    )))
}

#[cfg(test)]
pub(crate) fn is_claimed(port: u16) -> bool {
    CLAIMED_PORTS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(&port)
}
