use anyhow::{Context, Result, anyhow};
use std::{io::ErrorKind, net::SocketAddr};
use tokio::net::TcpListener;
use tracing::error;

/// How many consecutive ports are tried before giving up.
pub const MAX_PORT_ATTEMPTS: u16 = 10;

/// Bind `addr`, moving to the next port while the current one is in use.
///
/// # Errors
/// Returns an error when every candidate port is taken or binding fails for another reason.
pub async fn bind(addr: SocketAddr, attempts: u16) -> Result<TcpListener> {
    let mut candidate = addr;

    for _ in 0..attempts.max(1) {
        match TcpListener::bind(candidate).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == ErrorKind::AddrInUse => {
                error!("Port {} is already in use", candidate.port());
                let next = candidate
                    .port()
                    .checked_add(1)
                    .ok_or_else(|| anyhow!("no free port above {}", addr.port()))?;
                candidate.set_port(next);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to bind {candidate}"));
            }
        }
    }

    Err(anyhow!(
        "ports {} to {} are all in use",
        addr.port(),
        candidate.port().saturating_sub(1)
    ))
}
