//! Local address auto-detection

use std::net::{IpAddr, SocketAddr};

use tokio::net::UdpSocket;

use crate::error::{Error, Result};

/// Routable public address used to pick the outbound interface. No packet is sent.
pub const PROBE_TARGET: &str = "8.8.8.8:80";

/// Address of the interface the OS would use for outbound traffic
pub async fn detect_local_address() -> Result<IpAddr> {
    detect_via(PROBE_TARGET).await
}

/// Address of the interface routing to `target`
pub async fn detect_via(target: &str) -> Result<IpAddr> {
    let bind: SocketAddr = if target.starts_with('[') {
        "[::]:0".parse()
    } else {
        "0.0.0.0:0".parse()
    }
    .map_err(|e| Error::AutoDetectFailure(format!("bad bind address: {}", e)))?;

    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| Error::AutoDetectFailure(format!("bind failed: {}", e)))?;
    socket
        .connect(target)
        .await
        .map_err(|e| Error::AutoDetectFailure(format!("no route to {}: {}", target, e)))?;
    let local = socket
        .local_addr()
        .map_err(|e| Error::AutoDetectFailure(e.to_string()))?
        .ip();

    if local.is_unspecified() {
        return Err(Error::AutoDetectFailure(
            "routing table selected no local address".into(),
        ));
    }
    tracing::debug!(%local, target, "Detected local address");
    Ok(local)
}
