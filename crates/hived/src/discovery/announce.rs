//! Worker side: periodic broadcast announce plus unicast replies to probes.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::time;

use hive_core::wire::ANNOUNCE_INTERVAL_SECS;
use hive_services::discovery::{DiscoveryPacket, MAX_DATAGRAM_LEN};

use super::{broadcast_addr, make_socket};

/// Announce `packet` on `discovery_port` until shutdown.
pub async fn announce_loop(
    packet: DiscoveryPacket,
    discovery_port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let socket = make_socket(discovery_port).context("failed to create discovery socket")?;
    let dest = broadcast_addr(discovery_port);
    let bytes = packet.encode();

    let mut interval = time::interval(Duration::from_secs(ANNOUNCE_INTERVAL_SECS));
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    tracing::info!(
        port = discovery_port,
        interval_secs = ANNOUNCE_INTERVAL_SECS,
        "discovery announce starting"
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            _ = interval.tick() => {
                match socket.send_to(&bytes, dest).await {
                    Ok(n) => tracing::trace!(bytes = n, "announce sent"),
                    Err(e) => tracing::warn!(error = %e, "announce send failed"),
                }
            }

            r = socket.recv_from(&mut buf) => {
                let (len, src) = match r {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "recv_from failed");
                        continue;
                    }
                };
                if let Some(DiscoveryPacket::Probe { node_id }) = DiscoveryPacket::decode(&buf[..len]) {
                    tracing::debug!(master = %node_id, %src, "probe received, answering");
                    if let Err(e) = socket.send_to(&bytes, src).await {
                        tracing::warn!(error = %e, %src, "probe reply failed");
                    }
                }
            }
        }
    }
    Ok(())
}
