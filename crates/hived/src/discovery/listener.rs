//! Master side: collect worker announcements and emit new candidates.
//!
//! Announcements arrive on the shared discovery port (periodic broadcasts)
//! and on the probe socket (unicast replies to our probes).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time;

use hive_core::wire::PROBE_INTERVAL_SECS;
use hive_services::discovery::{Candidate, CandidateTable, DiscoveryPacket, MAX_DATAGRAM_LEN};
use hive_services::WorkerRegistry;

use super::{broadcast_addr, make_socket};

/// Listen for workers until shutdown. New candidates go to `candidates_tx`.
pub async fn listener_loop(
    node_id: String,
    discovery_port: u16,
    registry: WorkerRegistry,
    table: CandidateTable,
    candidates_tx: mpsc::UnboundedSender<Candidate>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listen = make_socket(discovery_port).context("failed to create discovery listener")?;
    let probe = make_socket(0).context("failed to create probe socket")?;
    let probe_bytes = DiscoveryPacket::Probe { node_id }.encode();
    let dest = broadcast_addr(discovery_port);

    let mut probe_interval = time::interval(Duration::from_secs(PROBE_INTERVAL_SECS));
    let mut listen_buf = vec![0u8; MAX_DATAGRAM_LEN];
    let mut probe_buf = vec![0u8; MAX_DATAGRAM_LEN];

    tracing::info!(port = discovery_port, "discovery listener starting");

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            _ = probe_interval.tick() => {
                table.prune();
                if let Err(e) = probe.send_to(&probe_bytes, dest).await {
                    tracing::warn!(error = %e, "probe send failed");
                }
            }

            r = recv(&listen, &mut listen_buf) => {
                if let Some((packet, src)) = r {
                    offer(&packet, src, &registry, &table, &candidates_tx);
                }
            }

            r = recv(&probe, &mut probe_buf) => {
                if let Some((packet, src)) = r {
                    offer(&packet, src, &registry, &table, &candidates_tx);
                }
            }
        }
    }
    Ok(())
}

async fn recv(socket: &UdpSocket, buf: &mut [u8]) -> Option<(DiscoveryPacket, SocketAddr)> {
    let (len, src) = match socket.recv_from(buf).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "recv_from failed");
            return None;
        }
    };
    match DiscoveryPacket::decode(&buf[..len]) {
        Some(packet) => Some((packet, src)),
        None => {
            tracing::trace!(%src, "failed to parse discovery datagram");
            None
        }
    }
}

fn offer(
    packet: &DiscoveryPacket,
    src: SocketAddr,
    registry: &WorkerRegistry,
    table: &CandidateTable,
    candidates_tx: &mpsc::UnboundedSender<Candidate>,
) {
    let Some(candidate) = Candidate::from_announce(src, packet) else {
        return;
    };
    if table.offer(&candidate, registry) {
        tracing::info!(worker = %candidate.id, hostname = %candidate.hostname, "worker discovered");
        let _ = candidates_tx.send(candidate);
    }
}
