//! Discovery datagrams and the master's candidate table.
//!
//! Workers broadcast `Announce` on the discovery port; the master broadcasts
//! `Probe` and workers answer with a unicast `Announce`. Nothing here is
//! authenticated: a candidate only becomes a worker after the transport
//! handshake succeeds.
//!
//! The candidate table deduplicates announcements. A candidate already in
//! the registry, or one whose handshake failed within the cool-down window,
//! is not emitted again.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::worker_registry::{WorkerId, WorkerRegistry};

/// Largest datagram the listener reads.
pub const MAX_DATAGRAM_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryPacket {
    /// Worker advertisement. `port` is the TLS listener port.
    Announce {
        node_id: String,
        hostname: String,
        port: u16,
        version: u32,
    },
    /// Master asking workers to announce now.
    Probe { node_id: String },
}

impl DiscoveryPacket {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(datagram: &[u8]) -> Option<Self> {
        if datagram.len() > MAX_DATAGRAM_LEN {
            return None;
        }
        serde_json::from_slice(datagram).ok()
    }
}

/// A worker address the master may try to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: WorkerId,
    pub addr: SocketAddr,
    pub hostname: String,
    pub node_id: Option<String>,
}

impl Candidate {
    /// Build a candidate from an announcement received from `src`.
    /// The listener address is the datagram source IP plus the announced port.
    pub fn from_announce(src: SocketAddr, packet: &DiscoveryPacket) -> Option<Self> {
        let DiscoveryPacket::Announce {
            node_id,
            hostname,
            port,
            ..
        } = packet
        else {
            return None;
        };
        if *port == 0 {
            return None;
        }
        let addr = SocketAddr::new(src.ip(), *port);
        Some(Self {
            id: addr.to_string(),
            addr,
            hostname: hostname.clone(),
            node_id: Some(node_id.clone()),
        })
    }

    /// A statically configured worker address.
    pub fn manual(addr: SocketAddr) -> Self {
        Self {
            id: addr.to_string(),
            addr,
            hostname: addr.ip().to_string(),
            node_id: None,
        }
    }
}

// ── Candidate table ───────────────────────────────────────────────────────────

/// Cool-down bookkeeping shared by the discovery listener and the
/// connection tasks.
#[derive(Debug, Clone)]
pub struct CandidateTable {
    cooldowns: Arc<DashMap<WorkerId, Instant>>,
    cooldown: Duration,
}

impl CandidateTable {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldowns: Arc::new(DashMap::new()),
            cooldown,
        }
    }

    /// Record `candidate` as discovered. Returns `true` when the master should
    /// try to connect: not cooling down and not already in the registry.
    pub fn offer(&self, candidate: &Candidate, registry: &WorkerRegistry) -> bool {
        if self.in_cooldown(&candidate.id) {
            tracing::trace!(worker = %candidate.id, "candidate cooling down");
            return false;
        }
        registry.mark_discovered(&candidate.id, candidate.addr)
    }

    /// Start the cool-down for a candidate whose handshake failed.
    pub fn mark_failed(&self, id: &str) {
        self.cooldowns
            .insert(id.to_string(), Instant::now() + self.cooldown);
    }

    pub fn in_cooldown(&self, id: &str) -> bool {
        let until = match self.cooldowns.get(id) {
            Some(until) => *until,
            None => return false,
        };
        if Instant::now() < until {
            return true;
        }
        self.cooldowns.remove(id);
        false
    }

    pub fn clear(&self, id: &str) {
        self.cooldowns.remove(id);
    }

    /// Drop expired cool-downs.
    pub fn prune(&self) {
        let now = Instant::now();
        self.cooldowns.retain(|_, until| *until > now);
    }

    pub fn cooling_down(&self) -> usize {
        self.cooldowns.len()
    }
}
