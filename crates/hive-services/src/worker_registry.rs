//! Worker registry — the master's view of every known worker.
//!
//! One entry per worker id. Entries are created by discovery or a connection
//! attempt, become `Connected` only after the handshake succeeds, and are
//! removed when the connection closes or the heartbeat expires.
//!
//! The table sits behind a single `RwLock` so the dispatcher can hold it
//! across a queue update. Lock order is always registry, then queue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;

use hive_core::message::{Hello, Message, ResourceReport};

/// `host:port` of the worker listener.
pub type WorkerId = String;

/// Outbound half of a worker connection. Dropping every clone closes it.
pub type WorkerSender = mpsc::UnboundedSender<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Discovered,
    Connecting,
    Connected,
}

/// Externally visible worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Discovered,
    Connecting,
    Idle,
    Busy,
}

#[derive(Debug)]
struct WorkerEntry {
    addr: Option<SocketAddr>,
    node_id: Option<String>,
    hostname: String,
    lifecycle: Lifecycle,
    resources: Option<ResourceReport>,
    resources_at: Option<Instant>,
    active_tasks: u32,
    latency_ms: Option<f64>,
    sender: Option<WorkerSender>,
    connection: u64,
    last_seen: Instant,
}

impl WorkerEntry {
    fn new(addr: Option<SocketAddr>, lifecycle: Lifecycle) -> Self {
        Self {
            addr,
            node_id: None,
            hostname: String::new(),
            lifecycle,
            resources: None,
            resources_at: None,
            active_tasks: 0,
            latency_ms: None,
            sender: None,
            connection: 0,
            last_seen: Instant::now(),
        }
    }

    fn status(&self) -> WorkerStatus {
        match self.lifecycle {
            Lifecycle::Discovered => WorkerStatus::Discovered,
            Lifecycle::Connecting => WorkerStatus::Connecting,
            Lifecycle::Connected if self.active_tasks > 0 => WorkerStatus::Busy,
            Lifecycle::Connected => WorkerStatus::Idle,
        }
    }

    fn snapshot(&self, id: &str) -> WorkerSnapshot {
        WorkerSnapshot {
            id: id.to_string(),
            node_id: self.node_id.clone(),
            hostname: self.hostname.clone(),
            addr: self.addr.map(|a| a.to_string()),
            status: self.status(),
            active_tasks: self.active_tasks,
            latency_ms: self.latency_ms,
            resources: self.resources.clone(),
            resources_age_secs: self.resources_at.map(|t| t.elapsed().as_secs()),
            last_seen_secs: self.last_seen.elapsed().as_secs(),
        }
    }
}

/// Point-in-time copy of a worker entry. What the selector and the API see.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub node_id: Option<String>,
    pub hostname: String,
    pub addr: Option<String>,
    pub status: WorkerStatus,
    pub active_tasks: u32,
    /// Last measured round-trip time. `None` until the first pong.
    pub latency_ms: Option<f64>,
    pub resources: Option<ResourceReport>,
    pub resources_age_secs: Option<u64>,
    pub last_seen_secs: u64,
}

impl WorkerSnapshot {
    pub fn is_connected(&self) -> bool {
        matches!(self.status, WorkerStatus::Idle | WorkerStatus::Busy)
    }
}

// ── Table ─────────────────────────────────────────────────────────────────────

/// The locked worker table. Obtain through `WorkerRegistry::read` / `write`.
#[derive(Debug, Default)]
pub struct Workers {
    entries: HashMap<WorkerId, WorkerEntry>,
    next_connection: u64,
}

impl Workers {
    /// Record a discovered candidate. Returns `false` if the id is already known.
    pub fn mark_discovered(&mut self, id: &str, addr: SocketAddr) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }
        self.entries
            .insert(id.to_string(), WorkerEntry::new(Some(addr), Lifecycle::Discovered));
        true
    }

    /// Move an entry to `Connecting`, creating it if needed.
    /// Returns `false` if the worker is already connecting or connected.
    pub fn mark_connecting(&mut self, id: &str, addr: SocketAddr) -> bool {
        let entry = self
            .entries
            .entry(id.to_string())
            .or_insert_with(|| WorkerEntry::new(Some(addr), Lifecycle::Discovered));
        if entry.lifecycle != Lifecycle::Discovered {
            return false;
        }
        entry.lifecycle = Lifecycle::Connecting;
        entry.addr = Some(addr);
        true
    }

    /// Promote an authenticated worker to `Connected`.
    /// Returns the connection id used to match a later disconnect.
    pub fn mark_connected(&mut self, id: &str, hello: &Hello, sender: WorkerSender) -> u64 {
        self.next_connection += 1;
        let connection = self.next_connection;

        let entry = self
            .entries
            .entry(id.to_string())
            .or_insert_with(|| WorkerEntry::new(None, Lifecycle::Connecting));
        entry.lifecycle = Lifecycle::Connected;
        entry.node_id = Some(hello.node_id.clone());
        entry.hostname = hello.hostname.clone();
        entry.sender = Some(sender);
        entry.connection = connection;
        entry.active_tasks = 0;
        entry.latency_ms = None;
        entry.last_seen = Instant::now();
        connection
    }

    /// Replace the latest resource snapshot. No history is kept.
    pub fn upsert_resources(&mut self, id: &str, report: ResourceReport) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if entry.hostname.is_empty() {
            entry.hostname = report.hostname.clone();
        }
        entry.resources = Some(report);
        entry.resources_at = Some(Instant::now());
        entry.last_seen = Instant::now();
        true
    }

    pub fn increment_task_count(&mut self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.active_tasks += 1;
                true
            }
            None => false,
        }
    }

    /// Decrement the active-task count. Never goes below zero.
    pub fn decrement_task_count(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            if entry.active_tasks == 0 {
                tracing::warn!(worker = %id, "active task count already zero");
            } else {
                entry.active_tasks -= 1;
            }
        }
    }

    pub fn set_latency(&mut self, id: &str, rtt_ms: f64) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.latency_ms = Some(rtt_ms);
            entry.last_seen = Instant::now();
        }
    }

    /// Refresh the heartbeat timestamp.
    pub fn touch(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Drop an entry. Returns `true` if it existed.
    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Connected workers silent for longer than `timeout`.
    pub fn expired(&self, timeout: Duration) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.lifecycle == Lifecycle::Connected && e.last_seen.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Snapshot of connected workers, sorted by id.
    pub fn list_connected(&self) -> Vec<WorkerSnapshot> {
        let mut out: Vec<WorkerSnapshot> = self
            .entries
            .iter()
            .filter(|(_, e)| e.lifecycle == Lifecycle::Connected)
            .map(|(id, e)| e.snapshot(id))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Snapshot of every entry, sorted by id.
    pub fn list_all(&self) -> Vec<WorkerSnapshot> {
        let mut out: Vec<WorkerSnapshot> =
            self.entries.iter().map(|(id, e)| e.snapshot(id)).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn get(&self, id: &str) -> Option<WorkerSnapshot> {
        self.entries.get(id).map(|e| e.snapshot(id))
    }

    /// Outbound sender of a connected worker.
    pub fn sender(&self, id: &str) -> Option<WorkerSender> {
        self.entries
            .get(id)
            .filter(|e| e.lifecycle == Lifecycle::Connected)
            .and_then(|e| e.sender.clone())
    }

    /// Connection id of a connected worker.
    pub fn connection_of(&self, id: &str) -> Option<u64> {
        self.entries
            .get(id)
            .filter(|e| e.lifecycle == Lifecycle::Connected)
            .map(|e| e.connection)
    }

    pub fn active_tasks(&self, id: &str) -> Option<u32> {
        self.entries.get(id).map(|e| e.active_tasks)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Shared handle ─────────────────────────────────────────────────────────────

/// The worker registry — shared between discovery, connection tasks, the
/// dispatcher, and the API.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    inner: Arc<RwLock<Workers>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Workers> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Workers> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn list_connected(&self) -> Vec<WorkerSnapshot> {
        self.read().list_connected()
    }

    pub fn list_all(&self) -> Vec<WorkerSnapshot> {
        self.read().list_all()
    }

    pub fn get(&self, id: &str) -> Option<WorkerSnapshot> {
        self.read().get(id)
    }

    pub fn mark_discovered(&self, id: &str, addr: SocketAddr) -> bool {
        self.write().mark_discovered(id, addr)
    }

    pub fn mark_connecting(&self, id: &str, addr: SocketAddr) -> bool {
        self.write().mark_connecting(id, addr)
    }

    pub fn mark_connected(&self, id: &str, hello: &Hello, sender: WorkerSender) -> u64 {
        self.write().mark_connected(id, hello, sender)
    }

    pub fn upsert_resources(&self, id: &str, report: ResourceReport) -> bool {
        self.write().upsert_resources(id, report)
    }

    pub fn increment_task_count(&self, id: &str) -> bool {
        self.write().increment_task_count(id)
    }

    pub fn decrement_task_count(&self, id: &str) {
        self.write().decrement_task_count(id)
    }

    pub fn set_latency(&self, id: &str, rtt_ms: f64) {
        self.write().set_latency(id, rtt_ms)
    }

    pub fn touch(&self, id: &str) {
        self.write().touch(id)
    }

    pub fn remove(&self, id: &str) -> bool {
        self.write().remove(id)
    }

    pub fn expired(&self, timeout: Duration) -> Vec<WorkerId> {
        self.read().expired(timeout)
    }

    pub fn sender(&self, id: &str) -> Option<WorkerSender> {
        self.read().sender(id)
    }

    pub fn connection_of(&self, id: &str) -> Option<u64> {
        self.read().connection_of(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains(id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
