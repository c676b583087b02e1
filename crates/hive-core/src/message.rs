//! Hive protocol messages.
//!
//! On the wire every message is an `Envelope`: a `kind` discriminator, the
//! sender's sequence number, and a kind-specific JSON `body`. In memory the
//! typed `Message` enum is used; `into_envelope` / `from_envelope` convert.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::task::{TaskOutcome, TaskPayload};
use crate::wire::WireError;

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Discriminator for the envelope body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Hello,
    AuthChallenge,
    AuthResponse,
    ResourceReport,
    TaskDispatch,
    TaskProgress,
    TaskResult,
    TaskCancel,
    Ping,
    Pong,
    Disconnect,
}

/// JSON envelope — the body of every frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    /// Per-sender, strictly increasing.
    pub seq: u64,
    pub body: serde_json::Value,
}

// ── Bodies ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Worker,
}

/// First message in each direction of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub node_id: String,
    pub role: Role,
    pub hostname: String,
    /// Port the sender accepts connections on (0 for masters).
    pub listen_port: u16,
    /// Hex-encoded 16-byte handshake nonce.
    pub nonce: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    /// Hex-encoded 16-byte server nonce.
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Hex-encoded HMAC-SHA256.
    pub mac: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    pub percent: f64,
    pub plugged: bool,
}

/// Periodic worker resource snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub disk_free_gb: f64,
    pub has_accelerator: bool,
    #[serde(default)]
    pub accelerator: Option<String>,
    /// Logical cores.
    pub core_count: u32,
    #[serde(default)]
    pub physical_cores: u32,
    #[serde(default)]
    pub memory_total_mb: u64,
    pub hostname: String,
    pub platform: String,
    #[serde(default)]
    pub battery: Option<BatteryState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatch {
    pub task_id: String,
    pub task_type: String,
    pub payload: TaskPayload,
    #[serde(default)]
    pub input: serde_json::Value,
    /// Wall-clock limit for the sandbox.
    pub timeout_secs: u64,
    /// 1-based dispatch attempt; >1 means the task was re-queued before.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    /// Percentage reported by the payload, if any.
    #[serde(default)]
    pub progress: Option<u8>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCancel {
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Sender-local timestamp in microseconds, echoed back in `Pong`.
    pub ts_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub ts_us: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    pub reason: String,
}

// ── Message ───────────────────────────────────────────────────────────────────

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    AuthChallenge(AuthChallenge),
    AuthResponse(AuthResponse),
    ResourceReport(ResourceReport),
    TaskDispatch(TaskDispatch),
    TaskProgress(TaskProgress),
    TaskResult(TaskResult),
    TaskCancel(TaskCancel),
    Ping(Ping),
    Pong(Pong),
    Disconnect(Disconnect),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello(_) => MessageKind::Hello,
            Message::AuthChallenge(_) => MessageKind::AuthChallenge,
            Message::AuthResponse(_) => MessageKind::AuthResponse,
            Message::ResourceReport(_) => MessageKind::ResourceReport,
            Message::TaskDispatch(_) => MessageKind::TaskDispatch,
            Message::TaskProgress(_) => MessageKind::TaskProgress,
            Message::TaskResult(_) => MessageKind::TaskResult,
            Message::TaskCancel(_) => MessageKind::TaskCancel,
            Message::Ping(_) => MessageKind::Ping,
            Message::Pong(_) => MessageKind::Pong,
            Message::Disconnect(_) => MessageKind::Disconnect,
        }
    }

    /// Wrap into a wire envelope with the given sequence number.
    pub fn into_envelope(self, seq: u64) -> Result<Envelope, WireError> {
        let kind = self.kind();
        let body = match self {
            Message::Hello(b) => serde_json::to_value(b),
            Message::AuthChallenge(b) => serde_json::to_value(b),
            Message::AuthResponse(b) => serde_json::to_value(b),
            Message::ResourceReport(b) => serde_json::to_value(b),
            Message::TaskDispatch(b) => serde_json::to_value(b),
            Message::TaskProgress(b) => serde_json::to_value(b),
            Message::TaskResult(b) => serde_json::to_value(b),
            Message::TaskCancel(b) => serde_json::to_value(b),
            Message::Ping(b) => serde_json::to_value(b),
            Message::Pong(b) => serde_json::to_value(b),
            Message::Disconnect(b) => serde_json::to_value(b),
        }
        .map_err(|e| WireError::Malformed(e.to_string()))?;
        Ok(Envelope { kind, seq, body })
    }

    /// Decode the body of an envelope according to its kind.
    pub fn from_envelope(envelope: Envelope) -> Result<Message, WireError> {
        let Envelope { kind, body, .. } = envelope;
        Ok(match kind {
            MessageKind::Hello => Message::Hello(body_as(kind, body)?),
            MessageKind::AuthChallenge => Message::AuthChallenge(body_as(kind, body)?),
            MessageKind::AuthResponse => Message::AuthResponse(body_as(kind, body)?),
            MessageKind::ResourceReport => Message::ResourceReport(body_as(kind, body)?),
            MessageKind::TaskDispatch => Message::TaskDispatch(body_as(kind, body)?),
            MessageKind::TaskProgress => Message::TaskProgress(body_as(kind, body)?),
            MessageKind::TaskResult => Message::TaskResult(body_as(kind, body)?),
            MessageKind::TaskCancel => Message::TaskCancel(body_as(kind, body)?),
            MessageKind::Ping => Message::Ping(body_as(kind, body)?),
            MessageKind::Pong => Message::Pong(body_as(kind, body)?),
            MessageKind::Disconnect => Message::Disconnect(body_as(kind, body)?),
        })
    }
}

fn body_as<T: DeserializeOwned>(kind: MessageKind, body: serde_json::Value) -> Result<T, WireError> {
    serde_json::from_value(body).map_err(|e| WireError::BodyMismatch(kind, e.to_string()))
}
