//! Hive wire format — framing and protocol constants.
//!
//! Every message on a Hive connection is one frame:
//!
//! ```text
//!   +----------------+---------------------------------------+
//!   | length: u32 BE | JSON envelope {"kind","seq","body"}   |
//!   +----------------+---------------------------------------+
//! ```
//!
//! The length covers the JSON body only. Receivers check the length before
//! reading the body and reject anything above `MAX_FRAME_LEN`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::message::Envelope;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Protocol version carried in `Hello` and discovery announcements.
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of the frame length prefix in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest accepted frame body. Anything larger is a protocol violation.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// UDP port for discovery broadcasts.
pub const DISCOVERY_PORT: u16 = 5000;

/// Default worker listen range (inclusive).
pub const WORKER_PORT_RANGE: (u16, u16) = (3000, 3100);

/// Default master API listen range (inclusive).
pub const MASTER_PORT_RANGE: (u16, u16) = (5555, 5560);

/// Worker announcement interval in seconds.
pub const ANNOUNCE_INTERVAL_SECS: u64 = 2;

/// Master probe interval in seconds.
pub const PROBE_INTERVAL_SECS: u64 = 5;

/// Ping interval in seconds.
pub const PING_INTERVAL_SECS: u64 = 2;

/// Resource report interval in seconds.
pub const RESOURCE_REPORT_INTERVAL_SECS: u64 = 2;

/// A connection with no inbound frame for this long is considered dead.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 10;

/// Each handshake step must complete within this interval.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// A candidate whose handshake failed is not retried within this window.
pub const DISCOVERY_COOLDOWN_SECS: u64 = 30;

// ── Framing ───────────────────────────────────────────────────────────────────

/// Serialize an envelope into a complete frame (prefix + body).
pub fn encode_frame(envelope: &Envelope) -> Result<Bytes, WireError> {
    let body = serde_json::to_vec(envelope).map_err(|e| WireError::Malformed(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Validate a frame length prefix and return the body length.
pub fn frame_len(header: [u8; FRAME_HEADER_LEN]) -> Result<usize, WireError> {
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(WireError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Parse a frame body into an envelope.
pub fn decode_body(body: &[u8]) -> Result<Envelope, WireError> {
    serde_json::from_slice(body).map_err(|e| WireError::Malformed(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame length {0} exceeds maximum {}", MAX_FRAME_LEN)]
    FrameTooLarge(usize),

    #[error("zero-length frame")]
    EmptyFrame,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("body does not match kind {0:?}: {1}")]
    BodyMismatch(crate::message::MessageKind, String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
