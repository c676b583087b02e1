//! Authentication primitives for Hive.
//!
//! Provides two things:
//!   1. The pre-shared token and the HMAC-SHA256 challenge/response proofs
//!      used in the post-TLS handshake.
//!   2. BLAKE3 hashing for task identifiers.
//!
//! Token bytes live in a `Zeroizing` buffer and are wiped when dropped.
//! `AuthToken` never prints its contents.

use std::fmt;
use std::path::Path;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Domain label for the proof the connecting side (master) sends.
pub const CLIENT_PROOF_LABEL: &[u8] = b"hive/client";

/// Domain label for the proof the accepting side (worker) sends.
pub const SERVER_PROOF_LABEL: &[u8] = b"hive/server";

/// Handshake nonce length in bytes.
pub const NONCE_LEN: usize = 16;

pub type Nonce = [u8; NONCE_LEN];

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

// ── Nonces ────────────────────────────────────────────────────────────────────

/// Generate a cryptographically random handshake nonce.
pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Parse a hex nonce received on the wire.
pub fn parse_nonce(hex_str: &str) -> Result<Nonce, CryptoError> {
    let bytes = hex::decode(hex_str).map_err(|_| CryptoError::BadNonce)?;
    bytes.try_into().map_err(|_| CryptoError::BadNonce)
}

// ── Token ─────────────────────────────────────────────────────────────────────

/// Pre-shared authentication token, provisioned out-of-band as a file.
#[derive(Clone)]
pub struct AuthToken {
    secret: Zeroizing<Vec<u8>>,
}

impl AuthToken {
    /// Build a token from raw bytes. Surrounding ASCII whitespace is trimmed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let start = bytes.iter().position(|b| !b.is_ascii_whitespace());
        let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace());
        match (start, end) {
            (Some(s), Some(e)) => Ok(Self {
                secret: Zeroizing::new(bytes[s..=e].to_vec()),
            }),
            _ => Err(CryptoError::EmptyToken),
        }
    }

    /// Load the token from a file on disk.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let raw = Zeroizing::new(
            std::fs::read(path).map_err(|e| CryptoError::TokenUnreadable(path.to_path_buf(), e))?,
        );
        Self::from_bytes(&raw)
    }

    /// HMAC-SHA256 over `label || parts...`.
    pub fn sign(&self, label: &[u8], parts: &[&[u8]]) -> [u8; 32] {
        let mut mac = self.mac();
        mac.update(label);
        for part in parts {
            mac.update(part);
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    /// Constant-time check of a received proof.
    pub fn verify(&self, label: &[u8], parts: &[&[u8]], proof: &[u8]) -> bool {
        let mut mac = self.mac();
        mac.update(label);
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(proof).is_ok()
    }

    /// Proof the connecting side sends in `AuthResponse`.
    pub fn client_proof(&self, server_nonce: &Nonce, client_nonce: &Nonce) -> [u8; 32] {
        self.sign(CLIENT_PROOF_LABEL, &[server_nonce, client_nonce])
    }

    /// Proof the accepting side sends once the client is verified.
    pub fn server_proof(&self, client_nonce: &Nonce, server_nonce: &Nonce) -> [u8; 32] {
        self.sign(SERVER_PROOF_LABEL, &[client_nonce, server_nonce])
    }

    fn mac(&self) -> HmacSha256 {
        <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"))
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("authentication token is empty")]
    EmptyToken,

    #[error("failed to read token file {0}: {1}")]
    TokenUnreadable(std::path::PathBuf, std::io::Error),

    #[error("nonce must be {NONCE_LEN} hex-encoded bytes")]
    BadNonce,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
