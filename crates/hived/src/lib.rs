//! hived — Hive master/worker daemon.
//!
//! The roles live here so the binary and the integration tests run the same
//! connection, session, and scheduling loops.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;

use hive_core::config::HiveConfig;
use hive_core::crypto::AuthToken;
use hive_services::TlsIdentity;

pub mod cli;
pub mod discovery;
pub mod master;
pub mod worker;

use cli::Mode;

// ── Start-up helpers ─────────────────────────────────────────────────────────

/// Load the trust store, optional identity, and token. All fatal on error.
pub fn load_secrets(config: &HiveConfig, mode: Mode) -> Result<(TlsIdentity, AuthToken)> {
    let sec = &config.security;
    let identity = match mode {
        Mode::Worker => Some((sec.cert_path.as_path(), sec.key_path.as_path())),
        Mode::Master => match (&sec.client_cert_path, &sec.client_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            (None, None) => None,
            _ => bail!("client certificate and key must be given together"),
        },
    };
    let tls = TlsIdentity::load(&sec.ca_path, identity)
        .with_context(|| format!("failed to load TLS material (ca {})", sec.ca_path.display()))?;
    let token = AuthToken::load(&sec.token_path).context("failed to load auth token")?;
    Ok((tls, token))
}

/// Bind the first free TCP port in `min..=max`.
pub async fn bind_first_free(bind_addr: &str, min: u16, max: u16) -> Result<TcpListener> {
    let ip = bind_addr
        .parse()
        .with_context(|| format!("bad bind address '{bind_addr}'"))?;
    let mut last_err = None;
    for port in min..=max {
        match TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e).with_context(|| format!("no free port in {min}-{max} on {bind_addr}")),
        None => bail!("empty port range {min}-{max}"),
    }
}
