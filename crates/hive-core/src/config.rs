//! Configuration system for Hive.
//!
//! Resolution order: environment variables → config file → defaults.
//! Command-line flags on `hived` are applied on top of the result.
//!
//! Config file location:
//!   1. $HIVE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/hive/config.toml
//!   3. ~/.config/hive/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::task::Strategy;
use crate::wire;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub security: SecurityConfig,
    pub scheduler: SchedulerConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Stable node id. Empty = derived from hostname and listen port.
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind listeners on.
    pub bind_addr: String,
    /// UDP port for discovery broadcasts.
    pub discovery_port: u16,
    /// Disable UDP discovery entirely (static workers only).
    pub discovery_enabled: bool,
    /// Worker listen range, inclusive. The first free port is used.
    pub worker_port_min: u16,
    pub worker_port_max: u16,
    /// Master operator API listen range, inclusive.
    pub api_port_min: u16,
    pub api_port_max: u16,
    /// Worker addresses (host:port) the master connects to without discovery.
    pub static_workers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// PEM certificate chain presented by this node's TLS server (worker).
    pub cert_path: PathBuf,
    /// PEM private key for `cert_path`.
    pub key_path: PathBuf,
    /// PEM trust store used to verify the peer.
    pub ca_path: PathBuf,
    /// Optional client certificate (master) for mutual TLS.
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// Require client certificates on the worker side.
    pub require_client_cert: bool,
    /// Pre-shared token file.
    pub token_path: PathBuf,
    /// Name the worker certificates are issued for.
    pub server_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Strategy used when a task does not name one.
    pub default_strategy: Strategy,
    /// Scheduling tick in milliseconds.
    pub tick_ms: u64,
    /// Added to a task's execution limit to form its dispatch deadline.
    pub dispatch_grace_secs: u64,
    /// Pending tasks with no eligible worker fail after this long.
    pub max_pending_secs: u64,
    /// Workers silent for this long are dropped.
    pub heartbeat_timeout_secs: u64,
    pub ping_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub work_dir: PathBuf,
    /// CPU-time ceiling per task in seconds. 0 = unlimited.
    pub cpu_time_secs: u64,
    /// Address-space / resident memory ceiling in bytes. 0 = unlimited.
    pub memory_bytes: u64,
    /// Default wall-clock limit in seconds.
    pub wall_clock_secs: u64,
    pub progress_interval_secs: u64,
    /// Max concurrent tasks. 0 = num_cpus.
    pub max_concurrent_tasks: u32,
    /// Captured stdout/stderr cap per stream, in bytes.
    pub output_limit_bytes: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            discovery_port: wire::DISCOVERY_PORT,
            discovery_enabled: true,
            worker_port_min: wire::WORKER_PORT_RANGE.0,
            worker_port_max: wire::WORKER_PORT_RANGE.1,
            api_port_min: wire::MASTER_PORT_RANGE.0,
            api_port_max: wire::MASTER_PORT_RANGE.1,
            static_workers: Vec::new(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            cert_path: config_dir().join("tls").join("node.crt"),
            key_path: config_dir().join("tls").join("node.key"),
            ca_path: config_dir().join("tls").join("ca.crt"),
            client_cert_path: None,
            client_key_path: None,
            require_client_cert: false,
            token_path: config_dir().join("token"),
            server_name: "hive-worker".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::Intelligent,
            tick_ms: 500,
            dispatch_grace_secs: 5,
            max_pending_secs: 120,
            heartbeat_timeout_secs: wire::HEARTBEAT_TIMEOUT_SECS,
            ping_interval_secs: wire::PING_INTERVAL_SECS,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/tmp/hive-sandbox"),
            cpu_time_secs: 300,
            memory_bytes: 512 * 1024 * 1024,
            wall_clock_secs: 600,
            progress_interval_secs: 2,
            max_concurrent_tasks: 0,
            output_limit_bytes: 1024 * 1024,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("hive")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid port range {0}-{1}")]
    BadPortRange(u16, u16),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl HiveConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            HiveConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("HIVE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&HiveConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the daemon cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = &self.network;
        if n.worker_port_min > n.worker_port_max {
            return Err(ConfigError::BadPortRange(n.worker_port_min, n.worker_port_max));
        }
        if n.api_port_min > n.api_port_max {
            return Err(ConfigError::BadPortRange(n.api_port_min, n.api_port_max));
        }
        Ok(())
    }

    /// Apply HIVE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. Split out so tests do
    /// not have to touch the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HIVE_IDENTITY__NODE_ID") {
            self.identity.node_id = v;
        }
        if let Some(v) = lookup("HIVE_NETWORK__BIND_ADDR") {
            self.network.bind_addr = v;
        }
        if let Some(p) = lookup("HIVE_NETWORK__DISCOVERY_PORT").and_then(|v| v.parse().ok()) {
            self.network.discovery_port = p;
        }
        if let Some(v) = lookup("HIVE_NETWORK__DISCOVERY_ENABLED") {
            self.network.discovery_enabled = v == "true" || v == "1";
        }
        if let Some(v) = lookup("HIVE_NETWORK__STATIC_WORKERS") {
            self.network.static_workers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("HIVE_SECURITY__CERT_PATH") {
            self.security.cert_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("HIVE_SECURITY__KEY_PATH") {
            self.security.key_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("HIVE_SECURITY__CA_PATH") {
            self.security.ca_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("HIVE_SECURITY__TOKEN_PATH") {
            self.security.token_path = PathBuf::from(v);
        }
        if let Some(s) = lookup("HIVE_SCHEDULER__DEFAULT_STRATEGY").and_then(|v| v.parse().ok()) {
            self.scheduler.default_strategy = s;
        }
        if let Some(v) = lookup("HIVE_SANDBOX__CPU_TIME_SECS").and_then(|v| v.parse().ok()) {
            self.sandbox.cpu_time_secs = v;
        }
        if let Some(v) = lookup("HIVE_SANDBOX__MEMORY_BYTES").and_then(|v| v.parse().ok()) {
            self.sandbox.memory_bytes = v;
        }
        if let Some(v) = lookup("HIVE_SANDBOX__WALL_CLOCK_SECS").and_then(|v| v.parse().ok()) {
            self.sandbox.wall_clock_secs = v;
        }
        if let Some(v) = lookup("HIVE_SANDBOX__WORK_DIR") {
            self.sandbox.work_dir = PathBuf::from(v);
        }
    }
}
