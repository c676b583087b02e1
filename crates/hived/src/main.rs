//! hived — Hive master/worker daemon.

use anyhow::{Context, Result};

use hive_core::config::HiveConfig;
use hived::cli::{Args, Mode};
use hived::{master, worker};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse(std::env::args().skip(1))?;

    // Load config
    if let Err(e) = HiveConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = HiveConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        HiveConfig::default()
    });
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    match args.mode {
        Mode::Master => master::run(config, shutdown_tx).await,
        Mode::Worker => worker::run(config, shutdown_tx).await,
    }
}
