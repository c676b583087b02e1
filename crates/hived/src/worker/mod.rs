//! Worker role: TLS listener, discovery announce, sandboxed execution.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, watch};

use hive_core::config::HiveConfig;
use hive_core::message::Role;
use hive_core::wire::{PROTOCOL_VERSION, RESOURCE_REPORT_INTERVAL_SECS};
use hive_services::discovery::DiscoveryPacket;
use hive_services::{NodeInfo, ResourceCollector, Transport};

use crate::cli::Mode;
use crate::discovery::announce;

pub mod executor;
pub mod session;

use executor::Executor;

pub async fn run(config: HiveConfig, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let (tls, token) = crate::load_secrets(&config, Mode::Worker)?;

    let listener = crate::bind_first_free(
        &config.network.bind_addr,
        config.network.worker_port_min,
        config.network.worker_port_max,
    )
    .await
    .context("failed to bind worker listener")?;
    let port = listener.local_addr()?.port();

    tokio::fs::create_dir_all(&config.sandbox.work_dir)
        .await
        .with_context(|| format!("failed to create {}", config.sandbox.work_dir.display()))?;

    let mut collector = ResourceCollector::new(config.sandbox.work_dir.clone()).await;
    let hostname = collector.hostname().to_string();
    let node_id = if config.identity.node_id.is_empty() {
        format!("{hostname}:{port}")
    } else {
        config.identity.node_id.clone()
    };

    let info = NodeInfo {
        node_id: node_id.clone(),
        role: Role::Worker,
        hostname: hostname.clone(),
        listen_port: port,
    };
    let transport = Transport::server(&tls, token, info, config.security.require_client_cert)
        .context("failed to build TLS server")?;
    let executor = Executor::new(config.sandbox.clone());

    tracing::info!(
        node_id = %node_id,
        addr = %config.network.bind_addr,
        port,
        require_client_cert = config.security.require_client_cert,
        "worker listening"
    );

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let (reports_tx, reports_rx) = watch::channel(None);
    let sampler_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(RESOURCE_REPORT_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if reports_tx.send(Some(collector.sample())).is_err() {
                break;
            }
        }
    });

    let announce_task = if config.network.discovery_enabled {
        let packet = DiscoveryPacket::Announce {
            node_id: node_id.clone(),
            hostname,
            port,
            version: PROTOCOL_VERSION,
        };
        let discovery_port = config.network.discovery_port;
        let shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = announce::announce_loop(packet, discovery_port, shutdown).await {
                tracing::error!(error = %e, "discovery announce failed");
            }
        }))
    } else {
        tracing::info!("discovery disabled");
        None
    };

    let accept_task = {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            loop {
                let (tcp, peer) = match listener.accept().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                tracing::debug!(%peer, "inbound connection");
                tokio::spawn(session::serve(
                    tcp,
                    peer,
                    transport.clone(),
                    executor.clone(),
                    reports_rx.clone(),
                    shutdown_tx.subscribe(),
                ));
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    let announce_wait = async {
        match announce_task {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = accept_task        => tracing::error!("accept loop exited: {:?}", r),
        r = sampler_task       => tracing::error!("resource sampler exited: {:?}", r),
        r = announce_wait      => tracing::error!("discovery announce exited: {:?}", r),
    }

    // Let sessions send Disconnect and kill their sandboxes.
    tokio::time::sleep(Duration::from_millis(200)).await;
    tracing::info!("worker stopped");
    Ok(())
}
