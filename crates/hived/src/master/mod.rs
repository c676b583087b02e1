//! Master role: discovery, worker connections, scheduling, operator API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use hive_core::config::HiveConfig;
use hive_core::message::Role;
use hive_core::wire::{DISCOVERY_COOLDOWN_SECS, PROBE_INTERVAL_SECS};
use hive_services::discovery::{Candidate, CandidateTable};
use hive_services::resources::local_hostname;
use hive_services::{
    Dispatcher, DispatcherSettings, NodeInfo, Selector, Transport, WorkerRegistry,
};

use crate::cli::Mode;
use crate::discovery::listener;

pub mod connection;
pub mod scheduler;

use connection::WorkerEvent;

pub async fn run(config: HiveConfig, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let (tls, token) = crate::load_secrets(&config, Mode::Master)?;

    let hostname = local_hostname();
    let node_id = if config.identity.node_id.is_empty() {
        format!("master@{hostname}")
    } else {
        config.identity.node_id.clone()
    };
    let info = NodeInfo {
        node_id: node_id.clone(),
        role: Role::Master,
        hostname,
        listen_port: 0,
    };
    let transport = Transport::client(&tls, token, info, &config.security.server_name)
        .context("failed to build TLS client")?;
    tracing::info!(node_id = %node_id, mutual_tls = tls.has_identity(), "master starting");

    // Shared state
    let registry = WorkerRegistry::new();
    let dispatcher = Dispatcher::new(
        registry.clone(),
        Arc::new(Selector::new()),
        DispatcherSettings::from_config(&config.scheduler, &config.sandbox),
    );
    let table = CandidateTable::new(Duration::from_secs(DISCOVERY_COOLDOWN_SECS));

    let (candidates_tx, mut candidates_rx) = mpsc::unbounded_channel::<Candidate>();
    let (events_tx, events_rx) = mpsc::unbounded_channel::<WorkerEvent>();

    // Operator API
    let api_listener = crate::bind_first_free(
        "127.0.0.1",
        config.network.api_port_min,
        config.network.api_port_max,
    )
    .await
    .context("failed to bind API listener")?;

    let api_state = hive_api::ApiState {
        dispatcher: dispatcher.clone(),
        node_id: node_id.clone(),
        started: Instant::now(),
    };
    let api_task = tokio::spawn(async move {
        if let Err(e) = hive_api::serve(api_state, api_listener).await {
            tracing::error!(error = %e, "API server failed");
        }
    });

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let discovery_task = if config.network.discovery_enabled {
        let registry = registry.clone();
        let table = table.clone();
        let tx = candidates_tx.clone();
        let node_id = node_id.clone();
        let port = config.network.discovery_port;
        let shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = listener::listener_loop(node_id, port, registry, table, tx, shutdown).await {
                tracing::error!(error = %e, "discovery listener failed");
            }
        }))
    } else {
        tracing::info!("discovery disabled");
        None
    };

    let static_task = {
        let workers = resolve_static(&config.network.static_workers).await;
        let registry = registry.clone();
        let table = table.clone();
        let tx = candidates_tx.clone();
        tokio::spawn(static_loop(workers, registry, table, tx))
    };

    let connector_task = {
        let registry = registry.clone();
        let table = table.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            while let Some(candidate) = candidates_rx.recv().await {
                tokio::spawn(connection::run(
                    candidate,
                    transport.clone(),
                    registry.clone(),
                    table.clone(),
                    events_tx.clone(),
                    shutdown_tx.subscribe(),
                ));
            }
        })
    };

    let scheduler_task = tokio::spawn(scheduler::run(
        dispatcher.clone(),
        config.scheduler.clone(),
        events_rx,
        shutdown_tx.subscribe(),
    ));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    let discovery_wait = async {
        match discovery_task {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = scheduler_task      => tracing::error!("scheduler exited: {:?}", r),
        r = connector_task      => tracing::error!("connector exited: {:?}", r),
        r = static_task         => tracing::error!("static worker loop exited: {:?}", r),
        r = api_task            => tracing::error!("API server exited: {:?}", r),
        r = discovery_wait      => tracing::error!("discovery listener exited: {:?}", r),
    }

    // Let connection tasks flush their Disconnect frames.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let counts = dispatcher.counts();
    tracing::info!(
        pending = counts.pending,
        running = counts.dispatched + counts.running,
        completed = counts.completed,
        failed = counts.failed,
        "master stopped"
    );
    Ok(())
}

async fn resolve_static(addrs: &[String]) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for raw in addrs {
        match tokio::net::lookup_host(raw.as_str()).await {
            Ok(mut found) => match found.next() {
                Some(addr) => out.push(addr),
                None => tracing::warn!(addr = %raw, "static worker resolved to nothing"),
            },
            Err(e) => tracing::warn!(addr = %raw, error = %e, "cannot resolve static worker"),
        }
    }
    out
}

/// Offer static workers now and again every probe interval, so dropped or
/// cooled-down workers are retried.
async fn static_loop(
    workers: Vec<SocketAddr>,
    registry: WorkerRegistry,
    table: CandidateTable,
    tx: mpsc::UnboundedSender<Candidate>,
) {
    if workers.is_empty() {
        return std::future::pending().await;
    }
    let mut interval = tokio::time::interval(Duration::from_secs(PROBE_INTERVAL_SECS));
    loop {
        interval.tick().await;
        for addr in &workers {
            let candidate = Candidate::manual(*addr);
            if table.offer(&candidate, &registry) {
                tracing::info!(worker = %candidate.id, "connecting to static worker");
                if tx.send(candidate).is_err() {
                    return;
                }
            }
        }
    }
}
