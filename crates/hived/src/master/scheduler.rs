//! Master scheduling loop.
//!
//! Wakes on a fixed tick or when the dispatcher is poked (submit, result,
//! disconnect). Each pass sweeps deadlines, expires silent workers, and
//! dispatches pending tasks. Worker events are applied in arrival order.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc};
use tokio::time;

use hive_core::config::SchedulerConfig;
use hive_core::message::{Message, Ping, Pong};
use hive_services::Dispatcher;

use super::connection::WorkerEvent;

pub async fn run(
    dispatcher: Dispatcher,
    config: SchedulerConfig,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = time::interval(Duration::from_millis(config.tick_ms.max(10)));
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let mut ping = time::interval(Duration::from_secs(config.ping_interval_secs.max(1)));
    ping.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let heartbeat = Duration::from_secs(config.heartbeat_timeout_secs);

    tracing::info!(
        tick_ms = config.tick_ms,
        strategy = %config.default_strategy,
        "scheduler started"
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            _ = tick.tick() => {
                dispatcher.sweep_deadlines();
                dispatcher.expire_workers(heartbeat);
                schedule(&dispatcher);
            }

            _ = dispatcher.woken() => schedule(&dispatcher),

            _ = ping.tick() => ping_workers(&dispatcher),

            event = events.recv() => match event {
                Some(event) => handle_event(&dispatcher, event),
                None => break,
            },
        }
    }
    tracing::info!("scheduler stopped");
}

fn schedule(dispatcher: &Dispatcher) {
    let report = dispatcher.dispatch_next();
    if !report.dispatched.is_empty() || !report.expired.is_empty() {
        tracing::debug!(
            dispatched = report.dispatched.len(),
            waiting = report.waiting.len(),
            expired = report.expired.len(),
            "dispatch pass"
        );
    }
}

fn ping_workers(dispatcher: &Dispatcher) {
    let ts_us = now_us();
    for worker in dispatcher.registry().list_connected() {
        if let Some(sender) = dispatcher.registry().sender(&worker.id) {
            let _ = sender.send(Message::Ping(Ping { ts_us }));
        }
    }
}

fn handle_event(dispatcher: &Dispatcher, event: WorkerEvent) {
    let registry = dispatcher.registry();
    match event {
        WorkerEvent::Connected { .. } => dispatcher.wake(),

        WorkerEvent::Closed {
            worker,
            connection,
            reason,
        } => {
            // A stale close from a replaced connection must not drop the new one.
            if registry.connection_of(&worker) == Some(connection) {
                tracing::debug!(worker = %worker, reason, "applying disconnect");
                dispatcher.on_worker_disconnect(&worker);
            }
        }

        WorkerEvent::Message { worker, message } => match message {
            Message::ResourceReport(report) => {
                registry.upsert_resources(&worker, report);
            }
            Message::TaskProgress(p) => {
                dispatcher.on_task_progress(&worker, &p.task_id, p.progress);
            }
            Message::TaskResult(r) => {
                dispatcher.on_task_result(&worker, &r.task_id, r.outcome);
            }
            Message::Ping(p) => {
                if let Some(sender) = registry.sender(&worker) {
                    let _ = sender.send(Message::Pong(Pong { ts_us: p.ts_us }));
                }
            }
            Message::Pong(p) => {
                let rtt_us = now_us().saturating_sub(p.ts_us);
                registry.set_latency(&worker, rtt_us as f64 / 1000.0);
            }
            Message::Disconnect(d) => {
                tracing::info!(worker = %worker, reason = %d.reason, "worker is disconnecting");
            }
            other => {
                tracing::debug!(worker = %worker, kind = ?other.kind(), "unexpected message ignored");
            }
        },
    }
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
