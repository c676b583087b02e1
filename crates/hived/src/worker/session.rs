//! One accepted master connection.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;

use hive_core::message::{Disconnect, Message, Pong, ResourceReport, Role};
use hive_core::wire::RESOURCE_REPORT_INTERVAL_SECS;
use hive_services::{Transport, TransportError};

use super::executor::Executor;

pub async fn serve(
    tcp: TcpStream,
    peer: SocketAddr,
    transport: Transport,
    executor: Executor,
    mut reports: watch::Receiver<Option<ResourceReport>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let channel = match transport.accept(tcp).await {
        Ok(c) => c,
        Err(e) if e.is_auth() => {
            tracing::warn!(%peer, error = %e, "master rejected");
            return;
        }
        Err(e) => {
            tracing::warn!(%peer, error = %e, "handshake failed");
            return;
        }
    };
    let (hello, mut reader, mut writer) = channel.into_split();
    if hello.role != Role::Master {
        tracing::warn!(%peer, node_id = %hello.node_id, "peer is not a master, closing");
        writer.shutdown().await;
        return;
    }
    tracing::info!(%peer, master = %hello.node_id, "master connected");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let goodbye = matches!(message, Message::Disconnect(_));
            if let Err(e) = writer.send(message).await {
                tracing::debug!(error = %e, "master write failed");
                break;
            }
            // Results of tasks killed on the way out must not reach the master.
            if goodbye {
                break;
            }
        }
        writer.shutdown().await;
    });

    let initial = reports.borrow_and_update().clone();
    if let Some(report) = initial {
        let _ = out_tx.send(Message::ResourceReport(report));
    }

    let mut report_interval = time::interval(Duration::from_secs(RESOURCE_REPORT_INTERVAL_SECS));
    let session = executor.open_session();

    let reason = loop {
        tokio::select! {
            r = reader.recv() => match r {
                Ok(Message::TaskDispatch(d)) => {
                    tracing::debug!(task_id = %d.task_id, attempt = d.attempt, "dispatch received");
                    executor.spawn(d, session, out_tx.clone());
                }
                Ok(Message::TaskCancel(c)) => {
                    tracing::info!(task_id = %c.task_id, reason = %c.reason, "cancel requested");
                    executor.cancel(&c.task_id);
                }
                Ok(Message::Ping(p)) => {
                    let _ = out_tx.send(Message::Pong(Pong { ts_us: p.ts_us }));
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Disconnect(d)) => break d.reason,
                Ok(other) => {
                    tracing::debug!(kind = ?other.kind(), "unexpected message ignored");
                }
                Err(TransportError::Closed) => break "connection closed".to_string(),
                Err(e) => break e.to_string(),
            },

            _ = report_interval.tick() => {
                let latest = reports.borrow().clone();
                if let Some(report) = latest {
                    let _ = out_tx.send(Message::ResourceReport(report));
                }
            }

            _ = shutdown.recv() => {
                let _ = out_tx.send(Message::Disconnect(Disconnect {
                    reason: "worker shutting down".into(),
                }));
                break "shutdown".to_string();
            }
        }
    };

    // The master re-queues whatever was in flight; stop the local copies.
    let cancelled = executor.cancel_session(session);
    tracing::info!(%peer, reason, cancelled, "master session ended");

    drop(out_tx);
    let _ = writer_task.await;
}
