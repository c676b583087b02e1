//! One task per worker connection.
//!
//! Drives the registry entry through `Connecting → Connected`, forwards
//! inbound messages to the scheduler, and drains the entry's outbound queue.
//! A failed handshake removes the entry and starts the candidate cool-down.

use tokio::sync::{broadcast, mpsc};

use hive_core::message::{Disconnect, Message, Role};
use hive_services::discovery::{Candidate, CandidateTable};
use hive_services::{Transport, TransportError, WorkerId, WorkerRegistry};

/// What connection tasks tell the scheduler.
#[derive(Debug)]
pub enum WorkerEvent {
    Connected { worker: WorkerId },
    Message { worker: WorkerId, message: Message },
    Closed { worker: WorkerId, connection: u64, reason: String },
}

pub async fn run(
    candidate: Candidate,
    transport: Transport,
    registry: WorkerRegistry,
    table: CandidateTable,
    events: mpsc::UnboundedSender<WorkerEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let id = candidate.id.clone();
    if !registry.mark_connecting(&id, candidate.addr) {
        tracing::debug!(worker = %id, "already connecting or connected");
        return;
    }

    let channel = match transport.connect(candidate.addr).await {
        Ok(c) => c,
        Err(e) => {
            reject(&id, &registry, &table, &e);
            return;
        }
    };
    let (hello, mut reader, mut writer) = channel.into_split();
    if hello.role != Role::Worker {
        let _ = writer
            .send(Message::Disconnect(Disconnect {
                reason: "expected a worker".into(),
            }))
            .await;
        writer.shutdown().await;
        reject(&id, &registry, &table, &TransportError::Auth("peer is not a worker".into()));
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = registry.mark_connected(&id, &hello, tx);
    table.clear(&id);
    tracing::info!(
        worker = %id,
        node_id = %hello.node_id,
        hostname = %hello.hostname,
        "worker connected"
    );
    let _ = events.send(WorkerEvent::Connected { worker: id.clone() });

    // Writer: ends when every sender clone is dropped (entry removed).
    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = writer.send(message).await {
                tracing::debug!(error = %e, "worker write failed");
                break;
            }
        }
        writer.shutdown().await;
    });

    let reason = loop {
        tokio::select! {
            r = reader.recv() => match r {
                Ok(message) => {
                    registry.touch(&id);
                    if events.send(WorkerEvent::Message { worker: id.clone(), message }).is_err() {
                        break "scheduler stopped".to_string();
                    }
                }
                Err(TransportError::Closed) => break "connection closed".to_string(),
                Err(e) => break e.to_string(),
            },

            _ = shutdown.recv() => {
                if let Some(sender) = registry.sender(&id) {
                    let _ = sender.send(Message::Disconnect(Disconnect {
                        reason: "master shutting down".into(),
                    }));
                }
                break "shutdown".to_string();
            }
        }
    };

    tracing::info!(worker = %id, reason, "worker connection ended");
    let _ = events.send(WorkerEvent::Closed {
        worker: id,
        connection,
        reason,
    });
    // The writer drains whatever is queued, then stops once the entry is gone.
    drop(writer_task);
}

fn reject(id: &str, registry: &WorkerRegistry, table: &CandidateTable, error: &TransportError) {
    if error.is_auth() {
        tracing::warn!(worker = %id, error = %error, "worker handshake rejected");
    } else {
        tracing::warn!(worker = %id, error = %error, "worker connection failed");
    }
    registry.remove(id);
    table.mark_failed(id);
}
