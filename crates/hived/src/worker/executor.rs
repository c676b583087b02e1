//! Worker-side task executor.
//!
//! Each `TaskDispatch` runs on its own tokio task, gated by a semaphore so at
//! most `max_concurrent_tasks` sandboxes are alive. Progress samples and the
//! final outcome go back over the session's outbound queue. Every run is
//! owned by the master session that dispatched it; an entry lives only
//! until its result is sent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Semaphore};

use hive_core::config::SandboxConfig;
use hive_core::message::{Message, TaskDispatch, TaskProgress, TaskResult};
use hive_services::sandbox::{into_outcome, Progress};
use hive_services::{Sandbox, SandboxLimits};

struct Running {
    generation: u64,
    session: SessionId,
    cancel: oneshot::Sender<()>,
}

/// Identifies one master session on this worker.
pub type SessionId = u64;

#[derive(Clone)]
pub struct Executor {
    sandbox: Sandbox,
    config: SandboxConfig,
    slots: Arc<Semaphore>,
    running: Arc<DashMap<String, Running>>,
    generation: Arc<AtomicU64>,
    sessions: Arc<AtomicU64>,
}

impl Executor {
    pub fn new(config: SandboxConfig) -> Self {
        let max_tasks = if config.max_concurrent_tasks == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            config.max_concurrent_tasks as usize
        };
        tracing::info!(max_concurrent = max_tasks, work_dir = %config.work_dir.display(), "executor ready");

        Self {
            sandbox: Sandbox::new(config.work_dir.clone()),
            config,
            slots: Arc::new(Semaphore::new(max_tasks)),
            running: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            sessions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A fresh id for a master session.
    pub fn open_session(&self) -> SessionId {
        self.sessions.fetch_add(1, Ordering::Relaxed)
    }

    /// Start a dispatched task for `session`. A second dispatch of the same
    /// id replaces (and cancels) the first.
    pub fn spawn(
        &self,
        dispatch: TaskDispatch,
        session: SessionId,
        out: mpsc::UnboundedSender<Message>,
    ) {
        let task_id = dispatch.task_id.clone();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        if let Some(previous) = self.running.insert(
            task_id.clone(),
            Running {
                generation,
                session,
                cancel: cancel_tx,
            },
        ) {
            tracing::warn!(task_id = &task_id[..16.min(task_id.len())], "task re-dispatched, cancelling earlier run");
            let _ = previous.cancel.send(());
        }

        let limits = SandboxLimits::from_config(&self.config, Some(dispatch.timeout_secs));
        let sandbox = self.sandbox.clone();
        let slots = self.slots.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let permit = match slots.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return, // semaphore closed
            };

            tracing::info!(
                task_id = &task_id[..16.min(task_id.len())],
                task_type = %dispatch.task_type,
                attempt = dispatch.attempt,
                "task started"
            );

            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<Progress>();
            let forward = {
                let out = out.clone();
                let task_id = task_id.clone();
                tokio::spawn(async move {
                    while let Some(p) = progress_rx.recv().await {
                        let _ = out.send(Message::TaskProgress(TaskProgress {
                            task_id: task_id.clone(),
                            progress: p.percent,
                            elapsed_ms: p.elapsed_ms,
                        }));
                    }
                })
            };

            let start = Instant::now();
            let result = sandbox
                .run(
                    &task_id,
                    &dispatch.payload,
                    &dispatch.input,
                    &limits,
                    Some(progress_tx),
                    cancel_rx,
                )
                .await;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            let outcome = into_outcome(result, elapsed_ms);
            drop(permit);

            // Progress must not arrive after the result.
            let _ = forward.await;
            running.remove_if(&task_id, |_, r| r.generation == generation);

            match outcome.failure_kind() {
                None => tracing::info!(task_id = &task_id[..16.min(task_id.len())], elapsed_ms, "task finished"),
                Some(kind) => tracing::info!(
                    task_id = &task_id[..16.min(task_id.len())],
                    elapsed_ms,
                    %kind,
                    "task failed"
                ),
            }

            let _ = out.send(Message::TaskResult(TaskResult { task_id, outcome }));
        });
    }

    /// Kill a running task. Returns `false` if it is not running here.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.running.remove(task_id) {
            Some((_, r)) => {
                tracing::info!(task_id = &task_id[..16.min(task_id.len())], "cancelling task");
                let _ = r.cancel.send(());
                true
            }
            None => false,
        }
    }

    /// Kill every task `session` still has running. Returns how many.
    pub fn cancel_session(&self, session: SessionId) -> usize {
        let owned: Vec<(String, u64)> = self
            .running
            .iter()
            .filter(|r| r.session == session)
            .map(|r| (r.key().clone(), r.generation))
            .collect();

        let mut cancelled = 0;
        for (task_id, generation) in owned {
            if let Some((_, r)) = self
                .running
                .remove_if(&task_id, |_, r| r.generation == generation)
            {
                let _ = r.cancel.send(());
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }
}
