//! Dispatcher — drives tasks through their lifecycle against the registry.
//!
//! Every transition that touches both the worker table and the task queue
//! takes the registry write lock first, then the queue lock, so active-task
//! counts always equal the number of in-flight tasks per worker.
//!
//! Delivery is at-least-once: tasks in flight on a worker that disconnects
//! go back to `Pending` and are dispatched again with a higher `attempt`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;

use hive_core::config::{SandboxConfig, SchedulerConfig};
use hive_core::crypto;
use hive_core::message::{Message, TaskCancel, TaskDispatch};
use hive_core::task::{
    effective_timeout_secs, FailureKind, Requirements, Strategy, TaskOutcome, TaskPayload,
    MAX_TASK_TIMEOUT_SECS,
};

use crate::selector::{SelectError, Selector};
use crate::task_queue::{QueueError, TaskCounts, TaskId, TaskQueue, TaskRecord, TaskSpec, TaskStatus};
use crate::worker_registry::{WorkerId, WorkerRegistry, Workers};

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub default_strategy: Strategy,
    /// Execution limit for tasks that do not set one.
    pub default_timeout_secs: u64,
    /// Added to the execution limit to form the dispatch deadline.
    pub grace: Duration,
    /// Pending tasks with no eligible worker fail after this long.
    pub max_pending_age: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default(), &SandboxConfig::default())
    }
}

impl DispatcherSettings {
    pub fn from_config(scheduler: &SchedulerConfig, sandbox: &SandboxConfig) -> Self {
        Self {
            default_strategy: scheduler.default_strategy,
            default_timeout_secs: sandbox.wall_clock_secs,
            grace: Duration::from_secs(scheduler.dispatch_grace_secs),
            max_pending_age: Duration::from_secs(scheduler.max_pending_secs),
        }
    }
}

/// What one `dispatch_next` pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: Vec<(TaskId, WorkerId)>,
    /// Still pending, no eligible worker yet.
    pub waiting: Vec<TaskId>,
    /// Failed with `SchedulingTimeout`.
    pub expired: Vec<TaskId>,
    /// Chosen worker's connection was closed; task left pending.
    pub send_failed: Vec<(TaskId, WorkerId)>,
}

/// The master's task dispatcher. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    registry: WorkerRegistry,
    queue: Arc<Mutex<TaskQueue>>,
    selector: Arc<Selector>,
    settings: DispatcherSettings,
    wake: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(registry: WorkerRegistry, selector: Arc<Selector>, settings: DispatcherSettings) -> Self {
        Self {
            registry,
            queue: Arc::new(Mutex::new(TaskQueue::new())),
            selector,
            settings,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Wake the scheduling loop early.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Resolves after the next `wake`.
    pub async fn woken(&self) {
        self.wake.notified().await
    }

    fn queue(&self) -> MutexGuard<'_, TaskQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Submission ───────────────────────────────────────────────────────────

    /// Queue a fully specified task. A zero timeout means "use the default";
    /// one above `MAX_TASK_TIMEOUT_SECS` is refused.
    pub fn submit(&self, mut spec: TaskSpec) -> Result<TaskId, QueueError> {
        match spec.timeout_secs {
            Some(0) => spec.timeout_secs = None,
            Some(secs) if secs > MAX_TASK_TIMEOUT_SECS => {
                return Err(QueueError::InvalidTimeout(spec.id, secs));
            }
            _ => {}
        }
        spec.requirements = Requirements::for_task_type(&spec.task_type, spec.requirements);
        let task_type = spec.task_type.clone();
        let id = self.queue().submit(spec)?;
        tracing::info!(task_id = %short(&id), task_type, "task submitted");
        self.wake();
        Ok(id)
    }

    /// Queue a task under a freshly generated id.
    pub fn submit_task(
        &self,
        task_type: &str,
        payload: TaskPayload,
        input: serde_json::Value,
        requirements: Requirements,
    ) -> Result<TaskId, QueueError> {
        self.submit(TaskSpec {
            id: new_task_id(task_type),
            task_type: task_type.to_string(),
            payload,
            input,
            requirements,
            strategy: None,
            timeout_secs: None,
        })
    }

    // ── Scheduling ───────────────────────────────────────────────────────────

    /// One scheduling pass over pending tasks in submission order.
    pub fn dispatch_next(&self) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut workers = self.registry.write();
        let mut queue = self.queue();

        for id in queue.pending_ids() {
            let Some(task) = queue.get_mut(&id) else {
                continue;
            };
            let strategy = task.spec.strategy.unwrap_or(self.settings.default_strategy);
            let candidates = workers.list_connected();

            let worker_id = match self.selector.select(&candidates, &task.spec.requirements, strategy) {
                Ok(w) => w,
                Err(SelectError::NoEligibleWorker) => {
                    if task.pending_since.elapsed() >= self.settings.max_pending_age {
                        tracing::warn!(
                            task_id = %short(&id),
                            waited_secs = task.pending_since.elapsed().as_secs(),
                            "no eligible worker, giving up"
                        );
                        task.fail(
                            FailureKind::SchedulingTimeout,
                            format!(
                                "no eligible worker within {}s",
                                self.settings.max_pending_age.as_secs()
                            ),
                        );
                        report.expired.push(id);
                    } else {
                        report.waiting.push(id);
                    }
                    continue;
                }
            };

            let timeout_secs =
                effective_timeout_secs(task.spec.timeout_secs, self.settings.default_timeout_secs);
            let attempt = task.attempt + 1;
            let dispatch = Message::TaskDispatch(TaskDispatch {
                task_id: id.clone(),
                task_type: task.spec.task_type.clone(),
                payload: task.spec.payload.clone(),
                input: task.spec.input.clone(),
                timeout_secs,
                attempt,
            });

            // Nothing is committed until the frame is queued on the connection.
            let sent = workers
                .sender(&worker_id)
                .is_some_and(|tx| tx.send(dispatch).is_ok());
            if !sent {
                tracing::warn!(
                    task_id = %short(&id),
                    worker = %worker_id,
                    "worker connection closed, task stays pending"
                );
                report.send_failed.push((id, worker_id));
                continue;
            }

            let now = Instant::now();
            let deadline = now
                .checked_add(Duration::from_secs(timeout_secs).saturating_add(self.settings.grace))
                .unwrap_or_else(|| now + Duration::from_secs(MAX_TASK_TIMEOUT_SECS));
            task.assign(&worker_id, deadline);
            workers.increment_task_count(&worker_id);

            tracing::info!(
                task_id = %short(&id),
                worker = %worker_id,
                %strategy,
                attempt,
                "task dispatched"
            );
            report.dispatched.push((id, worker_id));
        }

        report
    }

    // ── Worker events ────────────────────────────────────────────────────────

    /// Record progress for an in-flight task. Stale reports are ignored.
    pub fn on_task_progress(&self, worker: &str, task_id: &str, progress: Option<u8>) -> bool {
        let mut queue = self.queue();
        match queue.get_mut(task_id) {
            Some(t) if t.status.is_in_flight() && t.worker.as_deref() == Some(worker) => {
                t.mark_running(progress);
                true
            }
            _ => {
                tracing::debug!(task_id = %short(task_id), worker, "ignoring stale progress");
                false
            }
        }
    }

    /// Apply a task result. Ignored unless the task is in flight on `worker`.
    pub fn on_task_result(&self, worker: &str, task_id: &str, outcome: TaskOutcome) -> bool {
        let mut workers = self.registry.write();
        let mut queue = self.queue();

        let Some(task) = queue.get_mut(task_id) else {
            tracing::warn!(task_id = %short(task_id), worker, "result for unknown task");
            return false;
        };
        if task.status == TaskStatus::Cancelled {
            tracing::debug!(task_id = %short(task_id), worker, "result for cancelled task ignored");
            return false;
        }
        if !task.status.is_in_flight() || task.worker.as_deref() != Some(worker) {
            tracing::warn!(
                task_id = %short(task_id),
                worker,
                status = %task.status,
                "stale result ignored"
            );
            return false;
        }

        let failure = outcome.failure_kind();
        task.finish(outcome);
        workers.decrement_task_count(worker);

        match failure {
            None => tracing::info!(task_id = %short(task_id), worker, "task completed"),
            Some(kind) => tracing::info!(task_id = %short(task_id), worker, %kind, "task failed"),
        }
        self.wake();
        true
    }

    /// Drop a worker and re-queue everything it had in flight.
    pub fn on_worker_disconnect(&self, worker: &str) -> Vec<TaskId> {
        let mut workers = self.registry.write();
        let mut queue = self.queue();

        workers.remove(worker);
        let requeued = queue.in_flight_on(worker);
        for id in &requeued {
            if let Some(task) = queue.get_mut(id) {
                task.requeue();
            }
        }

        if requeued.is_empty() {
            tracing::info!(worker, "worker disconnected");
        } else {
            tracing::warn!(worker, count = requeued.len(), "worker disconnected, tasks re-queued");
            self.wake();
        }
        requeued
    }

    /// Disconnect every worker whose heartbeat is older than `timeout`.
    pub fn expire_workers(&self, timeout: Duration) -> Vec<WorkerId> {
        let expired = self.registry.expired(timeout);
        for id in &expired {
            tracing::warn!(worker = %id, timeout_secs = timeout.as_secs(), "worker heartbeat expired");
            self.on_worker_disconnect(id);
        }
        expired
    }

    /// Fail in-flight tasks past their dispatch deadline.
    pub fn sweep_deadlines(&self) -> Vec<TaskId> {
        let mut workers = self.registry.write();
        let mut queue = self.queue();

        let overdue = queue.overdue(Instant::now());
        for id in &overdue {
            let Some(task) = queue.get_mut(id) else {
                continue;
            };
            let worker = task.worker.clone();
            task.fail(FailureKind::Timeout, "dispatch deadline exceeded");
            if let Some(w) = worker {
                release(&mut workers, &w, id, "deadline exceeded");
                tracing::warn!(task_id = %short(id), worker = %w, "task deadline exceeded");
            }
        }
        overdue
    }

    // ── Operator actions ─────────────────────────────────────────────────────

    /// Cancel a non-terminal task. Returns its previous status.
    pub fn cancel(&self, task_id: &str) -> Result<TaskStatus, QueueError> {
        let mut workers = self.registry.write();
        let mut queue = self.queue();

        let task = queue
            .get_mut(task_id)
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(QueueError::AlreadyTerminal(task_id.to_string(), task.status));
        }

        let previous = task.status;
        let worker = task.worker.clone();
        task.cancel("cancelled by operator");

        if previous.is_in_flight() {
            if let Some(w) = worker {
                release(&mut workers, &w, task_id, "cancelled by operator");
            }
        }
        tracing::info!(task_id = %short(task_id), %previous, "task cancelled");
        Ok(previous)
    }

    /// Remove terminal tasks, all or those in `status`.
    pub fn purge(&self, status: Option<TaskStatus>) -> usize {
        let removed = self.queue().purge(status);
        tracing::info!(removed, status = ?status, "tasks purged");
        removed
    }

    // ── Snapshots ────────────────────────────────────────────────────────────

    pub fn task(&self, task_id: &str) -> Option<TaskRecord> {
        self.queue().get(task_id).cloned()
    }

    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.queue().all()
    }

    pub fn counts(&self) -> TaskCounts {
        self.queue().counts()
    }
}

/// Decrement the worker's count and tell it to stop, best effort.
fn release(workers: &mut Workers, worker: &str, task_id: &str, reason: &str) {
    workers.decrement_task_count(worker);
    if let Some(tx) = workers.sender(worker) {
        let _ = tx.send(Message::TaskCancel(TaskCancel {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        }));
    }
}

/// 32 hex chars: blake3 of a random nonce, the clock, and the type tag.
pub fn new_task_id(task_type: &str) -> TaskId {
    let nonce = crypto::generate_nonce();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut seed = Vec::with_capacity(nonce.len() + 16 + task_type.len());
    seed.extend_from_slice(&nonce);
    seed.extend_from_slice(&ts.to_le_bytes());
    seed.extend_from_slice(task_type.as_bytes());
    hex::encode(&crypto::hash(&seed)[..16])
}

fn short(id: &str) -> &str {
    &id[..16.min(id.len())]
}
