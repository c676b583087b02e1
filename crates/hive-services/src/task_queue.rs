//! In-memory task queue — task records and their lifecycle.
//!
//! `Pending → Dispatched → Running → {Completed | Failed}`; any non-terminal
//! state may become `Cancelled`; `Dispatched | Running → Pending` when the
//! assigned worker disconnects. Terminal records are immutable and stay
//! until purged.
//!
//! The queue is plain state. Locking and the registry side of every
//! transition live in the dispatcher.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use hive_core::task::{
    FailureKind, Requirements, Strategy, TaskOutcome, TaskPayload, MAX_TASK_TIMEOUT_SECS,
};

use crate::worker_registry::WorkerId;

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Assigned to a worker and not finished.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Dispatched | TaskStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "dispatched" => Ok(TaskStatus::Dispatched),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A task as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub task_type: String,
    pub payload: TaskPayload,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub requirements: Requirements,
    /// Overrides the dispatcher's default strategy.
    #[serde(default)]
    pub strategy: Option<Strategy>,
    /// Wall-clock limit. `None` = sandbox default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Full state of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    #[serde(flatten)]
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub worker: Option<WorkerId>,
    /// Number of dispatches so far.
    pub attempt: u32,
    pub progress: Option<u8>,
    pub outcome: Option<TaskOutcome>,
    /// Unix ms.
    pub submitted_at: u64,
    pub dispatched_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub updated_at: u64,
    #[serde(skip)]
    pub pending_since: Instant,
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl TaskRecord {
    fn new(spec: TaskSpec) -> Self {
        let now = now_ms();
        Self {
            spec,
            status: TaskStatus::Pending,
            worker: None,
            attempt: 0,
            progress: None,
            outcome: None,
            submitted_at: now,
            dispatched_at: None,
            completed_at: None,
            updated_at: now,
            pending_since: Instant::now(),
            deadline: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// `Pending → Dispatched` on `worker`.
    pub fn assign(&mut self, worker: &str, deadline: Instant) {
        self.status = TaskStatus::Dispatched;
        self.worker = Some(worker.to_string());
        self.attempt += 1;
        self.progress = None;
        self.deadline = Some(deadline);
        self.dispatched_at = Some(now_ms());
        self.updated_at = now_ms();
    }

    /// `Dispatched → Running`, or a progress update while running.
    pub fn mark_running(&mut self, progress: Option<u8>) {
        self.status = TaskStatus::Running;
        if progress.is_some() {
            self.progress = progress.map(|p| p.min(100));
        }
        self.updated_at = now_ms();
    }

    /// `Dispatched | Running → Pending`. The attempt counter is kept.
    pub fn requeue(&mut self) {
        self.status = TaskStatus::Pending;
        self.worker = None;
        self.progress = None;
        self.deadline = None;
        self.pending_since = Instant::now();
        self.updated_at = now_ms();
    }

    /// Move to `Completed` or `Failed` according to `outcome`.
    pub fn finish(&mut self, outcome: TaskOutcome) {
        self.status = if outcome.is_success() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        if self.status == TaskStatus::Completed {
            self.progress = Some(100);
        }
        self.outcome = Some(outcome);
        self.deadline = None;
        self.completed_at = Some(now_ms());
        self.updated_at = now_ms();
    }

    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.finish(TaskOutcome::failure(kind, message));
    }

    pub fn cancel(&mut self, reason: &str) {
        self.status = TaskStatus::Cancelled;
        self.outcome = Some(TaskOutcome::failure(FailureKind::Cancelled, reason));
        self.deadline = None;
        self.completed_at = Some(now_ms());
        self.updated_at = now_ms();
    }
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub dispatched: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.dispatched + self.running + self.completed + self.failed + self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("task {0} already exists")]
    Duplicate(TaskId),
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("task {0} is already {1}")]
    AlreadyTerminal(TaskId, TaskStatus),
    #[error("task {0}: timeout of {1}s exceeds the {max}s maximum", max = MAX_TASK_TIMEOUT_SECS)]
    InvalidTimeout(TaskId, u64),
}

// ── Queue ─────────────────────────────────────────────────────────────────────

/// All tasks, keyed by id, plus submission order.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: HashMap<TaskId, TaskRecord>,
    /// Ids in submission order. Re-queued tasks keep their slot.
    order: Vec<TaskId>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new task in `Pending`.
    pub fn submit(&mut self, spec: TaskSpec) -> Result<TaskId, QueueError> {
        if self.tasks.contains_key(&spec.id) {
            return Err(QueueError::Duplicate(spec.id));
        }
        let id = spec.id.clone();
        self.order.push(id.clone());
        self.tasks.insert(id.clone(), TaskRecord::new(spec));
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TaskRecord> {
        self.tasks.get_mut(id)
    }

    /// Pending task ids in submission order.
    pub fn pending_ids(&self) -> Vec<TaskId> {
        self.ids_where(|t| t.status == TaskStatus::Pending)
    }

    /// In-flight task ids assigned to `worker`, in submission order.
    pub fn in_flight_on(&self, worker: &str) -> Vec<TaskId> {
        self.ids_where(|t| t.status.is_in_flight() && t.worker.as_deref() == Some(worker))
    }

    /// In-flight task ids whose deadline is at or before `now`.
    pub fn overdue(&self, now: Instant) -> Vec<TaskId> {
        self.ids_where(|t| t.status.is_in_flight() && t.deadline.is_some_and(|d| d <= now))
    }

    fn ids_where<F>(&self, pred: F) -> Vec<TaskId>
    where
        F: Fn(&TaskRecord) -> bool,
    {
        self.order
            .iter()
            .filter(|id| self.tasks.get(*id).is_some_and(&pred))
            .cloned()
            .collect()
    }

    /// Snapshot of every task in submission order.
    pub fn all(&self) -> Vec<TaskRecord> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect()
    }

    /// Drop terminal tasks, all of them or only those in `status`.
    /// Non-terminal tasks are never purged. Returns the number removed.
    pub fn purge(&mut self, status: Option<TaskStatus>) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, t| {
            let matches = t.status.is_terminal() && status.map_or(true, |s| s == t.status);
            !matches
        });
        let tasks = &self.tasks;
        self.order.retain(|id| tasks.contains_key(id));
        before - self.tasks.len()
    }

    pub fn counts(&self) -> TaskCounts {
        let mut c = TaskCounts::default();
        for t in self.tasks.values() {
            match t.status {
                TaskStatus::Pending => c.pending += 1,
                TaskStatus::Dispatched => c.dispatched += 1,
                TaskStatus::Running => c.running += 1,
                TaskStatus::Completed => c.completed += 1,
                TaskStatus::Failed => c.failed += 1,
                TaskStatus::Cancelled => c.cancelled += 1,
            }
        }
        c
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
