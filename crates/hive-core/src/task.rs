//! Task description types shared by master, worker, and the operator API.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Task type tag that implies an accelerator requirement.
pub const MACHINE_LEARNING: &str = "machine_learning";

/// Longest wall-clock timeout a task may request (7 days).
pub const MAX_TASK_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Timeout a task actually runs under. Absent or zero means `default`;
/// anything longer than `MAX_TASK_TIMEOUT_SECS` is clamped.
///
/// Master deadlines and worker sandboxes both go through this, so a given
/// request resolves to the same number of seconds on each side.
pub fn effective_timeout_secs(requested: Option<u64>, default: u64) -> u64 {
    requested
        .filter(|secs| *secs > 0)
        .unwrap_or(default)
        .min(MAX_TASK_TIMEOUT_SECS)
}

// ── Payload ───────────────────────────────────────────────────────────────────

/// Executable content of a task. Only the worker sandbox interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Run `program` with `args`.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Write `source` to a file and run it with `interpreter`.
    Script { interpreter: String, source: String },
}

impl TaskPayload {
    /// Short label for logs.
    pub fn label(&self) -> &str {
        match self {
            TaskPayload::Command { program, .. } => program,
            TaskPayload::Script { interpreter, .. } => interpreter,
        }
    }
}

// ── Requirements ──────────────────────────────────────────────────────────────

/// Capabilities a worker must have to be eligible for a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Requirements {
    /// Worker must report an accelerator (GPU).
    pub accelerator: bool,
    /// Minimum logical cores.
    pub min_cores: Option<u32>,
    /// Minimum total memory in MB.
    pub min_memory_mb: Option<u64>,
}

impl Requirements {
    /// Requirements implied by a task type tag, merged with explicit ones.
    pub fn for_task_type(task_type: &str, explicit: Requirements) -> Requirements {
        let mut req = explicit;
        if task_type == MACHINE_LEARNING {
            req.accelerator = true;
        }
        req
    }
}

// ── Strategy ──────────────────────────────────────────────────────────────────

/// Worker selection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastBusy,
    Fastest,
    #[default]
    Intelligent,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastBusy => "least_busy",
            Strategy::Fastest => "fastest",
            Strategy::Intelligent => "intelligent",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_busy" => Ok(Strategy::LeastBusy),
            "fastest" => Ok(Strategy::Fastest),
            "intelligent" => Ok(Strategy::Intelligent),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

// ── Outcome ───────────────────────────────────────────────────────────────────

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Payload exited non-zero, died on a signal, or could not be spawned.
    ExecutionError,
    /// CPU-time or memory ceiling hit.
    ResourceLimitExceeded,
    /// Wall-clock or dispatch deadline expired.
    Timeout,
    /// Execution was aborted by a cancel request.
    Cancelled,
    /// No eligible worker appeared within the maximum pending age.
    SchedulingTimeout,
    /// The worker refused the dispatch (e.g. at capacity or malformed).
    Rejected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::ExecutionError => "execution_error",
            FailureKind::ResourceLimitExceeded => "resource_limit_exceeded",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::SchedulingTimeout => "scheduling_timeout",
            FailureKind::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Terminal result of one task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        stdout: String,
        stderr: String,
        return_value: Option<serde_json::Value>,
        exit_code: i32,
        elapsed_ms: u64,
    },
    Failed {
        kind: FailureKind,
        message: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default)]
        elapsed_ms: u64,
    },
}

impl TaskOutcome {
    /// Failure without captured output (scheduling, deadline, cancel).
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            kind,
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            TaskOutcome::Completed { .. } => None,
            TaskOutcome::Failed { kind, .. } => Some(*kind),
        }
    }
}
