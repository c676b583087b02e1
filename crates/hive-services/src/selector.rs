//! Worker selection — picks one eligible worker for a task.
//!
//! Candidates are first filtered by capability, then ranked by the task's
//! strategy. Every strategy breaks ties by lowest worker id, so the result
//! is a pure function of the snapshot (plus the rotation counter for
//! `RoundRobin`).

use std::sync::atomic::{AtomicUsize, Ordering};

use hive_core::task::{Requirements, Strategy};

use crate::worker_registry::{WorkerId, WorkerSnapshot};

/// Latency assumed for workers that have not answered a ping yet (Fastest).
pub const UNMEASURED_LATENCY_MS: f64 = 999.0;

/// CPU and memory usage assumed before the first resource report.
pub const UNREPORTED_USAGE_PERCENT: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("no eligible worker")]
    NoEligibleWorker,
}

/// Worker selector. Owns the round-robin rotation counter.
#[derive(Debug, Default)]
pub struct Selector {
    rotation: AtomicUsize,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose a worker for a task with `requirements` under `strategy`.
    pub fn select(
        &self,
        candidates: &[WorkerSnapshot],
        requirements: &Requirements,
        strategy: Strategy,
    ) -> Result<WorkerId, SelectError> {
        let mut eligible: Vec<&WorkerSnapshot> = candidates
            .iter()
            .filter(|w| w.is_connected() && is_eligible(w, requirements))
            .collect();
        if eligible.is_empty() {
            return Err(SelectError::NoEligibleWorker);
        }
        eligible.sort_by(|a, b| a.id.cmp(&b.id));

        let chosen = match strategy {
            Strategy::RoundRobin => {
                let turn = self.rotation.fetch_add(1, Ordering::Relaxed);
                eligible[turn % eligible.len()]
            }
            Strategy::LeastBusy => min_by_key(&eligible, |w| w.active_tasks as f64),
            Strategy::Fastest => min_by_key(&eligible, |w| {
                w.latency_ms.unwrap_or(UNMEASURED_LATENCY_MS)
            }),
            Strategy::Intelligent => min_by_key(&eligible, |w| -intelligent_score(w)),
        };
        Ok(chosen.id.clone())
    }
}

/// Capability filter: accelerator, minimum cores, minimum memory.
///
/// A worker that has not reported resources yet only passes when the task
/// asks for nothing.
pub fn is_eligible(worker: &WorkerSnapshot, requirements: &Requirements) -> bool {
    let needs_report = requirements.accelerator
        || requirements.min_cores.is_some()
        || requirements.min_memory_mb.is_some();

    let Some(res) = &worker.resources else {
        return !needs_report;
    };
    if requirements.accelerator && !res.has_accelerator {
        return false;
    }
    if let Some(min) = requirements.min_cores {
        if res.core_count < min {
            return false;
        }
    }
    if let Some(min) = requirements.min_memory_mb {
        if res.memory_total_mb < min {
            return false;
        }
    }
    true
}

/// Weighted score used by `Strategy::Intelligent`. Higher is better.
///
/// `0.30*cpu_avail + 0.20*mem_avail + 0.30*latency_score + 0.20*load_score`
pub fn intelligent_score(worker: &WorkerSnapshot) -> f64 {
    let (cpu, mem) = worker
        .resources
        .as_ref()
        .map(|r| (r.cpu_percent, r.mem_percent))
        .unwrap_or((UNREPORTED_USAGE_PERCENT, UNREPORTED_USAGE_PERCENT));

    let cpu_avail = (100.0 - cpu).clamp(0.0, 100.0);
    let mem_avail = (100.0 - mem).clamp(0.0, 100.0);
    let latency = worker.latency_ms.unwrap_or(100.0).max(0.0);
    let latency_score = 100.0 - latency.min(100.0);
    let load_score = (100.0 - 10.0 * worker.active_tasks as f64).max(0.0);

    0.30 * cpu_avail + 0.20 * mem_avail + 0.30 * latency_score + 0.20 * load_score
}

/// First element with the strictly smallest key. Input is sorted by id, so
/// ties resolve to the lowest id.
fn min_by_key<'a, F>(sorted: &[&'a WorkerSnapshot], key: F) -> &'a WorkerSnapshot
where
    F: Fn(&WorkerSnapshot) -> f64,
{
    let mut best = sorted[0];
    let mut best_key = key(best);
    for w in &sorted[1..] {
        let k = key(w);
        if k < best_key {
            best = w;
            best_key = k;
        }
    }
    best
}
