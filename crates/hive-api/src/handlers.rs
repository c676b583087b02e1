//! HTTP API handlers — exposes master state as JSON.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use hive_core::task::{Requirements, Strategy, TaskPayload};
use hive_services::{
    new_task_id, Dispatcher, QueueError, TaskCounts, TaskRecord, TaskSpec, TaskStatus,
    WorkerSnapshot,
};

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Dispatcher,
    pub node_id: String,
    pub started: Instant,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn queue_error(e: QueueError) -> (StatusCode, String) {
    let code = match e {
        QueueError::Duplicate(_) | QueueError::AlreadyTerminal(..) => StatusCode::CONFLICT,
        QueueError::NotFound(_) => StatusCode::NOT_FOUND,
        QueueError::InvalidTimeout(..) => StatusCode::BAD_REQUEST,
    };
    (code, e.to_string())
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub uptime_secs: u64,
    pub workers_connected: usize,
    pub workers_known: usize,
    pub default_strategy: Strategy,
    pub tasks: TaskCountsInfo,
}

#[derive(Serialize, Deserialize)]
pub struct TaskCountsInfo {
    pub pending: usize,
    pub dispatched: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

impl From<TaskCounts> for TaskCountsInfo {
    fn from(c: TaskCounts) -> Self {
        Self {
            pending: c.pending,
            dispatched: c.dispatched,
            running: c.running,
            completed: c.completed,
            failed: c.failed,
            cancelled: c.cancelled,
            total: c.total(),
        }
    }
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let registry = state.dispatcher.registry();
    Json(StatusResponse {
        node_id: state.node_id.clone(),
        uptime_secs: state.started.elapsed().as_secs(),
        workers_connected: registry.list_connected().len(),
        workers_known: registry.len(),
        default_strategy: state.dispatcher.settings().default_strategy,
        tasks: state.dispatcher.counts().into(),
    })
}

// ── /workers ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct WorkersResponse {
    pub workers: Vec<WorkerSnapshot>,
}

pub async fn handle_workers(State(state): State<ApiState>) -> Json<WorkersResponse> {
    Json(WorkersResponse {
        workers: state.dispatcher.registry().list_all(),
    })
}

// ── /tasks ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct StatusFilter {
    pub status: Option<String>,
}

fn parse_filter(filter: &StatusFilter) -> Result<Option<TaskStatus>, (StatusCode, String)> {
    filter
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(|e| (StatusCode::BAD_REQUEST, e))
}

#[derive(Serialize)]
pub struct TasksResponse {
    pub tasks: Vec<TaskRecord>,
}

pub async fn handle_tasks(
    State(state): State<ApiState>,
    Query(filter): Query<StatusFilter>,
) -> ApiResult<TasksResponse> {
    let wanted = parse_filter(&filter)?;
    let tasks = state
        .dispatcher
        .tasks()
        .into_iter()
        .filter(|t| wanted.map_or(true, |s| t.status == s))
        .collect();
    Ok(Json(TasksResponse { tasks }))
}

pub async fn handle_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<TaskRecord> {
    state
        .dispatcher
        .task(&id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("task {id} not found")))
}

#[derive(Deserialize)]
pub struct SubmitRequest {
    /// Generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub task_type: String,
    pub payload: TaskPayload,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: String,
}

pub async fn handle_submit(
    State(state): State<ApiState>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<SubmitResponse> {
    if req.task_type.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "task_type is required".to_string()));
    }
    let spec = TaskSpec {
        id: req.id.unwrap_or_else(|| new_task_id(&req.task_type)),
        task_type: req.task_type,
        payload: req.payload,
        input: req.input,
        requirements: req.requirements,
        strategy: req.strategy,
        timeout_secs: req.timeout_secs,
    };
    let task_id = state.dispatcher.submit(spec).map_err(queue_error)?;
    Ok(Json(SubmitResponse { task_id }))
}

#[derive(Serialize, Deserialize)]
pub struct CancelResponse {
    pub task_id: String,
    pub previous: TaskStatus,
}

pub async fn handle_cancel(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<CancelResponse> {
    let previous = state.dispatcher.cancel(&id).map_err(queue_error)?;
    Ok(Json(CancelResponse { task_id: id, previous }))
}

#[derive(Serialize, Deserialize)]
pub struct PurgeResponse {
    pub removed: usize,
}

pub async fn handle_purge(
    State(state): State<ApiState>,
    Query(filter): Query<StatusFilter>,
) -> ApiResult<PurgeResponse> {
    let status = parse_filter(&filter)?;
    if status.is_some_and(|s| !s.is_terminal()) {
        return Err((
            StatusCode::BAD_REQUEST,
            "only terminal tasks can be purged".to_string(),
        ));
    }
    Ok(Json(PurgeResponse {
        removed: state.dispatcher.purge(status),
    }))
}
