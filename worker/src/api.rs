//! Inbound RPC surface the master calls into (§6): `AssignTask`,
//! `CancelTask`, `StreamTaskLogs`, `MasterRegister`.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path as AxumPath, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use shared::api::{
    worker_endpoints, headers, AssignTaskOutcome, AssignTaskRequest, AssignTaskResponse,
    CancelTaskResponse, LogChunk, MasterRegisterRequest, MasterRegisterResponse,
};
use shared::model::{ResourceVector, TaskStatus};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::error::RpcError;
use crate::executor::Executor;
use crate::retry::RetryDispatcher;
use crate::rpc_client::RpcClient;
use crate::state::{RunningTask, WorkerState};

pub struct AppState {
    pub worker_id: String,
    pub worker_address: String,
    pub api_key: String,
    pub max_concurrent_tasks: usize,
    pub log_buffer_cap_bytes: usize,
    pub log_truncation_marker: String,
    pub total: ResourceVector,
    pub worker_state: Arc<WorkerState>,
    pub executor: Arc<Executor>,
    pub rpc: Arc<RpcClient>,
    pub retry: Arc<RetryDispatcher>,
}

type SharedState = Arc<AppState>;

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route(worker_endpoints::ASSIGN_TASK, post(assign_task))
        .route(worker_endpoints::CANCEL_TASK, post(cancel_task))
        .route(worker_endpoints::STREAM_TASK_LOGS, get(stream_task_logs))
        .route(worker_endpoints::MASTER_REGISTER, post(master_register))
        .with_state(state)
}

fn check_api_key(headers_map: &HeaderMap, expected: &str) -> Result<(), RpcError> {
    use subtle::ConstantTimeEq;
    if expected.is_empty() {
        return Ok(());
    }
    let provided = headers_map
        .get(headers::API_KEY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let matches = provided.len() == expected.len() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()));
    if matches {
        Ok(())
    } else {
        Err(RpcError::Unauthorized("invalid or missing API key".to_string()))
    }
}

async fn assign_task(
    headers_map: HeaderMap,
    State(state): State<SharedState>,
    Json(req): Json<AssignTaskRequest>,
) -> Result<impl IntoResponse, RpcError> {
    check_api_key(&headers_map, &state.api_key)?;
    let task = req.task;

    if state.worker_state.len() >= state.max_concurrent_tasks {
        info!(task_id = %task.id, "rejecting task assignment: worker at capacity");
        return Ok(Json(AssignTaskResponse {
            outcome: AssignTaskOutcome::Rejected,
            reason: Some("worker at capacity".to_string()),
        }));
    }

    let running = RunningTask::new(task.resources, state.log_buffer_cap_bytes, state.log_truncation_marker.clone());
    state.worker_state.insert(task.id.clone(), Arc::clone(&running));

    let executor = Arc::clone(&state.executor);
    let rpc = Arc::clone(&state.rpc);
    let retry = Arc::clone(&state.retry);
    let worker_id = state.worker_id.clone();
    let worker_state = Arc::clone(&state.worker_state);
    let task_id = task.id.clone();

    // Detached from this handler's request scope on purpose: execution is
    // rooted at the worker process's own lifetime, never the AssignTask
    // request's (see `executor` module docs — violating this cancels the
    // container the instant this response is written).
    tokio::spawn(async move {
        executor.run_task(task, running, rpc, retry, worker_id, worker_state).await;
    });

    info!(task_id, "task accepted for execution");
    Ok(Json(AssignTaskResponse { outcome: AssignTaskOutcome::Accepted, reason: None }))
}

async fn cancel_task(
    headers_map: HeaderMap,
    State(state): State<SharedState>,
    AxumPath(task_id): AxumPath<String>,
) -> Result<impl IntoResponse, RpcError> {
    check_api_key(&headers_map, &state.api_key)?;
    match state.worker_state.get(&task_id) {
        Some(running) => {
            running.request_cancel();
            info!(task_id, "cancellation requested");
            Ok(Json(CancelTaskResponse { found: true }))
        }
        None => Ok(Json(CancelTaskResponse { found: false })),
    }
}

async fn master_register(
    headers_map: HeaderMap,
    State(state): State<SharedState>,
    Json(req): Json<MasterRegisterRequest>,
) -> Result<impl IntoResponse, RpcError> {
    check_api_key(&headers_map, &state.api_key)?;
    info!(master_id = %req.master_id, address = %req.address, "master registration received, re-registering current capacity");

    let rpc = Arc::clone(&state.rpc);
    let worker_id = state.worker_id.clone();
    let worker_address = state.worker_address.clone();
    let total = state.total;
    tokio::spawn(async move {
        if let Err(e) = rpc.register_worker(&worker_id, &worker_address, total).await {
            warn!(error = ?e, "failed to re-register with master after MasterRegister");
        }
    });

    Ok(Json(MasterRegisterResponse { acknowledged: true }))
}

async fn stream_task_logs(
    headers_map: HeaderMap,
    State(state): State<SharedState>,
    AxumPath(task_id): AxumPath<String>,
) -> Result<Response, RpcError> {
    check_api_key(&headers_map, &state.api_key)?;
    let running = state
        .worker_state
        .get(&task_id)
        .ok_or_else(|| RpcError::NotFound(format!("task '{task_id}' not running on this worker")))?;

    let stream = follow_log_chunks(running);
    let body = Body::from_stream(stream.map(|line| Ok::<Bytes, std::io::Error>(Bytes::from(line))));
    Ok(body.into_response())
}

enum FollowState {
    Initial(Option<String>, broadcast::Receiver<Bytes>, watch::Receiver<Option<TaskStatus>>),
    Live(broadcast::Receiver<Bytes>, watch::Receiver<Option<TaskStatus>>),
    Done,
}

/// Replays the task's current log buffer once, then follows new output and
/// the terminal-status signal until the container finishes (§4.7).
fn follow_log_chunks(running: Arc<RunningTask>) -> impl Stream<Item = String> {
    let (initial_logs, _truncated) = running.logs.snapshot();
    let log_rx = running.log_tx.subscribe();
    let terminal_rx = running.terminal_rx();
    let initial = if initial_logs.is_empty() { None } else { Some(initial_logs) };

    stream::unfold(FollowState::Initial(initial, log_rx, terminal_rx), |state| async move {
        match state {
            FollowState::Initial(Some(text), log_rx, terminal_rx) => {
                let chunk = LogChunk { bytes: text, is_complete: false, terminal_status: None };
                Some((encode(&chunk), FollowState::Initial(None, log_rx, terminal_rx)))
            }
            FollowState::Initial(None, log_rx, terminal_rx) => {
                drive(log_rx, terminal_rx).await
            }
            FollowState::Live(log_rx, terminal_rx) => drive(log_rx, terminal_rx).await,
            FollowState::Done => None,
        }
    })
}

async fn drive(
    mut log_rx: broadcast::Receiver<Bytes>,
    mut terminal_rx: watch::Receiver<Option<TaskStatus>>,
) -> Option<(String, FollowState)> {
    if let Some(status) = *terminal_rx.borrow() {
        let chunk = LogChunk { bytes: String::new(), is_complete: true, terminal_status: Some(status) };
        return Some((encode(&chunk), FollowState::Done));
    }
    tokio::select! {
        biased;
        received = log_rx.recv() => match received {
            Ok(bytes) => {
                let chunk = LogChunk {
                    bytes: String::from_utf8_lossy(&bytes).into_owned(),
                    is_complete: false,
                    terminal_status: None,
                };
                Some((encode(&chunk), FollowState::Live(log_rx, terminal_rx)))
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                Some((String::new(), FollowState::Live(log_rx, terminal_rx)))
            }
            Err(broadcast::error::RecvError::Closed) => {
                let status = terminal_rx.borrow().unwrap_or(TaskStatus::Failed);
                let chunk = LogChunk { bytes: String::new(), is_complete: true, terminal_status: Some(status) };
                Some((encode(&chunk), FollowState::Done))
            }
        },
        _ = terminal_rx.changed() => {
            let status = terminal_rx.borrow().unwrap_or(TaskStatus::Failed);
            let chunk = LogChunk { bytes: String::new(), is_complete: true, terminal_status: Some(status) };
            Some((encode(&chunk), FollowState::Done))
        }
    }
}

fn encode(chunk: &LogChunk) -> String {
    format!("{}\n", serde_json::to_string(chunk).unwrap_or_default())
}
