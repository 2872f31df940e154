//! REST/WebSocket + inbound RPC surface for the master control plane.
//!
//! This module provides the HTTP endpoints workers use to register, report
//! telemetry and completions, and upload output files, plus the
//! operator-facing REST and WebSocket surface for submitting and inspecting
//! tasks. Mirrors the teacher's single `create_router(state)` + `AppState`
//! shape in `server/src/api.rs`, generalized from agent metrics ingestion to
//! worker/task scheduling.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path as AxumPath, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use shared::api::{
    headers, master_rpc_endpoints, operator_endpoints, ApiResponse, HealthResponse,
    HeartbeatRequest, HeartbeatResponse, RegisterWorkerApiRequest, RegisterWorkerRequest,
    RegisterWorkerResponse, ReportTaskCompletionRequest, ReportTaskCompletionResponse,
    SubmitTaskRequest, SubmitTaskResponse, TauView, TaskLogsResponse, TaskView,
    UploadOutputFilesChunk, UploadOutputFilesResponse, WorkerView,
};
use shared::model::{Task, TaskStatus, TaskType};
use shared::utils::{auto_task_name, current_timestamp, decode_base64, validate_id};
use shared::SchedulerError;
use tracing::{info, warn};

use crate::database::{db_files, db_results, MasterDatabase};
use crate::error::{ApiError, RpcError};
use crate::pipeline::AssignmentPipeline;
use crate::registry::WorkerRegistry;
use crate::streaming::{self, FileUploadAssembler};
use crate::tau_store::TauStore;
use crate::telemetry::TelemetryManager;

pub struct AppState {
    pub registry: Arc<WorkerRegistry>,
    pub queue: Arc<crate::queue::TaskQueue>,
    pub tau_store: Arc<TauStore>,
    pub telemetry: Arc<TelemetryManager>,
    pub pipeline: Arc<AssignmentPipeline>,
    pub db: Arc<tokio::sync::Mutex<MasterDatabase>>,
    pub uploads: Arc<FileUploadAssembler>,
    pub http: reqwest::Client,
    pub api_key: String,
    pub files_base_dir: String,
    pub log_replay_pacing_ms: u64,
    pub ws_client_queue_capacity: usize,
    pub default_sla_multiplier: f64,
}

type SharedState = Arc<AppState>;

pub fn create_router(state: SharedState, http_body_limit_bytes: usize) -> Router {
    Router::new()
        .route(operator_endpoints::HEALTH, get(health_check))
        .route(operator_endpoints::TELEMETRY, get(list_telemetry))
        .route(operator_endpoints::TELEMETRY_ONE, get(get_telemetry))
        .route(operator_endpoints::WORKERS, get(list_workers).post(pre_register_worker))
        .route(operator_endpoints::WORKERS_ONE, get(get_worker).delete(remove_worker))
        .route(operator_endpoints::TASKS, get(list_tasks).post(submit_task))
        .route(operator_endpoints::TASKS_ONE, get(get_task).delete(cancel_task))
        .route(operator_endpoints::TASK_LOGS, get(task_logs))
        .route(operator_endpoints::TAU, get(list_tau))
        .route(operator_endpoints::WS_TELEMETRY, get(ws_telemetry_all))
        .route(operator_endpoints::WS_TELEMETRY_ONE, get(ws_telemetry_one))
        .route(operator_endpoints::WS_TASK_LOGS, get(ws_task_logs))
        .route(master_rpc_endpoints::REGISTER_WORKER, post(register_worker))
        .route(master_rpc_endpoints::HEARTBEAT, post(heartbeat))
        .route(master_rpc_endpoints::REPORT_TASK_COMPLETION, post(report_task_completion))
        .route(master_rpc_endpoints::UPLOAD_OUTPUT_FILES, post(upload_output_files))
        .layer(DefaultBodyLimit::max(http_body_limit_bytes))
        .with_state(state)
}

/// Constant-time API key check, mirroring the teacher's
/// `server/src/api.rs::validate_api_key`. A blank configured key disables
/// the check (used in tests/dev).
fn check_api_key(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    use subtle::ConstantTimeEq;
    if expected.is_empty() {
        return Ok(());
    }
    let provided = headers
        .get(headers::API_KEY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let matches = provided.len() == expected.len() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()));
    if matches {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("invalid or missing API key".to_string()))
    }
}

fn check_rpc_api_key(headers: &HeaderMap, expected: &str) -> Result<(), RpcError> {
    check_api_key(headers, expected).map_err(|_| RpcError::Unauthorized("invalid or missing API key".to_string()))
}

async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let queued = state.queue.list_by_status(Some(TaskStatus::Pending)).await.len();
    let running = state.queue.list_by_status(Some(TaskStatus::Running)).await.len();
    Json(ApiResponse::success(HealthResponse {
        status: "ok".to_string(),
        worker_count: state.registry.total_count(),
        active_worker_count: state.registry.active_count(),
        queued_tasks: queued,
        running_tasks: running,
    }))
}

// --- operator: workers ---

async fn list_workers(
    headers: HeaderMap,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&headers, &state.api_key)?;
    let workers: Vec<WorkerView> = state.registry.snapshot_all().into_iter().map(|worker| WorkerView { worker }).collect();
    Ok(Json(ApiResponse::success(workers)))
}

async fn get_worker(
    headers: HeaderMap,
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&headers, &state.api_key)?;
    let worker = state
        .registry
        .snapshot(&id)
        .ok_or_else(|| ApiError::NotFound(format!("worker '{id}' not found")))?;
    Ok(Json(ApiResponse::success(WorkerView { worker })))
}

async fn pre_register_worker(
    headers: HeaderMap,
    State(state): State<SharedState>,
    Json(req): Json<RegisterWorkerApiRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&headers, &state.api_key)?;
    validate_id("worker id", &req.id).map_err(|e| ApiError::Validation(e.to_string()))?;
    let worker = state.registry.pre_register(&req.id, &req.address)?;
    Ok(Json(ApiResponse::success(WorkerView { worker })))
}

async fn remove_worker(
    headers: HeaderMap,
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&headers, &state.api_key)?;
    state.pipeline.fail_running_tasks_for_worker(&id).await?;
    state.registry.unregister(&id).await?;
    Ok(Json(ApiResponse::success(())))
}

// --- operator: tasks ---

async fn list_tasks(
    headers: HeaderMap,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&headers, &state.api_key)?;
    let tasks = state.queue.list_by_status(None).await;
    Ok(Json(ApiResponse::success(tasks)))
}

async fn get_task(
    headers: HeaderMap,
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&headers, &state.api_key)?;
    let task = state.queue.get(&id).await.ok_or_else(|| ApiError::NotFound(format!("task '{id}' not found")))?;
    let result = {
        let mut db = state.db.lock().await;
        let conn = db.workers()?;
        db_results::get(conn, &id)?
    };
    Ok(Json(ApiResponse::success(TaskView { task, result })))
}

async fn submit_task(
    headers: HeaderMap,
    State(state): State<SharedState>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&headers, &state.api_key)?;
    if req.user.trim().is_empty() {
        return Err(ApiError::Validation("user cannot be empty".to_string()));
    }
    if req.image.trim().is_empty() {
        return Err(ApiError::Validation("image cannot be empty".to_string()));
    }
    req.resources.validate().map_err(|e| ApiError::Validation(e.to_string()))?;

    let task_type = req
        .tag
        .as_deref()
        .map(TaskType::parse_or_mixed)
        .unwrap_or_else(|| TaskType::infer(&req.resources));
    let tau_at_submission = state.tau_store.get(task_type);
    let sla_multiplier = req.k.unwrap_or(state.default_sla_multiplier);
    if !(shared::defaults::SLA_MULTIPLIER_MIN..=shared::defaults::SLA_MULTIPLIER_MAX).contains(&sla_multiplier) {
        return Err(ApiError::Validation(format!(
            "sla multiplier {sla_multiplier} out of range [{}, {}]",
            shared::defaults::SLA_MULTIPLIER_MIN,
            shared::defaults::SLA_MULTIPLIER_MAX
        )));
    }

    let submitted_at = current_timestamp();
    let name = req.name.clone().unwrap_or_else(|| auto_task_name(&req.image, submitted_at));
    let task_id = generate_task_id(&req.user, &name, submitted_at);

    let task = Task {
        id: task_id.clone(),
        user: req.user,
        name,
        image: req.image,
        command: req.command,
        resources: req.resources,
        status: TaskStatus::Pending,
        submitted_at,
        assigned_at: None,
        started_at: None,
        completed_at: None,
        assigned_worker: None,
        task_type,
        tau_at_submission,
        sla_multiplier,
    };

    state.queue.submit(task).await?;
    info!(task_id = %task_id, "task submitted");
    Ok(Json(ApiResponse::success(SubmitTaskResponse { task_id })))
}

fn generate_task_id(user: &str, name: &str, submitted_at: u64) -> String {
    use rand::Rng;
    let nonce: u64 = rand::thread_rng().gen();
    let digest = shared::utils::calculate_string_checksum(&format!("{user}:{name}:{submitted_at}:{nonce}"));
    format!("task-{}", &digest[..16])
}

async fn cancel_task(
    headers: HeaderMap,
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&headers, &state.api_key)?;
    let found = state.pipeline.cancel(&id).await?;
    if !found {
        return Err(ApiError::NotFound(format!("task '{id}' not found")));
    }
    Ok(Json(ApiResponse::success(())))
}

// --- operator: telemetry ---

async fn list_telemetry(
    headers: HeaderMap,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&headers, &state.api_key)?;
    Ok(Json(ApiResponse::success(state.telemetry.snapshot_all())))
}

async fn get_telemetry(
    headers: HeaderMap,
    State(state): State<SharedState>,
    AxumPath(worker_id): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&headers, &state.api_key)?;
    let snapshot = state
        .telemetry
        .snapshot(&worker_id)
        .ok_or_else(|| ApiError::NotFound(format!("no telemetry for worker '{worker_id}'")))?;
    Ok(Json(ApiResponse::success(snapshot)))
}

async fn list_tau(State(state): State<SharedState>) -> impl IntoResponse {
    let views: Vec<TauView> = state
        .tau_store
        .get_all()
        .into_iter()
        .map(|(task_type, tau_seconds)| TauView { task_type, tau_seconds })
        .collect();
    Json(ApiResponse::success(views))
}

// --- operator: log retrieval ---

async fn task_logs(
    headers: HeaderMap,
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, ApiError> {
    check_api_key(&headers, &state.api_key)?;
    let task = state.queue.get(&id).await.ok_or_else(|| ApiError::NotFound(format!("task '{id}' not found")))?;

    if task.status == TaskStatus::Running {
        let worker_address = task
            .assigned_worker
            .as_deref()
            .and_then(|id| state.registry.snapshot(id))
            .map(|w| w.address)
            .ok_or_else(|| ApiError::Internal("running task has no reachable worker".to_string()))?;
        let stream = streaming::relay_running_logs(&state.http, &state.api_key, &worker_address, &id)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let body = Body::from_stream(stream.map(|item| {
            item.map(|chunk| bytes::Bytes::from(serde_json::to_vec(&chunk).unwrap_or_default()))
                .map_err(std::io::Error::other)
        }));
        return Ok(body.into_response());
    }

    let result = {
        let mut db = state.db.lock().await;
        let conn = db.workers()?;
        db_results::get(conn, &id)?
    };
    let result = streaming::require_terminal_result(task.status, result)?;
    Ok(Json(ApiResponse::success(TaskLogsResponse {
        task_id: id,
        logs: result.logs,
        truncated: result.logs_truncated,
        status: result.status,
    }))
    .into_response())
}

// --- WebSocket surfaces ---

async fn ws_telemetry_all(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_telemetry_ws(socket, state, None))
}

async fn ws_telemetry_one(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    AxumPath(worker_id): AxumPath<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_telemetry_ws(socket, state, Some(worker_id)))
}

async fn handle_telemetry_ws(socket: WebSocket, state: SharedState, worker_id_filter: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.telemetry.subscribe();
    let (queue_tx, mut queue_rx) = tokio::sync::mpsc::channel(state.ws_client_queue_capacity);

    let forward_task = tokio::spawn(async move {
        while let Some(msg) = queue_rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let drain_task = tokio::spawn(async move { while receiver.next().await.is_some() {} });

    loop {
        match rx.recv().await {
            Ok(snapshot) => {
                if let Some(filter) = &worker_id_filter {
                    if &snapshot.worker_id != filter {
                        continue;
                    }
                }
                let Ok(text) = serde_json::to_string(&snapshot) else { continue };
                // Non-blocking: a slow client drops updates rather than
                // stalling the broadcast fan-out for everyone else.
                let _ = queue_tx.try_send(Message::Text(text.into()));
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    drop(queue_tx);
    let _ = forward_task.await;
    drain_task.abort();
}

async fn ws_task_logs(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_task_logs_ws(socket, state, id))
}

async fn handle_task_logs_ws(socket: WebSocket, state: SharedState, task_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let drain_task = tokio::spawn(async move { while receiver.next().await.is_some() {} });

    let Some(task) = state.queue.get(&task_id).await else {
        let _ = sender.send(Message::Text("task not found".into())).await;
        drain_task.abort();
        return;
    };

    let mut log_stream = if task.status == TaskStatus::Running {
        let worker_address = task.assigned_worker.as_deref().and_then(|id| state.registry.snapshot(id)).map(|w| w.address);
        match worker_address {
            Some(addr) => match streaming::relay_running_logs(&state.http, &state.api_key, &addr, &task_id).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = sender.send(Message::Text(format!("error: {e}").into())).await;
                    drain_task.abort();
                    return;
                }
            },
            None => {
                let _ = sender.send(Message::Text("running task has no reachable worker".into())).await;
                drain_task.abort();
                return;
            }
        }
    } else {
        let result = {
            let mut db = state.db.lock().await;
            match db.workers().and_then(|conn| db_results::get(conn, &task_id).map_err(Into::into)) {
                Ok(r) => r,
                Err(e) => {
                    let _ = sender.send(Message::Text(format!("error: {e}").into())).await;
                    drain_task.abort();
                    return;
                }
            }
        };
        match result {
            Some(r) => streaming::replay_terminal_logs(r, state.log_replay_pacing_ms),
            None => {
                let _ = sender.send(Message::Text("no stored logs for this task".into())).await;
                drain_task.abort();
                return;
            }
        }
    };

    while let Some(item) = log_stream.next().await {
        match item {
            Ok(chunk) => {
                let Ok(text) = serde_json::to_string(&chunk) else { continue };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    drain_task.abort();
}

// --- inbound worker -> master RPCs ---

async fn register_worker(
    headers: HeaderMap,
    State(state): State<SharedState>,
    Json(req): Json<RegisterWorkerRequest>,
) -> Result<impl IntoResponse, RpcError> {
    check_rpc_api_key(&headers, &state.api_key)?;
    match state.registry.register_worker(&req.id, &req.address, req.total) {
        Ok(_) => {
            info!(worker_id = %req.id, address = %req.address, "worker registered");
            Ok(Json(RegisterWorkerResponse { accepted: true, reason: None }))
        }
        Err(e) => {
            warn!(worker_id = %req.id, error = ?e, "worker registration rejected");
            Ok(Json(RegisterWorkerResponse { accepted: false, reason: Some(e.to_string()) }))
        }
    }
}

async fn heartbeat(
    headers: HeaderMap,
    State(state): State<SharedState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, RpcError> {
    check_rpc_api_key(&headers, &state.api_key)?;
    state
        .registry
        .heartbeat(&req.worker_id, &req.usage)
        .map_err(|e| RpcError::NotFound(e.to_string()))?;
    state.telemetry.ingest(&req.worker_id, req.usage, req.running_task_ids);
    state.queue.notify.notify_one();
    Ok(Json(HeartbeatResponse { acknowledged: true }))
}

async fn report_task_completion(
    headers: HeaderMap,
    State(state): State<SharedState>,
    Json(req): Json<ReportTaskCompletionRequest>,
) -> Result<impl IntoResponse, RpcError> {
    check_rpc_api_key(&headers, &state.api_key)?;
    state
        .pipeline
        .report_completion(&req.task_id, &req.worker_id, req.status, req.logs, req.logs_truncated, req.exit_code)
        .await
        .map_err(|e| match e.downcast_ref::<SchedulerError>() {
            Some(SchedulerError::Validation(m)) => RpcError::Rejected(m.clone()),
            Some(SchedulerError::NotFound(m)) => RpcError::NotFound(m.clone()),
            _ => RpcError::Rejected(e.to_string()),
        })?;
    Ok(Json(ReportTaskCompletionResponse { accepted: true }))
}

async fn upload_output_files(
    headers: HeaderMap,
    State(state): State<SharedState>,
    Json(req): Json<UploadOutputFilesChunk>,
) -> Result<impl IntoResponse, RpcError> {
    check_rpc_api_key(&headers, &state.api_key)?;
    let bytes = decode_base64(&req.chunk_base64).map_err(|e| RpcError::Rejected(e.to_string()))?;
    let accepted = bytes.len() as u64;

    if let Some(full) = state.uploads.ingest(&req.task_id, &bytes, req.is_last) {
        let base_dir = state.files_base_dir.clone();
        let task_id = req.task_id.clone();
        let user = req.user.clone();
        let task_name = req.task_name.clone();
        let submitted_at = req.submitted_at;
        let db = state.db.clone();
        // Extraction and tar decoding can take a moment; detach so the
        // RPC response isn't held hostage on a large upload.
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                streaming::extract_output_tar(&full, std::path::Path::new(&base_dir), &user, &task_name, submitted_at, &task_id)
            })
            .await;
            match result {
                Ok(Ok(meta)) => {
                    let mut db = db.lock().await;
                    if let Ok(conn) = db.workers() {
                        if let Err(e) = db_files::insert(conn, &meta) {
                            warn!(task_id = %meta.task_id, error = ?e, "failed to persist file metadata");
                        }
                    }
                }
                Ok(Err(e)) => warn!(error = ?e, "failed to extract output file upload"),
                Err(e) => warn!(error = ?e, "output extraction task panicked"),
            }
        });
    }

    Ok(Json(UploadOutputFilesResponse { accepted_bytes: accepted }))
}
