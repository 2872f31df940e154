//! Wire types for the master↔worker RPC surface and the operator-facing
//! REST API.
//!
//! HTTP/JSON is the chosen realization of the RPC surface (the binary
//! format/IDL is an implementation choice); these structs are what both
//! sides serialize.

use crate::model::{ResourceVector, Task, TaskResult, TaskStatus, TaskType, UsageVector, Worker};
use serde::{Deserialize, Serialize};

/// Generic API response envelope, used on the operator-facing REST surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(message),
        }
    }
}

// --- worker -> master RPCs ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub id: String,
    pub address: String,
    pub total: ResourceVector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerResponse {
    pub accepted: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    pub usage: UsageVector,
    pub running_task_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportTaskCompletionRequest {
    pub task_id: String,
    pub worker_id: String,
    pub status: TaskStatus,
    pub logs: String,
    pub logs_truncated: bool,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportTaskCompletionResponse {
    pub accepted: bool,
}

/// One chunk of a tarred `/output` directory upload. Chunks are capped at
/// `default_upload_chunk_size_bytes` (≤ 1 MB) and base64-encoded on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutputFilesChunk {
    pub task_id: String,
    pub user: String,
    pub task_name: String,
    pub submitted_at: u64,
    pub chunk_base64: String,
    pub is_last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutputFilesResponse {
    pub accepted_bytes: u64,
}

// --- master -> worker RPCs ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignTaskRequest {
    pub task: Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignTaskOutcome {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignTaskResponse {
    pub outcome: AssignTaskOutcome,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTaskResponse {
    pub found: bool,
}

/// One chunk of a running container's combined stdout/stderr stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub bytes: String,
    pub is_complete: bool,
    pub terminal_status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterRegisterRequest {
    pub master_id: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterRegisterResponse {
    pub acknowledged: bool,
}

// --- operator REST DTOs ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerApiRequest {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub user: String,
    pub image: String,
    pub command: Option<String>,
    #[serde(default)]
    pub resources: ResourceVector,
    pub tag: Option<String>,
    pub k: Option<f64>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub worker_id: String,
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub gpu_usage: f64,
    pub running_tasks: Vec<String>,
    pub last_update: u64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogsResponse {
    pub task_id: String,
    pub logs: String,
    pub truncated: bool,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub worker_count: usize,
    pub active_worker_count: usize,
    pub queued_tasks: usize,
    pub running_tasks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerView {
    pub worker: Worker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub task: Task,
    pub result: Option<TaskResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TauView {
    pub task_type: TaskType,
    pub tau_seconds: f64,
}

/// HTTP headers used on the master↔worker RPC surface.
pub mod headers {
    pub const API_KEY: &str = "X-API-Key";
    pub const WORKER_ID: &str = "X-Worker-Id";
    pub const CONTENT_TYPE: &str = "Content-Type";
}

/// Worker-side RPC endpoint paths (inbound on the worker's own router).
pub mod worker_endpoints {
    pub const ASSIGN_TASK: &str = "/rpc/assign_task";
    pub const CANCEL_TASK: &str = "/rpc/cancel_task/{task_id}";
    pub const STREAM_TASK_LOGS: &str = "/rpc/stream_logs/{task_id}";
    pub const MASTER_REGISTER: &str = "/rpc/master_register";
}

/// Master-side RPC endpoint paths (inbound on the master's router, called by
/// workers).
pub mod master_rpc_endpoints {
    pub const REGISTER_WORKER: &str = "/rpc/register_worker";
    pub const HEARTBEAT: &str = "/rpc/heartbeat";
    pub const REPORT_TASK_COMPLETION: &str = "/rpc/report_completion";
    pub const UPLOAD_OUTPUT_FILES: &str = "/rpc/upload_output_files";
}

/// Operator-facing REST endpoint paths on the master.
pub mod operator_endpoints {
    pub const HEALTH: &str = "/health";
    pub const TELEMETRY: &str = "/telemetry";
    pub const TELEMETRY_ONE: &str = "/telemetry/{worker_id}";
    pub const WORKERS: &str = "/api/workers";
    pub const WORKERS_ONE: &str = "/api/workers/{id}";
    pub const TASKS: &str = "/api/tasks";
    pub const TASKS_ONE: &str = "/api/tasks/{id}";
    pub const TASK_LOGS: &str = "/api/tasks/{id}/logs";
    pub const TAU: &str = "/api/tau";
    pub const WS_TELEMETRY: &str = "/ws/telemetry";
    pub const WS_TELEMETRY_ONE: &str = "/ws/telemetry/{worker_id}";
    pub const WS_TASK_LOGS: &str = "/ws/tasks/{id}/logs";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_response_helpers() {
        let ok: ApiResponse<u32> = ApiResponse::success(42);
        assert_eq!(ok.status, "success");
        assert_eq!(ok.data, Some(42));

        let err: ApiResponse<u32> = ApiResponse::error("bad".to_string());
        assert_eq!(err.status, "error");
        assert_eq!(err.error.as_deref(), Some("bad"));
    }

    #[test]
    fn assign_task_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&AssignTaskOutcome::Accepted).unwrap();
        assert_eq!(json, "\"accepted\"");
    }
}
