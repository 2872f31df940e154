//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain optional
//! fields.

// Scheduling defaults

/// Default heartbeat timeout before a worker is marked inactive (30 seconds).
pub fn default_heartbeat_timeout_s() -> u64 {
    30
}

/// Default interval between a worker's outbound heartbeats (5 seconds).
pub fn default_heartbeat_interval_s() -> u64 {
    5
}

/// Default SLA deadline multiplier k (must stay within [1.5, 2.5]).
pub fn default_sla_multiplier() -> f64 {
    2.0
}

pub const SLA_MULTIPLIER_MIN: f64 = 1.5;
pub const SLA_MULTIPLIER_MAX: f64 = 2.5;

/// Default EMA learning rate λ for τ-store updates.
pub fn default_tau_ema_lambda() -> f64 {
    0.2
}

/// Default scheduler processor tick interval (1 second).
pub fn default_scheduler_tick_interval_s() -> u64 {
    1
}

/// Default telemetry inactivity-aging ticker interval (7 seconds, within the
/// 5-10s band named by the telemetry manager design).
pub fn default_telemetry_tick_interval_s() -> u64 {
    7
}

/// Default bound on each per-worker telemetry inbound channel.
pub fn default_telemetry_channel_capacity() -> usize {
    8
}

/// Default worker reconnection monitor interval (30 seconds).
pub fn default_reconnect_interval_s() -> u64 {
    30
}

/// Default timeout for the reconnection monitor's `MasterRegister` RPC.
pub fn default_reconnect_rpc_timeout_s() -> u64 {
    3
}

/// Default timeout for control RPCs to a worker (AssignTask, CancelTask).
pub fn default_control_rpc_timeout_s() -> u64 {
    5
}

/// Default grace period between graceful and forceful container cancellation.
pub fn default_cancel_grace_period_s() -> u64 {
    10
}

/// Default scheduler-parameter file reload interval (30 seconds).
pub fn default_param_reload_interval_s() -> u64 {
    30
}

/// Default θ/α/β/γ values used until a parameter file is loaded.
pub fn default_theta_cpu() -> f64 {
    0.5
}
pub fn default_theta_mem() -> f64 {
    0.5
}
pub fn default_theta_gpu() -> f64 {
    0.5
}
pub fn default_theta_load() -> f64 {
    1.0
}
pub fn default_alpha() -> f64 {
    1.0
}
pub fn default_beta() -> f64 {
    1.0
}
pub fn default_gamma() -> f64 {
    1.0
}

// Log / file streaming defaults

/// Default cap, in bytes, on a task's in-memory log ring buffer.
pub fn default_log_buffer_cap_bytes() -> usize {
    1 << 20
}

/// Marker prefixed to truncated log output.
pub fn default_log_truncation_marker() -> String {
    "[...truncated...]".to_string()
}

/// Default maximum chunk size for output-file uploads (1 MB).
pub fn default_upload_chunk_size_bytes() -> usize {
    1 << 20
}

/// Default pacing delay between synthetic log chunks replayed for a
/// terminal task (milliseconds).
pub fn default_log_replay_pacing_ms() -> u64 {
    50
}

// Storage / filesystem defaults

pub fn default_outputs_base_dir() -> String {
    "/var/lib/task-scheduler/outputs".to_string()
}

pub fn default_files_base_dir() -> String {
    "/var/lib/task-scheduler/files".to_string()
}

pub fn default_data_dir() -> String {
    "./data".to_string()
}

pub fn default_scheduler_params_path() -> String {
    "./config/scheduler_params.json".to_string()
}

// Persistence / cleanup defaults

/// Default WAL checkpoint interval (60 seconds).
pub fn default_wal_checkpoint_interval_s() -> u64 {
    60
}

/// Default retention for terminal tasks and results (7 days).
pub fn default_data_retention_days() -> u32 {
    7
}

/// Default periodic cleanup interval (24 hours).
pub fn default_cleanup_interval_s() -> u64 {
    86_400
}

/// Default SQLite busy timeout (5 seconds).
pub fn default_database_busy_timeout_s() -> u64 {
    5
}

// Server/network defaults

pub fn default_master_listen_address() -> String {
    "0.0.0.0:7000".to_string()
}

pub fn default_worker_listen_address() -> String {
    "0.0.0.0:7100".to_string()
}

/// Default graceful shutdown timeout (30 seconds).
pub fn default_graceful_shutdown_timeout_s() -> u64 {
    30
}

/// Default maximum concurrent tasks a single worker will accept.
pub fn default_max_concurrent_tasks() -> usize {
    16
}

/// Default request body size limit for the operator HTTP API (10 MB).
pub fn default_http_body_limit_bytes() -> usize {
    10 * 1024 * 1024
}

/// Default WebSocket per-client outbound queue bound.
pub fn default_ws_client_queue_capacity() -> usize {
    64
}
