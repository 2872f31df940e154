//! Configuration types and validation shared by the master and worker
//! binaries.
//!
//! Each binary owns a TOML file (`master.toml` / `worker.toml`) deserialized
//! into the structs below; every optional field carries a
//! `#[serde(default = "...")]` pointing at `crate::defaults`.

use crate::defaults::*;
use serde::{Deserialize, Serialize};

/// Configuration for the master control plane, loaded from `master.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MasterConfig {
    /// Address the operator HTTP/WebSocket API binds to.
    #[serde(default = "default_master_listen_address")]
    pub listen_address: String,
    /// Directory holding the SQLite database and scheduler parameter file.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Base directory output files are extracted under.
    #[serde(default = "default_files_base_dir")]
    pub files_base_dir: String,
    /// Path to the θ/α/β/γ scheduler parameter JSON file.
    #[serde(default = "default_scheduler_params_path")]
    pub scheduler_params_path: String,
    /// Whether an unknown worker id is rejected on `RegisterWorker`
    /// (§4.2, §9: ids are the sole key for worker identity).
    #[serde(default)]
    pub require_pre_registration: bool,
    /// Operator API key; empty disables the check (used in tests/dev).
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_heartbeat_timeout_s")]
    pub heartbeat_timeout_s: u64,
    #[serde(default = "default_sla_multiplier")]
    pub default_sla_multiplier: f64,
    #[serde(default = "default_tau_ema_lambda")]
    pub tau_ema_lambda: f64,
    #[serde(default = "default_scheduler_tick_interval_s")]
    pub scheduler_tick_interval_s: u64,
    #[serde(default = "default_telemetry_tick_interval_s")]
    pub telemetry_tick_interval_s: u64,
    #[serde(default = "default_telemetry_channel_capacity")]
    pub telemetry_channel_capacity: usize,
    #[serde(default = "default_reconnect_interval_s")]
    pub reconnect_interval_s: u64,
    #[serde(default = "default_reconnect_rpc_timeout_s")]
    pub reconnect_rpc_timeout_s: u64,
    #[serde(default = "default_control_rpc_timeout_s")]
    pub control_rpc_timeout_s: u64,
    #[serde(default = "default_cancel_grace_period_s")]
    pub cancel_grace_period_s: u64,
    #[serde(default = "default_param_reload_interval_s")]
    pub param_reload_interval_s: u64,
    #[serde(default = "default_log_replay_pacing_ms")]
    pub log_replay_pacing_ms: u64,
    #[serde(default = "default_wal_checkpoint_interval_s")]
    pub wal_checkpoint_interval_s: u64,
    #[serde(default = "default_data_retention_days")]
    pub data_retention_days: u32,
    #[serde(default = "default_cleanup_interval_s")]
    pub cleanup_interval_s: u64,
    #[serde(default = "default_database_busy_timeout_s")]
    pub database_busy_timeout_s: u64,
    #[serde(default = "default_graceful_shutdown_timeout_s")]
    pub graceful_shutdown_timeout_s: u64,
    #[serde(default = "default_http_body_limit_bytes")]
    pub http_body_limit_bytes: usize,
    #[serde(default = "default_ws_client_queue_capacity")]
    pub ws_client_queue_capacity: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty TOML populates every default field")
    }
}

impl MasterConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if !(SLA_MULTIPLIER_MIN..=SLA_MULTIPLIER_MAX).contains(&self.default_sla_multiplier) {
            return Err(crate::SchedulerError::Config(format!(
                "default_sla_multiplier {} out of range [{}, {}]",
                self.default_sla_multiplier, SLA_MULTIPLIER_MIN, SLA_MULTIPLIER_MAX
            ))
            .into());
        }
        if !(0.0..=1.0).contains(&self.tau_ema_lambda) {
            return Err(crate::SchedulerError::Config(format!(
                "tau_ema_lambda {} out of range [0, 1]",
                self.tau_ema_lambda
            ))
            .into());
        }
        if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(crate::SchedulerError::Config(format!(
                "listen_address '{}' is not a valid socket address",
                self.listen_address
            ))
            .into());
        }
        Ok(())
    }
}

/// Configuration for the worker execution agent, loaded from `worker.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Unique id this worker registers under.
    pub worker_id: String,
    /// Address the master should use to reach this worker's RPC surface.
    pub worker_address: String,
    /// Address this worker's own inbound RPC router binds to.
    #[serde(default = "default_worker_listen_address")]
    pub listen_address: String,
    /// Base URL of the master's RPC surface.
    #[serde(default)]
    pub master_url: String,
    #[serde(default)]
    pub api_key: String,

    pub total_cpu: f64,
    pub total_mem_gb: f64,
    #[serde(default)]
    pub total_storage_gb: f64,
    #[serde(default)]
    pub total_gpu: f64,

    /// Directory under which per-task output directories are created.
    #[serde(default = "default_outputs_base_dir")]
    pub outputs_base_dir: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_log_buffer_cap_bytes")]
    pub log_buffer_cap_bytes: usize,
    #[serde(default = "default_log_truncation_marker")]
    pub log_truncation_marker: String,
    #[serde(default = "default_upload_chunk_size_bytes")]
    pub upload_chunk_size_bytes: usize,
    #[serde(default = "default_cancel_grace_period_s")]
    pub cancel_grace_period_s: u64,
    #[serde(default = "default_graceful_shutdown_timeout_s")]
    pub graceful_shutdown_timeout_s: u64,
    #[serde(default = "default_database_busy_timeout_s")]
    pub database_busy_timeout_s: u64,
}

impl WorkerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        crate::utils::validate_id("worker_id", &self.worker_id)?;
        if self.total_cpu < 0.0 || self.total_mem_gb < 0.0 {
            return Err(crate::SchedulerError::Config(
                "total_cpu and total_mem_gb must be non-negative".to_string(),
            )
            .into());
        }
        if self
            .listen_address
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(crate::SchedulerError::Config(format!(
                "listen_address '{}' is not a valid socket address",
                self.listen_address
            ))
            .into());
        }
        Ok(())
    }
}

/// θ/α/β/γ scheduler parameters, hot-reloaded from a JSON file every
/// `param_reload_interval_s` (§6). Treated as an immutable snapshot once
/// loaded (§9).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerParams {
    #[serde(default = "default_theta_cpu")]
    pub theta_cpu: f64,
    #[serde(default = "default_theta_mem")]
    pub theta_mem: f64,
    #[serde(default = "default_theta_gpu")]
    pub theta_gpu: f64,
    #[serde(default = "default_theta_load")]
    pub theta_load: f64,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_beta")]
    pub beta: f64,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            theta_cpu: default_theta_cpu(),
            theta_mem: default_theta_mem(),
            theta_gpu: default_theta_gpu(),
            theta_load: default_theta_load(),
            alpha: default_alpha(),
            beta: default_beta(),
            gamma: default_gamma(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_config_defaults_are_valid() {
        let cfg = MasterConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.default_sla_multiplier, 2.0);
    }

    #[test]
    fn master_config_rejects_bad_sla_multiplier() {
        let mut cfg = MasterConfig::default();
        cfg.default_sla_multiplier = 9.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn worker_config_requires_valid_id() {
        let cfg = WorkerConfig {
            worker_id: "bad id!".to_string(),
            worker_address: "http://localhost:7100".to_string(),
            listen_address: "0.0.0.0:7100".to_string(),
            master_url: "http://localhost:7000".to_string(),
            api_key: String::new(),
            total_cpu: 4.0,
            total_mem_gb: 8.0,
            total_storage_gb: 0.0,
            total_gpu: 0.0,
            outputs_base_dir: default_outputs_base_dir(),
            data_dir: default_data_dir(),
            heartbeat_interval_s: default_heartbeat_interval_s(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            log_buffer_cap_bytes: default_log_buffer_cap_bytes(),
            log_truncation_marker: default_log_truncation_marker(),
            upload_chunk_size_bytes: default_upload_chunk_size_bytes(),
            cancel_grace_period_s: default_cancel_grace_period_s(),
            graceful_shutdown_timeout_s: default_graceful_shutdown_timeout_s(),
            database_busy_timeout_s: default_database_busy_timeout_s(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn scheduler_params_default_matches_documented_values() {
        let p = SchedulerParams::default();
        assert_eq!(p.alpha, 1.0);
        assert_eq!(p.theta_load, 1.0);
    }
}
