//! Distributed Docker Task Scheduler — Worker Execution Agent
//!
//! The worker registers its capacity with the master, accepts `AssignTask`
//! RPCs, runs each task to completion in its own Docker container, and
//! reports results back. Heartbeats and a bounded local retry queue keep the
//! master's view of this worker eventually consistent across transient
//! network loss (§9).
// This is the main entry point for the worker application. It is responsible for:
// - Initializing logging and configuration.
// - Wiring every component together into the `Worker` struct.
// - Starting the inbound RPC server and the heartbeat/retry background loops.
// - Handling graceful shutdown.

// Use jemalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Worker version from Cargo.toml
const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod config;
mod database;
mod error;
mod executor;
mod retry;
mod ring_buffer;
mod rpc_client;
mod state;

use config::ConfigManager;
use database::WorkerDatabase;
use executor::Executor;
use retry::RetryDispatcher;
use rpc_client::RpcClient;
use shared::model::{ResourceVector, UsageVector};
use state::WorkerState;

const DATA_RETENTION_DAYS: u32 = 7;
const CLEANUP_INTERVAL_S: u64 = 86_400;

/// Command-line arguments for the worker.
#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Execution agent for a distributed Docker task scheduler", long_about = None)]
struct CliArgs {
    /// Path to the worker configuration file (worker.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the worker id from config file
    #[arg(long = "worker-id", value_name = "ID")]
    worker_id: Option<String>,

    /// Override the listen address from config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the master's base URL from config file
    #[arg(long = "master-url", value_name = "URL")]
    master_url: Option<String>,

    /// Override the API key from config file
    #[arg(long = "api-key", value_name = "KEY")]
    api_key: Option<String>,
}

/// The main application structure for the worker. Holds every component plus
/// the background task handles needed for an orderly shutdown.
pub struct Worker {
    pub config_manager: ConfigManager,
    listen_address: SocketAddr,
    db: Option<Arc<tokio::sync::Mutex<WorkerDatabase>>>,
    heartbeat_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    cleanup_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Worker {
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_manager = ConfigManager::new(config_path)?;
        let listen_address: SocketAddr = config_manager.config.listen_address.parse().map_err(|e| {
            anyhow::anyhow!(
                "invalid listen address '{}': {}",
                config_manager.config.listen_address,
                e
            )
        })?;

        Ok(Self {
            config_manager,
            listen_address,
            db: None,
            heartbeat_task: None,
            retry_task: None,
            cleanup_task: None,
            shutdown_tx: None,
        })
    }

    /// Wires together every component and runs the HTTP server until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting Distributed Docker Task Scheduler (worker)");
        let cfg = self.config_manager.config.clone();
        info!(
            worker_id = %cfg.worker_id,
            listen_address = %self.listen_address,
            master_url = %cfg.master_url,
            total_cpu = cfg.total_cpu,
            total_mem_gb = cfg.total_mem_gb,
            total_gpu = cfg.total_gpu,
            "worker configuration loaded"
        );

        let total = ResourceVector {
            cpu: cfg.total_cpu,
            mem: cfg.total_mem_gb,
            storage: cfg.total_storage_gb,
            gpu: cfg.total_gpu,
        };

        let mut database = WorkerDatabase::new(&cfg.data_dir, cfg.database_busy_timeout_s)
            .context("failed to create database manager")?;
        database.initialize().context("failed to initialize database")?;
        let db = Arc::new(tokio::sync::Mutex::new(database));
        self.db = Some(Arc::clone(&db));

        let rpc = Arc::new(
            RpcClient::new(
                cfg.master_url.clone(),
                cfg.api_key.clone(),
                cfg.worker_id.clone(),
                shared::defaults::default_control_rpc_timeout_s(),
            )
            .context("failed to build master RPC client")?,
        );
        let retry = RetryDispatcher::new(Arc::clone(&db), Arc::clone(&rpc));
        let executor = Arc::new(
            Executor::new(cfg.outputs_base_dir.clone(), cfg.cancel_grace_period_s, cfg.upload_chunk_size_bytes)
                .context("failed to connect to Docker")?,
        );
        let worker_state = Arc::new(WorkerState::new());

        // Register with the master before accepting any work. A failure here
        // is not fatal: the reconnection monitor will pick this worker up
        // once the master observes it as reachable (§9).
        match rpc.register_worker(&cfg.worker_id, &cfg.worker_address, total).await {
            Ok(resp) if resp.accepted => info!("registered with master"),
            Ok(resp) => warn!(reason = ?resp.reason, "master rejected registration"),
            Err(e) => warn!(error = ?e, "failed to register with master at startup, will retry via reconnection"),
        }

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        self.retry_task = Some(tokio::spawn(Arc::clone(&retry).run(cfg.heartbeat_interval_s, shutdown_tx.subscribe())));

        let heartbeat_rpc = Arc::clone(&rpc);
        let heartbeat_retry = Arc::clone(&retry);
        let heartbeat_state = Arc::clone(&worker_state);
        let heartbeat_interval_s = cfg.heartbeat_interval_s;
        let worker_id = cfg.worker_id.clone();
        let mut heartbeat_shutdown_rx = shutdown_tx.subscribe();
        self.heartbeat_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(heartbeat_interval_s.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let usage = usage_from(&heartbeat_state, &total);
                        let running_task_ids = heartbeat_state.running_task_ids();
                        let req = shared::api::HeartbeatRequest {
                            worker_id: worker_id.clone(),
                            usage,
                            running_task_ids,
                        };
                        if let Err(e) = heartbeat_rpc.heartbeat_raw(&req).await {
                            warn!(error = ?e, "heartbeat failed, queuing for retry");
                            if let Ok(payload) = serde_json::to_string(&req) {
                                heartbeat_retry.enqueue(database::db_queue::RpcKind::Heartbeat, payload).await;
                            }
                        }
                    }
                    _ = heartbeat_shutdown_rx.recv() => {
                        info!("heartbeat loop shutting down");
                        return;
                    }
                }
            }
        }));

        let db_for_cleanup = Arc::clone(&db);
        let mut cleanup_shutdown_rx = shutdown_tx.subscribe();
        self.cleanup_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_S));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        info!("running periodic database cleanup");
                        let mut db = db_for_cleanup.lock().await;
                        if let Err(e) = db.cleanup_old_data(DATA_RETENTION_DAYS) {
                            error!(error = ?e, "database cleanup failed");
                        } else {
                            info!("database cleanup completed successfully");
                        }
                    }
                    _ = cleanup_shutdown_rx.recv() => {
                        info!("cleanup task shutting down");
                        return;
                    }
                }
            }
        }));

        let state = Arc::new(api::AppState {
            worker_id: cfg.worker_id.clone(),
            worker_address: cfg.worker_address.clone(),
            api_key: cfg.api_key.clone(),
            max_concurrent_tasks: cfg.max_concurrent_tasks,
            log_buffer_cap_bytes: cfg.log_buffer_cap_bytes,
            log_truncation_marker: cfg.log_truncation_marker.clone(),
            total,
            worker_state,
            executor,
            rpc,
            retry,
        });
        let app = api::create_router(state);

        info!("starting HTTP server on {}", self.listen_address);
        let listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .with_context(|| {
                format!(
                    "failed to bind TCP listener to {}. Check if the port is already in use (EADDRINUSE) \
                     or requires elevated permissions (EACCES).",
                    self.listen_address
                )
            })?;

        let shutdown_signal = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("HTTP server received shutdown signal");
            }
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("server error: {e}"))?;

        Ok(())
    }

    /// Graceful shutdown: broadcast, then bounded-timeout join every
    /// background task, then close the database.
    pub async fn shutdown(&mut self) {
        info!("shutting down worker gracefully");
        let timeout_s = self.config_manager.config.graceful_shutdown_timeout_s;

        if let Some(tx) = &self.shutdown_tx {
            if let Err(e) = tx.send(()) {
                warn!(error = ?e, "failed to send shutdown signal");
            }
        }

        for (name, handle) in [
            ("heartbeat", self.heartbeat_task.take()),
            ("rpc retry dispatcher", self.retry_task.take()),
            ("cleanup", self.cleanup_task.take()),
        ] {
            if let Some(handle) = handle {
                match tokio::time::timeout(Duration::from_secs(timeout_s), handle).await {
                    Ok(Ok(())) => info!(task = name, "background task completed"),
                    Ok(Err(e)) => warn!(task = name, error = ?e, "background task panicked"),
                    Err(_) => warn!(task = name, "background task shutdown timeout reached, aborting"),
                }
            }
        }

        if let Some(db) = &self.db {
            info!("closing database connection");
            db.lock().await.close();
        }

        info!("worker shutdown complete");
    }
}

/// Derives the heartbeat's usage fractions from currently-running tasks'
/// resource requests against this worker's total capacity (§4.2).
fn usage_from(worker_state: &WorkerState, total: &ResourceVector) -> UsageVector {
    let used = worker_state.total_running_resources();
    let frac = |used: f64, total: f64| if total > 0.0 { (used / total).min(1.0) } else { 0.0 };
    UsageVector {
        cpu_usage: frac(used.cpu, total.cpu),
        mem_usage: frac(used.mem, total.mem),
        gpu_usage: frac(used.gpu, total.gpu),
    }
}

/// Sets up signal handlers for graceful shutdown: SIGTERM/SIGINT on Unix,
/// Ctrl+C elsewhere.
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!(error = ?e, "failed to register signal handlers, falling back to Ctrl+C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = ?e, "failed to wait for Ctrl+C");
                } else {
                    info!("received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = ?e, "failed to receive Ctrl+C signal");
        } else {
            info!("received Ctrl+C");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let file_appender = tracing_appender::rolling::daily("./logs", "worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("worker=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    info!(version = WORKER_VERSION, "worker starting up");
    info!(config_file = %cli_args.config_file.display(), "loading configuration");

    let mut worker = match Worker::new(cli_args.config_file) {
        Ok(worker) => worker,
        Err(e) => {
            error!(error = ?e, "failed to initialize worker");
            std::process::exit(1);
        }
    };

    if let Some(id) = cli_args.worker_id {
        info!("worker id override provided via command line");
        worker.config_manager.config.worker_id = id;
    }
    if let Some(addr) = cli_args.listen_address {
        info!("listen address override provided via command line");
        worker.config_manager.config.listen_address = addr;
        worker.listen_address = worker
            .config_manager
            .config
            .listen_address
            .parse()
            .unwrap_or(worker.listen_address);
    }
    if let Some(url) = cli_args.master_url {
        info!("master URL override provided via command line");
        worker.config_manager.config.master_url = url;
    }
    if let Some(key) = cli_args.api_key {
        info!("API key override provided via command line");
        worker.config_manager.config.api_key = key;
    }

    tokio::select! {
        result = worker.run() => {
            if let Err(e) = result {
                error!(error = ?e, "worker error");
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("shutdown signal received, initiating graceful shutdown");
        }
    }

    worker.shutdown().await;
    info!("worker shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn worker_new_loads_and_validates_config() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, r#"worker_id = "worker-1""#).unwrap();
        writeln!(temp_file, r#"worker_address = "http://127.0.0.1:7100""#).unwrap();
        writeln!(temp_file, r#"listen_address = "127.0.0.1:0""#).unwrap();
        writeln!(temp_file, r#"total_cpu = 4.0"#).unwrap();
        writeln!(temp_file, r#"total_mem_gb = 8.0"#).unwrap();
        let worker = Worker::new(temp_file.path().to_path_buf()).unwrap();
        assert_eq!(worker.config_manager.config.worker_id, "worker-1");
    }

    #[test]
    fn usage_from_computes_fractions_against_total() {
        let state = WorkerState::new();
        let total = ResourceVector { cpu: 4.0, mem: 8.0, storage: 0.0, gpu: 2.0 };
        let usage = usage_from(&state, &total);
        assert_eq!(usage.cpu_usage, 0.0);
        assert_eq!(usage.mem_usage, 0.0);
        assert_eq!(usage.gpu_usage, 0.0);
    }
}
