//! Distributed Docker Task Scheduler — Master Control Plane
//!
//! The master accepts containerized job submissions from operators, routes
//! them to a fleet of worker nodes via the Risk-aware Task Scheduler, tracks
//! worker health and resource allocation, and exposes a REST/WebSocket API
//! for submission, inspection, and log/telemetry streaming.
// This is the main entry point for the master application. It is responsible for:
// - Initializing logging and configuration.
// - Wiring every component together into the `Master` struct.
// - Starting the HTTP/WebSocket API server.
// - Handling graceful shutdown.

// Use jemalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Master version from Cargo.toml
const MASTER_VERSION: &str = env!("CARGO_PKG_VERSION");

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
mod pipeline;
mod queue;
mod reconciler;
mod reconnect;
mod registry;
mod rpc_client;
mod scheduler;
mod streaming;
mod tau_store;
mod telemetry;

use config::{ConfigManager, SchedulerParamsWatcher};
use database::MasterDatabase;
use pipeline::AssignmentPipeline;
use queue::TaskQueue;
use reconciler::ResourceReconciler;
use reconnect::ReconnectMonitor;
use registry::WorkerRegistry;
use rpc_client::WorkerRpcClient;
use scheduler::Scheduler;
use streaming::FileUploadAssembler;
use tau_store::TauStore;
use telemetry::TelemetryManager;

/// Command-line arguments for the master.
#[derive(Parser, Debug)]
#[command(name = "master")]
#[command(about = "Control plane for a distributed Docker task scheduler", long_about = None)]
struct CliArgs {
    /// Path to the master configuration file (master.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the listen address from config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the operator API key from config file
    #[arg(long = "api-key", value_name = "KEY")]
    api_key: Option<String>,

    /// Override the data retention days from config file
    #[arg(long = "retention-days", value_name = "DAYS")]
    retention_days: Option<u32>,
}

/// The main application structure for the master. Holds every component plus
/// the background task handles needed for an orderly shutdown.
pub struct Master {
    pub config_manager: ConfigManager,
    listen_address: SocketAddr,
    master_id: String,
    db: Option<Arc<tokio::sync::Mutex<MasterDatabase>>>,
    scheduler_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    params_watcher_task: Option<JoinHandle<()>>,
    telemetry_tick_task: Option<JoinHandle<()>>,
    cleanup_task: Option<JoinHandle<()>>,
    wal_checkpoint_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Master {
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
            master_id: "master-1".to_string(),
            db: None,
            scheduler_task: None,
            reconnect_task: None,
            params_watcher_task: None,
            telemetry_tick_task: None,
            cleanup_task: None,
            wal_checkpoint_task: None,
            shutdown_tx: None,
        })
    }

    /// Wires together every component and runs the HTTP server until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting Distributed Docker Task Scheduler (master)");
        let cfg = self.config_manager.config.clone();
        info!(
            listen_address = %self.listen_address,
            data_dir = %cfg.data_dir,
            require_pre_registration = cfg.require_pre_registration,
            "master configuration loaded"
        );

        let mut database = MasterDatabase::new(&cfg.data_dir, cfg.database_busy_timeout_s)
            .context("failed to create database manager")?;
        database.initialize().context("failed to initialize database")?;
        let db = Arc::new(tokio::sync::Mutex::new(database));
        self.db = Some(Arc::clone(&db));

        let registry = Arc::new(WorkerRegistry::new(
            Arc::clone(&db),
            cfg.heartbeat_timeout_s,
            cfg.require_pre_registration,
        ));
        registry.load_from_db().await.context("failed to load workers from database")?;

        let queue = Arc::new(TaskQueue::new(Arc::clone(&db)));
        queue.load_from_db().await.context("failed to load tasks from database")?;

        let tau_store = {
            let mut db_guard = db.lock().await;
            let conn = db_guard.workers()?;
            Arc::new(TauStore::load(conn, cfg.tau_ema_lambda)?)
        };

        let telemetry = TelemetryManager::new(Arc::clone(&registry), cfg.telemetry_channel_capacity);

        let rpc = Arc::new(WorkerRpcClient::new(
            cfg.api_key.clone(),
            cfg.control_rpc_timeout_s,
            cfg.reconnect_rpc_timeout_s,
        )?);

        let pipeline = AssignmentPipeline::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&tau_store),
            Arc::clone(&telemetry),
            Arc::clone(&db),
            Arc::clone(&rpc),
            cfg.cancel_grace_period_s,
        );

        // Resource reconciler: rebuild allocations from the running-task
        // ground truth before the scheduler starts placing new work.
        let reconciler = ResourceReconciler::new(Arc::clone(&registry), Arc::clone(&db));
        match reconciler.reconcile().await {
            Ok(corrected) if !corrected.is_empty() => {
                info!(count = corrected.len(), "resource reconciler corrected allocations at startup");
            }
            Ok(_) => {}
            Err(e) => warn!(error = ?e, "resource reconciliation failed at startup"),
        }

        let params_path = PathBuf::from(&cfg.scheduler_params_path);
        let params_watcher = SchedulerParamsWatcher::load(params_path).await?;

        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&tau_store),
            Arc::clone(&telemetry),
            Arc::clone(&pipeline),
            params_watcher.params(),
            cfg.scheduler_tick_interval_s,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        self.scheduler_task = Some(tokio::spawn(scheduler.run(shutdown_tx.subscribe())));

        self.params_watcher_task = Some(tokio::spawn(
            params_watcher.run(cfg.param_reload_interval_s, shutdown_tx.subscribe()),
        ));

        let reconnect_monitor = ReconnectMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&rpc),
            self.master_id.clone(),
            format!("http://{}", self.listen_address),
            cfg.reconnect_interval_s,
        );
        self.reconnect_task = Some(tokio::spawn(reconnect_monitor.run(shutdown_tx.subscribe())));

        // Inactivity sweep: flips stale workers inactive and broadcasts the
        // transition, on its own configurable tick. `TelemetryManager`
        // doesn't own a background loop the way `Scheduler`/`ReconnectMonitor`
        // do, so it is driven here directly.
        let telemetry_for_tick = Arc::clone(&telemetry);
        let telemetry_tick_interval_s = cfg.telemetry_tick_interval_s;
        let mut telemetry_shutdown_rx = shutdown_tx.subscribe();
        self.telemetry_tick_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(telemetry_tick_interval_s.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => telemetry_for_tick.tick_inactivity(),
                    _ = telemetry_shutdown_rx.recv() => {
                        info!("telemetry inactivity sweep shutting down");
                        return;
                    }
                }
            }
        }));

        // Periodic cleanup of terminal tasks/results/files past retention,
        // and WAL checkpointing.
        let db_for_cleanup = Arc::clone(&db);
        let cleanup_interval_s = cfg.cleanup_interval_s;
        let retention_days = cfg.data_retention_days;
        let mut cleanup_shutdown_rx = shutdown_tx.subscribe();
        self.cleanup_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval_s.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        info!("running periodic database cleanup");
                        let mut db = db_for_cleanup.lock().await;
                        if let Err(e) = db.cleanup_old_data(retention_days) {
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

        let db_for_wal = Arc::clone(&db);
        let wal_checkpoint_interval_s = cfg.wal_checkpoint_interval_s;
        let mut wal_shutdown_rx = shutdown_tx.subscribe();
        self.wal_checkpoint_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(wal_checkpoint_interval_s.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let mut db = db_for_wal.lock().await;
                        match db.checkpoint_wal() {
                            Ok(frames) => info!(frames, "WAL checkpoint completed"),
                            Err(e) => warn!(error = ?e, "WAL checkpoint failed"),
                        }
                    }
                    _ = wal_shutdown_rx.recv() => {
                        info!("WAL checkpoint task shutting down");
                        return;
                    }
                }
            }
        }));

        let state = Arc::new(api::AppState {
            registry,
            queue,
            tau_store,
            telemetry,
            pipeline,
            db: Arc::clone(&db),
            uploads: Arc::new(FileUploadAssembler::new()),
            http: reqwest::Client::new(),
            api_key: cfg.api_key.clone(),
            files_base_dir: cfg.files_base_dir.clone(),
            log_replay_pacing_ms: cfg.log_replay_pacing_ms,
            ws_client_queue_capacity: cfg.ws_client_queue_capacity,
            default_sla_multiplier: cfg.default_sla_multiplier,
        });
        let app = api::create_router(state, cfg.http_body_limit_bytes);

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
        info!("shutting down master gracefully");
        let timeout_s = self.config_manager.config.graceful_shutdown_timeout_s;

        if let Some(tx) = &self.shutdown_tx {
            if let Err(e) = tx.send(()) {
                warn!(error = ?e, "failed to send shutdown signal");
            }
        }

        for (name, handle) in [
            ("scheduler", self.scheduler_task.take()),
            ("reconnect monitor", self.reconnect_task.take()),
            ("scheduler parameter watcher", self.params_watcher_task.take()),
            ("telemetry inactivity sweep", self.telemetry_tick_task.take()),
            ("cleanup", self.cleanup_task.take()),
            ("WAL checkpoint", self.wal_checkpoint_task.take()),
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

        info!("master shutdown complete");
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
    let file_appender = tracing_appender::rolling::daily("./logs", "master.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("master=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    info!(version = MASTER_VERSION, "master starting up");
    info!(config_file = %cli_args.config_file.display(), "loading configuration");

    let mut master = match Master::new(cli_args.config_file) {
        Ok(master) => master,
        Err(e) => {
            error!(error = ?e, "failed to initialize master");
            std::process::exit(1);
        }
    };

    if let Some(addr) = cli_args.listen_address {
        info!("listen address override provided via command line");
        master.config_manager.config.listen_address = addr;
        master.listen_address = master
            .config_manager
            .config
            .listen_address
            .parse()
            .unwrap_or(master.listen_address);
    }
    if let Some(key) = cli_args.api_key {
        info!("API key override provided via command line");
        master.config_manager.config.api_key = key;
    }
    if let Some(days) = cli_args.retention_days {
        info!("retention days override provided via command line");
        master.config_manager.config.data_retention_days = days;
    }

    tokio::select! {
        result = master.run() => {
            if let Err(e) = result {
                error!(error = ?e, "master error");
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("shutdown signal received, initiating graceful shutdown");
        }
    }

    master.shutdown().await;
    info!("master shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn master_new_loads_and_validates_config() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, r#"listen_address = "127.0.0.1:0""#).unwrap();
        let master = Master::new(temp_file.path().to_path_buf()).unwrap();
        assert_eq!(master.config_manager.config.listen_address, "127.0.0.1:0");
    }
}
