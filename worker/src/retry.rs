//! Background replay of the bounded RPC retry queue.
//!
//! The direct path (heartbeat ticker, executor completion report, output
//! upload) always attempts its RPC immediately; only a failed attempt is
//! durably enqueued here, so the common connected case never pays for a
//! database round-trip. Once enqueued, an attempt is retried with
//! exponential backoff until it is acknowledged or exceeds the retry cap.

use std::sync::Arc;
use std::time::Duration;

use shared::api::{HeartbeatRequest, ReportTaskCompletionRequest, UploadOutputFilesChunk};
use shared::utils::current_timestamp;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::database::db_queue::{self, QueueEntry, RpcKind};
use crate::database::WorkerDatabase;
use crate::rpc_client::RpcClient;

const ENTRIES_PER_PASS: usize = 50;

pub struct RetryDispatcher {
    db: Arc<AsyncMutex<WorkerDatabase>>,
    rpc: Arc<RpcClient>,
}

impl RetryDispatcher {
    pub fn new(db: Arc<AsyncMutex<WorkerDatabase>>, rpc: Arc<RpcClient>) -> Arc<Self> {
        Arc::new(Self { db, rpc })
    }

    /// Durably records a failed attempt so it can be replayed later.
    pub async fn enqueue(&self, kind: RpcKind, payload_json: String) {
        let mut db = self.db.lock().await;
        let conn = match db.queue() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = ?e, kind = kind.as_str(), "failed to open worker database for retry enqueue");
                return;
            }
        };
        if let Err(e) = db_queue::enqueue(conn, kind, &payload_json, current_timestamp()) {
            warn!(error = ?e, kind = kind.as_str(), "failed to enqueue rpc attempt for retry");
        }
    }

    async fn dispatch_one(&self, entry: &QueueEntry) -> anyhow::Result<()> {
        match entry.kind {
            RpcKind::Heartbeat => {
                let req: HeartbeatRequest = serde_json::from_str(&entry.payload_json)?;
                self.rpc.heartbeat_raw(&req).await?;
            }
            RpcKind::ReportTaskCompletion => {
                let req: ReportTaskCompletionRequest = serde_json::from_str(&entry.payload_json)?;
                self.rpc.report_task_completion(&req).await?;
            }
            RpcKind::UploadOutputFiles => {
                let req: UploadOutputFilesChunk = serde_json::from_str(&entry.payload_json)?;
                self.rpc.upload_output_files_chunk(&req).await?;
            }
        }
        Ok(())
    }

    /// Replays every attempt due at `now`, one database-retry pass.
    pub async fn run_once(&self) {
        let now = current_timestamp();
        let entries = {
            let mut db = self.db.lock().await;
            match db.queue().and_then(|conn| db_queue::due_entries(conn, now, ENTRIES_PER_PASS)) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = ?e, "failed to fetch due rpc retry entries");
                    return;
                }
            }
        };
        if entries.is_empty() {
            return;
        }
        debug!(count = entries.len(), "replaying queued rpc attempts");

        for entry in entries {
            {
                let mut db = self.db.lock().await;
                if let Ok(conn) = db.queue() {
                    let _ = db_queue::mark_sending(conn, entry.id);
                }
            }
            match self.dispatch_one(&entry).await {
                Ok(()) => {
                    let mut db = self.db.lock().await;
                    if let Ok(conn) = db.queue() {
                        let _ = db_queue::mark_sent(conn, entry.id);
                    }
                    info!(id = entry.id, kind = entry.kind.as_str(), "queued rpc attempt acknowledged");
                }
                Err(e) => {
                    let mut db = self.db.lock().await;
                    if let Ok(conn) = db.queue() {
                        let _ = db_queue::mark_failed(conn, entry.id, current_timestamp(), &e.to_string());
                    }
                    warn!(id = entry.id, kind = entry.kind.as_str(), error = ?e, "queued rpc attempt failed again");
                }
            }
        }
    }

    /// Background loop: replay due attempts every `interval_s` until
    /// `shutdown` fires.
    pub async fn run(self: Arc<Self>, interval_s: u64, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_s.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_once().await,
                _ = shutdown.recv() => {
                    info!("rpc retry dispatcher shutting down");
                    return;
                }
            }
        }
    }
}
