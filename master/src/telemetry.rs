//! Telemetry Manager (component C) — decouples heartbeat ingestion from
//! WebSocket fan-out.
//!
//! Each worker gets its own bounded, drop-oldest inbound queue (capacity
//! `telemetry_channel_capacity`, default 8) and background task, mirroring
//! the teacher's per-agent metrics-ingestion shape in
//! `server/src/bandwidth_state.rs`. `ingest` itself never blocks and never
//! awaits a slow WebSocket client — only the background task touches the
//! broadcast channel.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use shared::api::TelemetrySnapshot;
use shared::model::UsageVector;
use shared::utils::current_timestamp;
use tokio::sync::{broadcast, Notify};
use tracing::debug;

use crate::registry::WorkerRegistry;

struct TelemetryUpdate {
    usage: UsageVector,
    running_task_ids: Vec<String>,
}

struct WorkerChannel {
    queue: Mutex<VecDeque<TelemetryUpdate>>,
    notify: Notify,
    capacity: usize,
}

impl WorkerChannel {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, update: TelemetryUpdate) {
        let mut queue = self.queue.lock().expect("telemetry queue lock poisoned");
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(update);
        drop(queue);
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<TelemetryUpdate> {
        let mut queue = self.queue.lock().expect("telemetry queue lock poisoned");
        queue.drain(..).collect()
    }
}

pub struct TelemetryManager {
    registry: Arc<WorkerRegistry>,
    channels: RwLock<HashMap<String, Arc<WorkerChannel>>>,
    latest: RwLock<HashMap<String, TelemetrySnapshot>>,
    broadcast_tx: broadcast::Sender<TelemetrySnapshot>,
    channel_capacity: usize,
}

impl TelemetryManager {
    pub fn new(registry: Arc<WorkerRegistry>, channel_capacity: usize) -> Arc<Self> {
        let (broadcast_tx, _rx) = broadcast::channel(256);
        Arc::new(Self {
            registry,
            channels: RwLock::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),
            broadcast_tx,
            channel_capacity: channel_capacity.max(1),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetrySnapshot> {
        self.broadcast_tx.subscribe()
    }

    /// Fast path called from the `Heartbeat` RPC handler: never blocks, never
    /// awaits. Lazily spawns the per-worker fan-out task on first contact.
    pub fn ingest(self: &Arc<Self>, worker_id: &str, usage: UsageVector, running_task_ids: Vec<String>) {
        let channel = self.channel_for(worker_id);
        channel.push(TelemetryUpdate { usage, running_task_ids });
    }

    fn channel_for(self: &Arc<Self>, worker_id: &str) -> Arc<WorkerChannel> {
        if let Some(c) = self.channels.read().expect("telemetry channels lock poisoned").get(worker_id) {
            return Arc::clone(c);
        }
        let mut channels = self.channels.write().expect("telemetry channels lock poisoned");
        if let Some(c) = channels.get(worker_id) {
            return Arc::clone(c);
        }
        let channel = Arc::new(WorkerChannel::new(self.channel_capacity));
        channels.insert(worker_id.to_string(), Arc::clone(&channel));
        let manager = Arc::clone(self);
        let worker_id = worker_id.to_string();
        let task_channel = Arc::clone(&channel);
        tokio::spawn(async move {
            manager.run_worker_fanout(worker_id, task_channel).await;
        });
        channel
    }

    async fn run_worker_fanout(self: Arc<Self>, worker_id: String, channel: Arc<WorkerChannel>) {
        loop {
            channel.notify.notified().await;
            for update in channel.drain() {
                let snapshot = TelemetrySnapshot {
                    worker_id: worker_id.clone(),
                    cpu_usage: update.usage.cpu_usage,
                    mem_usage: update.usage.mem_usage,
                    gpu_usage: update.usage.gpu_usage,
                    running_tasks: update.running_task_ids,
                    last_update: current_timestamp(),
                    is_active: true,
                };
                self.latest
                    .write()
                    .expect("telemetry latest lock poisoned")
                    .insert(worker_id.clone(), snapshot.clone());
                // Lagging/absent subscribers are not an error: broadcast
                // naturally drops for slow WebSocket clients.
                let _ = self.broadcast_tx.send(snapshot);
            }
        }
    }

    pub fn snapshot(&self, worker_id: &str) -> Option<TelemetrySnapshot> {
        self.latest.read().expect("telemetry latest lock poisoned").get(worker_id).cloned()
    }

    pub fn snapshot_all(&self) -> Vec<TelemetrySnapshot> {
        let latest = self.latest.read().expect("telemetry latest lock poisoned");
        let mut out: Vec<TelemetrySnapshot> = latest.values().cloned().collect();
        out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        out
    }

    /// Run periodically (every `heartbeat_timeout_s`-scaled tick) to flip
    /// timed-out workers inactive and broadcast the transition.
    pub fn tick_inactivity(&self) {
        for worker_id in self.registry.age_out_inactive() {
            debug!(%worker_id, "worker timed out, marking inactive");
            let mut latest = self.latest.write().expect("telemetry latest lock poisoned");
            let snapshot = latest.entry(worker_id.clone()).or_insert_with(|| TelemetrySnapshot {
                worker_id: worker_id.clone(),
                cpu_usage: 0.0,
                mem_usage: 0.0,
                gpu_usage: 0.0,
                running_tasks: Vec::new(),
                last_update: current_timestamp(),
                is_active: false,
            });
            snapshot.is_active = false;
            snapshot.last_update = current_timestamp();
            let _ = self.broadcast_tx.send(snapshot.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::ResourceVector;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::Mutex as AsyncMutex;

    async fn test_registry() -> (Arc<WorkerRegistry>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut db = crate::database::MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        let registry = WorkerRegistry::new(Arc::new(AsyncMutex::new(db)), 30, false);
        (Arc::new(registry), dir)
    }

    #[tokio::test]
    async fn ingest_is_fanned_out_and_latest_is_queryable() {
        let (registry, _dir) = test_registry().await;
        let total = ResourceVector { cpu: 4.0, mem: 8.0, storage: 0.0, gpu: 0.0 };
        registry.register_worker("w1", "http://x", total).unwrap();
        let manager = TelemetryManager::new(Arc::clone(&registry), 8);
        let mut rx = manager.subscribe();

        manager.ingest(
            "w1",
            UsageVector { cpu_usage: 0.5, mem_usage: 0.2, gpu_usage: 0.0 },
            vec!["t1".to_string()],
        );

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.worker_id, "w1");
        assert_eq!(snapshot.cpu_usage, 0.5);
        assert_eq!(manager.snapshot("w1").unwrap().running_tasks, vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn drop_oldest_keeps_queue_bounded() {
        let channel = WorkerChannel::new(2);
        for i in 0..5 {
            channel.push(TelemetryUpdate {
                usage: UsageVector { cpu_usage: i as f64, mem_usage: 0.0, gpu_usage: 0.0 },
                running_task_ids: vec![],
            });
        }
        let drained = channel.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].usage.cpu_usage, 3.0);
        assert_eq!(drained[1].usage.cpu_usage, 4.0);
    }

    #[tokio::test]
    async fn tick_inactivity_marks_worker_inactive_and_broadcasts() {
        let dir = TempDir::new().unwrap();
        let mut db = crate::database::MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        let zero_timeout_registry = Arc::new(WorkerRegistry::new(Arc::new(AsyncMutex::new(db)), 0, false));
        let total = ResourceVector { cpu: 4.0, mem: 8.0, storage: 0.0, gpu: 0.0 };
        zero_timeout_registry.register_worker("w1", "http://x", total).unwrap();
        let manager = TelemetryManager::new(zero_timeout_registry, 8);
        let mut rx = manager.subscribe();
        manager.tick_inactivity();
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.worker_id, "w1");
        assert!(!snapshot.is_active);
    }
}
