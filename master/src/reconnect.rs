//! Worker Reconnection Monitor (component H).
//!
//! Every `reconnect_interval_s`, pings each inactive-but-known-address worker
//! with a short-lived `MasterRegister` RPC so a worker that restarted (and
//! lost track of the master) finds its way back without operator
//! intervention (§4.8). Success is logged; failure is expected and silent,
//! mirroring the teacher's best-effort reconnect probes in
//! `agent/src/main.rs`.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::registry::WorkerRegistry;
use crate::rpc_client::WorkerRpcClient;

pub struct ReconnectMonitor {
    registry: Arc<WorkerRegistry>,
    rpc: Arc<WorkerRpcClient>,
    master_id: String,
    master_address: String,
    interval_s: u64,
}

impl ReconnectMonitor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        rpc: Arc<WorkerRpcClient>,
        master_id: String,
        master_address: String,
        interval_s: u64,
    ) -> Arc<Self> {
        Arc::new(Self { registry, rpc, master_id, master_address, interval_s })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.interval_s.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => {
                    info!("reconnect monitor shutting down");
                    return;
                }
            }
            self.tick().await;
        }
    }

    async fn tick(&self) {
        for worker in self.registry.inactive_with_address() {
            match self
                .rpc
                .master_register(&worker.address, &self.master_id, &self.master_address)
                .await
            {
                Ok(resp) => {
                    info!(worker_id = %worker.id, acknowledged = resp.acknowledged, "reconnect probe succeeded");
                }
                Err(_) => {
                    // Expected when the worker is genuinely down; next tick retries.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MasterDatabase;
    use shared::model::ResourceVector;
    use tempfile::TempDir;
    use tokio::sync::Mutex as AsyncMutex;

    fn test_registry(heartbeat_timeout_s: u64) -> (Arc<WorkerRegistry>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        let registry = Arc::new(WorkerRegistry::new(Arc::new(AsyncMutex::new(db)), heartbeat_timeout_s, false));
        (registry, dir)
    }

    #[tokio::test]
    async fn tick_skips_workers_without_a_known_address() {
        let (registry, _dir) = test_registry(0);
        registry
            .register_worker("w1", "", ResourceVector { cpu: 1.0, mem: 1.0, storage: 0.0, gpu: 0.0 })
            .unwrap();
        registry.age_out_inactive();
        assert!(registry.inactive_with_address().is_empty());
    }

    #[tokio::test]
    async fn tick_targets_inactive_workers_with_addresses_and_does_not_panic_on_rpc_failure() {
        let (registry, _dir) = test_registry(0);
        registry
            .register_worker("w1", "http://127.0.0.1:1", ResourceVector { cpu: 1.0, mem: 1.0, storage: 0.0, gpu: 0.0 })
            .unwrap();
        registry.age_out_inactive();

        let rpc = Arc::new(WorkerRpcClient::new(String::new(), 1, 1).unwrap());
        let monitor = ReconnectMonitor::new(registry.clone(), rpc, "master-1".to_string(), "http://127.0.0.1:9".to_string(), 30);
        monitor.tick().await;
    }
}
