//! Resource Reconciler (component J).
//!
//! Reconciles each worker's `allocated` vector against the sum of
//! `resources` actually requested by its running tasks, and overwrites on
//! divergence. Runs at startup (recovering from a crash mid-dispatch) and
//! on demand; idempotent, so a clean run is a no-op (§4.9).

use std::sync::Arc;

use shared::model::ResourceVector;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::database::{db_assignments, MasterDatabase};
use crate::registry::WorkerRegistry;

pub struct ResourceReconciler {
    registry: Arc<WorkerRegistry>,
    db: Arc<AsyncMutex<MasterDatabase>>,
}

impl ResourceReconciler {
    pub fn new(registry: Arc<WorkerRegistry>, db: Arc<AsyncMutex<MasterDatabase>>) -> Arc<Self> {
        Arc::new(Self { registry, db })
    }

    /// Recomputes every worker's `allocated` from the running-task table and
    /// overwrites whichever ones diverge. Returns the ids corrected.
    pub async fn reconcile(&self) -> anyhow::Result<Vec<String>> {
        let sums = {
            let mut db = self.db.lock().await;
            let conn = db.workers()?;
            db_assignments::sum_requested_resources_by_worker(conn)?
        };

        let mut corrected = Vec::new();
        for worker in self.registry.snapshot_all() {
            let expected = sums.get(&worker.id).cloned().unwrap_or_default();
            if !approx_eq(&worker.allocated, &expected) {
                warn!(
                    worker_id = %worker.id,
                    recorded = ?worker.allocated,
                    actual = ?expected,
                    "correcting divergent worker allocation"
                );
                self.registry.set_allocated(&worker.id, expected)?;
                corrected.push(worker.id);
            }
        }
        if !corrected.is_empty() {
            info!(count = corrected.len(), "resource reconciler corrected worker allocations");
        }
        Ok(corrected)
    }
}

fn approx_eq(a: &ResourceVector, b: &ResourceVector) -> bool {
    const EPSILON: f64 = 1e-9;
    (a.cpu - b.cpu).abs() < EPSILON
        && (a.mem - b.mem).abs() < EPSILON
        && (a.storage - b.storage).abs() < EPSILON
        && (a.gpu - b.gpu).abs() < EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::{Task, TaskStatus, TaskType};
    use tempfile::TempDir;

    fn sample_task(id: &str, worker: &str, cpu: f64) -> Task {
        Task {
            id: id.to_string(),
            user: "alice".to_string(),
            name: "job".to_string(),
            image: "alpine".to_string(),
            command: None,
            resources: ResourceVector { cpu, mem: 1.0, storage: 0.0, gpu: 0.0 },
            status: TaskStatus::Running,
            submitted_at: 0,
            assigned_at: Some(0),
            started_at: Some(0),
            completed_at: None,
            assigned_worker: Some(worker.to_string()),
            task_type: TaskType::CpuLight,
            tau_at_submission: 5.0,
            sla_multiplier: 2.0,
        }
    }

    async fn test_setup() -> (Arc<ResourceReconciler>, Arc<WorkerRegistry>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        let db = Arc::new(AsyncMutex::new(db));
        let registry = Arc::new(WorkerRegistry::new(db.clone(), 60, false));
        let reconciler = ResourceReconciler::new(registry.clone(), db);
        (reconciler, registry, dir)
    }

    #[tokio::test]
    async fn reconcile_overwrites_allocation_drifted_from_running_tasks() {
        let (reconciler, registry, _dir) = test_setup().await;
        registry
            .register_worker("w1", "http://x", ResourceVector { cpu: 8.0, mem: 8.0, storage: 0.0, gpu: 0.0 })
            .unwrap();
        registry
            .allocate("w1", &ResourceVector { cpu: 1.0, mem: 1.0, storage: 0.0, gpu: 0.0 })
            .unwrap();

        {
            let mut db_guard = reconciler.db.lock().await;
            let conn = db_guard.workers().unwrap();
            crate::database::db_tasks::insert(conn, &sample_task("t1", "w1", 3.0)).unwrap();
        }

        let corrected = reconciler.reconcile().await.unwrap();
        assert_eq!(corrected, vec!["w1".to_string()]);
        assert_eq!(registry.snapshot("w1").unwrap().allocated.cpu, 3.0);
    }

    #[tokio::test]
    async fn reconcile_is_a_noop_when_already_consistent() {
        let (reconciler, registry, _dir) = test_setup().await;
        registry
            .register_worker("w1", "http://x", ResourceVector { cpu: 8.0, mem: 8.0, storage: 0.0, gpu: 0.0 })
            .unwrap();
        let corrected = reconciler.reconcile().await.unwrap();
        assert!(corrected.is_empty());
    }
}
