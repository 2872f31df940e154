//! Worker Registry (component B) — authoritative in-memory worker state,
//! mirrored to the `workers` table.
//!
//! A single `RwLock` guards the full map (§5: "single RW-mutex guarding the
//! full map; allocation changes are atomic compound ops under the write
//! lock"). Database writes ride along on every mutation but are best-effort:
//! a `StorageError` here is logged and never blocks scheduling, since
//! `ResourceReconciler` (component J) can rebuild allocations from `running`
//! tasks after a restart.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use shared::model::{ResourceVector, UsageVector, Worker};
use shared::{utils::current_timestamp, SchedulerError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::database::{db_workers, MasterDatabase};

pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Worker>>,
    db: Arc<AsyncMutex<MasterDatabase>>,
    heartbeat_timeout_s: u64,
    require_pre_registration: bool,
}

impl WorkerRegistry {
    pub fn new(
        db: Arc<AsyncMutex<MasterDatabase>>,
        heartbeat_timeout_s: u64,
        require_pre_registration: bool,
    ) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            db,
            heartbeat_timeout_s,
            require_pre_registration,
        }
    }

    /// Populates the in-memory map from the persisted mirror at startup.
    pub async fn load_from_db(&self) -> anyhow::Result<()> {
        let rows = {
            let mut db = self.db.lock().await;
            let conn = db.workers()?;
            db_workers::list_all(conn)?
        };
        let count = rows.len();
        let mut workers = self.workers.write().expect("worker registry lock poisoned");
        for w in rows {
            workers.insert(w.id.clone(), w);
        }
        info!(count, "loaded workers from persisted state");
        Ok(())
    }

    fn persist(&self, worker: Worker) {
        let db = Arc::clone(&self.db);
        tokio::spawn(async move {
            let mut db = db.lock().await;
            if let Ok(conn) = db.workers() {
                if let Err(e) = db_workers::upsert(conn, &worker) {
                    warn!(worker_id = %worker.id, error = ?e, "failed to persist worker state");
                }
            }
        });
    }

    /// Operator pre-registration: declare an id + address before the worker
    /// process exists. Capacity starts at zero (a placeholder, never
    /// eligible for a task until its own `RegisterWorker` arrives).
    /// Idempotent: re-pre-registering an existing id just updates the
    /// address.
    pub fn pre_register(&self, id: &str, address: &str) -> anyhow::Result<Worker> {
        let now = current_timestamp();
        let worker = {
            let mut workers = self.workers.write().expect("worker registry lock poisoned");
            let entry = workers.entry(id.to_string()).or_insert_with(|| Worker {
                id: id.to_string(),
                address: address.to_string(),
                total: ResourceVector::default(),
                allocated: ResourceVector::default(),
                active: false,
                last_heartbeat: 0,
                registered_at: now,
            });
            entry.address = address.to_string();
            entry.clone()
        };
        self.persist(worker.clone());
        Ok(worker)
    }

    /// The worker's own `RegisterWorker` RPC: creates a fresh record, or — if
    /// this id was already pre-registered — upgrades capacity/address on the
    /// existing record while preserving its id and any prior allocation
    /// bookkeeping (§4.2, §9 Open Question: ids are the sole key).
    pub fn register_worker(
        &self,
        id: &str,
        address: &str,
        total: ResourceVector,
    ) -> anyhow::Result<Worker> {
        let now = current_timestamp();
        let exists = {
            let workers = self.workers.read().expect("worker registry lock poisoned");
            workers.contains_key(id)
        };
        if !exists && self.require_pre_registration {
            return Err(SchedulerError::Unauthorized(format!(
                "worker '{id}' is not pre-registered"
            ))
            .into());
        }
        let worker = {
            let mut workers = self.workers.write().expect("worker registry lock poisoned");
            let entry = workers.entry(id.to_string()).or_insert_with(|| Worker {
                id: id.to_string(),
                address: address.to_string(),
                total,
                allocated: ResourceVector::default(),
                active: true,
                last_heartbeat: now,
                registered_at: now,
            });
            entry.address = address.to_string();
            entry.total = total;
            entry.active = true;
            entry.last_heartbeat = now;
            entry.clone()
        };
        info!(worker_id = %id, ?total, "worker registered");
        self.persist(worker.clone());
        Ok(worker)
    }

    /// Removes a worker outright. Returns the ids of any tasks that were
    /// `running` on it, for the caller (assignment pipeline) to mark failed.
    pub async fn unregister(&self, id: &str) -> anyhow::Result<()> {
        {
            let mut workers = self.workers.write().expect("worker registry lock poisoned");
            workers.remove(id);
        }
        let mut db = self.db.lock().await;
        let conn = db.workers()?;
        db_workers::delete(conn, id)?;
        info!(worker_id = %id, "worker unregistered");
        Ok(())
    }

    /// `AllocateResources`: fails with `insufficient` if any requested
    /// resource exceeds what's available. Atomic compound op under the
    /// write lock.
    pub fn allocate(&self, id: &str, req: &ResourceVector) -> anyhow::Result<()> {
        let worker = {
            let mut workers = self.workers.write().expect("worker registry lock poisoned");
            let w = workers
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(format!("worker '{id}' not found")))?;
            if !req.fits_within(&w.available()) {
                return Err(SchedulerError::InsufficientResources(format!(
                    "worker '{id}' cannot fit requested resources"
                ))
                .into());
            }
            w.allocated = w.allocated.add(req);
            w.clone()
        };
        self.persist(worker);
        Ok(())
    }

    /// `ReleaseResources`: decrements, floored at zero.
    pub fn release(&self, id: &str, req: &ResourceVector) -> anyhow::Result<()> {
        let worker = {
            let mut workers = self.workers.write().expect("worker registry lock poisoned");
            let w = workers
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(format!("worker '{id}' not found")))?;
            w.allocated = w.allocated.saturating_sub(req);
            w.clone()
        };
        self.persist(worker);
        Ok(())
    }

    /// Overwrites a worker's allocation with computed ground truth (used
    /// exclusively by the Resource Reconciler, component J).
    pub fn set_allocated(&self, id: &str, allocated: ResourceVector) -> anyhow::Result<()> {
        let worker = {
            let mut workers = self.workers.write().expect("worker registry lock poisoned");
            let w = workers
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(format!("worker '{id}' not found")))?;
            w.allocated = allocated;
            w.clone()
        };
        self.persist(worker);
        Ok(())
    }

    /// `Heartbeat(id, usage, running_task_ids)`: updates `last_heartbeat`,
    /// sets `active = true`. Telemetry fan-out (§4.3) is the caller's
    /// responsibility — this method only maintains liveness bookkeeping so
    /// it stays O(1) and never blocks on telemetry state.
    pub fn heartbeat(&self, id: &str, _usage: &UsageVector) -> anyhow::Result<()> {
        let now = current_timestamp();
        let worker = {
            let mut workers = self.workers.write().expect("worker registry lock poisoned");
            let w = workers
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(format!("worker '{id}' not found")))?;
            w.last_heartbeat = now;
            w.active = true;
            w.clone()
        };
        self.persist(worker);
        Ok(())
    }

    /// Marks workers inactive once `now - last_heartbeat >= HEARTBEAT_TIMEOUT`.
    /// Called by the telemetry inactivity ticker and by the reconnect
    /// monitor's eligibility check.
    pub fn age_out_inactive(&self) -> Vec<String> {
        let now = current_timestamp();
        let mut newly_inactive = Vec::new();
        let mut to_persist = Vec::new();
        {
            let mut workers = self.workers.write().expect("worker registry lock poisoned");
            for w in workers.values_mut() {
                if w.active && now.saturating_sub(w.last_heartbeat) >= self.heartbeat_timeout_s {
                    w.active = false;
                    newly_inactive.push(w.id.clone());
                    to_persist.push(w.clone());
                }
            }
        }
        for w in to_persist {
            self.persist(w);
        }
        newly_inactive
    }

    pub fn snapshot(&self, id: &str) -> Option<Worker> {
        self.workers.read().expect("worker registry lock poisoned").get(id).cloned()
    }

    pub fn snapshot_all(&self) -> Vec<Worker> {
        let workers = self.workers.read().expect("worker registry lock poisoned");
        let mut out: Vec<Worker> = workers.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Active + fitting workers, stable-sorted by id (used by both the
    /// round-robin cursor and the RTS tie-break rule).
    pub fn eligible_workers(&self, req: &ResourceVector) -> Vec<Worker> {
        let workers = self.workers.read().expect("worker registry lock poisoned");
        let mut out: Vec<Worker> = workers
            .values()
            .filter(|w| w.is_eligible_for(req))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn active_count(&self) -> usize {
        self.workers
            .read()
            .expect("worker registry lock poisoned")
            .values()
            .filter(|w| w.active)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.workers.read().expect("worker registry lock poisoned").len()
    }

    /// Workers that are inactive but have a known address — candidates for
    /// the reconnection monitor (component H).
    pub fn inactive_with_address(&self) -> Vec<Worker> {
        self.workers
            .read()
            .expect("worker registry lock poisoned")
            .values()
            .filter(|w| !w.active && !w.address.is_empty())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_registry() -> (WorkerRegistry, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        let db = Arc::new(AsyncMutex::new(db));
        (WorkerRegistry::new(db, 30, false), dir)
    }

    #[tokio::test]
    async fn pre_registered_placeholder_is_never_eligible() {
        let (reg, _dir) = test_registry().await;
        reg.pre_register("w1", "http://localhost:7100").unwrap();
        let req = ResourceVector { cpu: 0.0, mem: 0.0, storage: 0.0, gpu: 0.0 };
        // active flag starts false for a placeholder, and total is zero, so
        // even a zero-resource request finds it ineligible.
        assert!(reg.eligible_workers(&req).is_empty());
    }

    #[tokio::test]
    async fn register_worker_upgrades_placeholder_preserving_id() {
        let (reg, _dir) = test_registry().await;
        reg.pre_register("w1", "http://localhost:7100").unwrap();
        let total = ResourceVector { cpu: 4.0, mem: 8.0, storage: 100.0, gpu: 0.0 };
        reg.register_worker("w1", "http://localhost:7100", total).unwrap();
        let w = reg.snapshot("w1").unwrap();
        assert_eq!(w.total.cpu, 4.0);
        assert!(w.active);
    }

    #[tokio::test]
    async fn register_unknown_id_rejected_when_pre_registration_required() {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        let reg = WorkerRegistry::new(Arc::new(AsyncMutex::new(db)), 30, true);
        let total = ResourceVector { cpu: 4.0, mem: 8.0, storage: 100.0, gpu: 0.0 };
        assert!(reg.register_worker("unknown", "http://x", total).is_err());
    }

    #[tokio::test]
    async fn allocate_rejects_when_insufficient() {
        let (reg, _dir) = test_registry().await;
        let total = ResourceVector { cpu: 2.0, mem: 2.0, storage: 0.0, gpu: 0.0 };
        reg.register_worker("w1", "http://x", total).unwrap();
        let req = ResourceVector { cpu: 4.0, mem: 1.0, storage: 0.0, gpu: 0.0 };
        assert!(reg.allocate("w1", &req).is_err());
    }

    #[tokio::test]
    async fn allocate_then_release_returns_to_zero() {
        let (reg, _dir) = test_registry().await;
        let total = ResourceVector { cpu: 4.0, mem: 8.0, storage: 0.0, gpu: 0.0 };
        reg.register_worker("w1", "http://x", total).unwrap();
        let req = ResourceVector { cpu: 1.0, mem: 1.0, storage: 0.0, gpu: 0.0 };
        reg.allocate("w1", &req).unwrap();
        assert_eq!(reg.snapshot("w1").unwrap().allocated.cpu, 1.0);
        reg.release("w1", &req).unwrap();
        assert_eq!(reg.snapshot("w1").unwrap().allocated.cpu, 0.0);
    }

    #[tokio::test]
    async fn age_out_flips_active_after_timeout() {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        let reg = WorkerRegistry::new(Arc::new(AsyncMutex::new(db)), 0, false);
        let total = ResourceVector { cpu: 1.0, mem: 1.0, storage: 0.0, gpu: 0.0 };
        reg.register_worker("w1", "http://x", total).unwrap();
        let inactive = reg.age_out_inactive();
        assert_eq!(inactive, vec!["w1".to_string()]);
        assert!(!reg.snapshot("w1").unwrap().active);
    }
}
