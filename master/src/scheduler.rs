//! Scheduler (component E) — a single processor task choosing where each
//! pending task runs: Risk-aware Task Scheduling (RTS) with a round-robin
//! fallback.
//!
//! One loop, woken by `TaskQueue::notify` (enqueue, a freed allocation, a
//! reported result) or a periodic tick, mirrors the teacher's ticker-task
//! idiom in `agent/src/scheduler.rs` collapsed to a single loop instead of
//! one ticker per task, since this scheduler has exactly one goroutine by
//! design (§4.5).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shared::config::SchedulerParams;
use shared::model::{Task, Worker};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{info, warn};

use crate::pipeline::AssignmentPipeline;
use crate::queue::TaskQueue;
use crate::registry::WorkerRegistry;
use crate::tau_store::TauStore;
use crate::telemetry::TelemetryManager;

pub struct Scheduler {
    registry: Arc<WorkerRegistry>,
    queue: Arc<TaskQueue>,
    tau_store: Arc<TauStore>,
    telemetry: Arc<TelemetryManager>,
    pipeline: Arc<AssignmentPipeline>,
    params: Arc<AsyncRwLock<SchedulerParams>>,
    rr_cursor: AtomicUsize,
    tick_interval_s: u64,
}

/// Outcome of picking a worker for one task, surfaced for logging (spec
/// §4.5.2: "the scheduler logs which policy was used").
enum Selection {
    Rts(Worker),
    RoundRobin(Worker),
    NoEligibleWorker,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        queue: Arc<TaskQueue>,
        tau_store: Arc<TauStore>,
        telemetry: Arc<TelemetryManager>,
        pipeline: Arc<AssignmentPipeline>,
        params: Arc<AsyncRwLock<SchedulerParams>>,
        tick_interval_s: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            queue,
            tau_store,
            telemetry,
            pipeline,
            params,
            rr_cursor: AtomicUsize::new(0),
            tick_interval_s,
        })
    }

    /// Main loop: run as a background task until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.tick_interval_s.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.queue.notify.notified() => {}
                _ = shutdown.recv() => {
                    info!("scheduler loop shutting down");
                    return;
                }
            }
            self.process_once().await;
        }
    }

    /// One scheduling pass: pop every currently pending task in FIFO order
    /// and attempt placement. A task that finds no eligible worker is left
    /// pending for the next wakeup.
    async fn process_once(&self) {
        for task in self.queue.list_pending_fifo().await {
            self.try_place(task).await;
        }
    }

    async fn try_place(&self, task: Task) {
        let eligible = self.registry.eligible_workers(&task.resources);
        if eligible.is_empty() {
            return;
        }

        let params = *self.params.read().await;
        let selection = self.select_rts(&task, &eligible, &params);
        let (chosen, policy) = match selection {
            Selection::Rts(w) => (w, "rts"),
            Selection::RoundRobin(w) => (w, "round-robin"),
            Selection::NoEligibleWorker => return,
        };

        info!(task_id = %task.id, worker_id = %chosen.id, policy, "scheduler selected worker");
        if let Err(e) = self.pipeline.dispatch(task.clone(), chosen).await {
            warn!(task_id = %task.id, error = ?e, "dispatch failed, task left for next pass");
        }
    }

    /// Attempts RTS placement; falls back to round-robin and logs
    /// `rts→round-robin-fallback` whenever RTS cannot produce a selection
    /// (spec §4.5.2). `eligible` is a snapshot taken before scoring began, so
    /// each candidate's fit is re-checked against the registry's *current*
    /// state here — a worker that was allocated away by a concurrent
    /// dispatch between the snapshot and scoring no longer counts as a real
    /// RTS candidate. If every candidate has gone stale this way, RTS has
    /// genuinely failed to produce a selection and falls back to
    /// round-robin over the original eligible list.
    fn select_rts(&self, task: &Task, eligible: &[Worker], params: &SchedulerParams) -> Selection {
        if eligible.is_empty() {
            return Selection::NoEligibleWorker;
        }
        let tau = self.tau_store.get(task.task_type);
        let deadline = task.deadline();
        let now = shared::utils::current_timestamp();

        let mut best: Option<(f64, Worker)> = None;
        for w in eligible {
            let current = match self.registry.snapshot(&w.id) {
                Some(c) if c.is_eligible_for(&task.resources) => c,
                _ => continue,
            };
            let load = self
                .telemetry
                .snapshot(&current.id)
                .map(|s| (s.cpu_usage + s.mem_usage + s.gpu_usage) / 3.0)
                .unwrap_or(0.0);
            let predicted = predicted_runtime(tau, task, &current, load, params);
            let finish = now as f64 + predicted;
            let slack_deficit = (finish - deadline as f64).max(0.0);
            // No affinity table is implemented; historical miss-rate penalty
            // is always absent, so the penalty term is always zero.
            let penalty = 0.0;
            let risk = params.alpha * slack_deficit + params.beta * load + params.gamma * penalty;
            match &best {
                Some((best_risk, best_worker)) => {
                    if risk < *best_risk || (risk == *best_risk && current.id < best_worker.id) {
                        best = Some((risk, current));
                    }
                }
                None => best = Some((risk, current)),
            }
        }

        match best {
            Some((_, w)) => Selection::Rts(w),
            None => {
                warn!(task_id = %task.id, "rts\u{2192}round-robin-fallback");
                self.round_robin(eligible)
            }
        }
    }

    fn round_robin(&self, eligible: &[Worker]) -> Selection {
        if eligible.is_empty() {
            return Selection::NoEligibleWorker;
        }
        let idx = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Selection::RoundRobin(eligible[idx].clone())
    }
}

/// `ê(T, w)`, spec §4.5.2.
fn predicted_runtime(tau: f64, task: &Task, worker: &Worker, load: f64, params: &SchedulerParams) -> f64 {
    let cpu_term = if worker.total.cpu > 0.0 {
        params.theta_cpu * (task.resources.cpu / worker.total.cpu)
    } else {
        0.0
    };
    let mem_term = if worker.total.mem > 0.0 {
        params.theta_mem * (task.resources.mem / worker.total.mem)
    } else {
        0.0
    };
    let gpu_term = if worker.total.gpu > 0.0 {
        params.theta_gpu * (task.resources.gpu / worker.total.gpu)
    } else {
        0.0
    };
    let load_term = params.theta_load * load;
    tau * (1.0 + cpu_term + mem_term + gpu_term + load_term)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MasterDatabase;
    use crate::rpc_client::WorkerRpcClient;
    use shared::model::{ResourceVector, TaskStatus, TaskType};
    use tempfile::TempDir;
    use tokio::sync::Mutex as AsyncMutex;

    fn sample_worker(id: &str, cpu: f64, mem: f64) -> Worker {
        Worker {
            id: id.to_string(),
            address: "http://x".to_string(),
            total: ResourceVector { cpu, mem, storage: 0.0, gpu: 0.0 },
            allocated: ResourceVector::default(),
            active: true,
            last_heartbeat: 0,
            registered_at: 0,
        }
    }

    fn sample_task(deadline_slack: u64) -> Task {
        Task {
            id: "t1".to_string(),
            user: "alice".to_string(),
            name: "job".to_string(),
            image: "alpine".to_string(),
            command: None,
            resources: ResourceVector { cpu: 1.0, mem: 1.0, storage: 0.0, gpu: 0.0 },
            status: TaskStatus::Pending,
            submitted_at: 0,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            assigned_worker: None,
            task_type: TaskType::CpuLight,
            tau_at_submission: 5.0,
            sla_multiplier: deadline_slack as f64 / 5.0,
        }
    }

    #[test]
    fn predicted_runtime_grows_with_load_and_relative_request_size() {
        let params = SchedulerParams::default();
        let big_worker = sample_worker("w1", 16.0, 16.0);
        let small_worker = sample_worker("w2", 2.0, 2.0);
        let task = sample_task(10);
        let on_big = predicted_runtime(5.0, &task, &big_worker, 0.0, &params);
        let on_small = predicted_runtime(5.0, &task, &small_worker, 0.0, &params);
        assert!(on_small > on_big, "a relatively larger request should predict a longer runtime");

        let on_loaded = predicted_runtime(5.0, &task, &big_worker, 0.9, &params);
        assert!(on_loaded > on_big, "higher load should predict a longer runtime");
    }

    #[test]
    fn round_robin_cycles_through_eligible_workers() {
        let registry_stub: Vec<Worker> = vec![sample_worker("w1", 4.0, 4.0), sample_worker("w2", 4.0, 4.0)];
        let cursor = AtomicUsize::new(0);
        let pick = |c: &AtomicUsize| {
            let idx = c.fetch_add(1, Ordering::Relaxed) % registry_stub.len();
            registry_stub[idx].id.clone()
        };
        assert_eq!(pick(&cursor), "w1");
        assert_eq!(pick(&cursor), "w2");
        assert_eq!(pick(&cursor), "w1");
    }

    async fn test_scheduler() -> (Arc<Scheduler>, Arc<WorkerRegistry>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        let db = Arc::new(AsyncMutex::new(db));
        let registry = Arc::new(WorkerRegistry::new(Arc::clone(&db), 30, false));
        let queue = Arc::new(TaskQueue::new(Arc::clone(&db)));
        let tau_store = {
            let mut scratch = MasterDatabase::new(dir.path(), 5).unwrap();
            let conn = scratch.workers().unwrap();
            Arc::new(TauStore::load(conn, 0.2).unwrap())
        };
        let telemetry = TelemetryManager::new(Arc::clone(&registry), 8);
        let rpc = Arc::new(WorkerRpcClient::new(String::new(), 3, 3).unwrap());
        let pipeline = AssignmentPipeline::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&tau_store),
            Arc::clone(&telemetry),
            Arc::clone(&db),
            rpc,
            10,
        );
        let params = Arc::new(AsyncRwLock::new(SchedulerParams::default()));
        let scheduler = Scheduler::new(Arc::clone(&registry), queue, tau_store, telemetry, pipeline, params, 1);
        (scheduler, registry, dir)
    }

    /// Mirrors Scenario 5's fallback clause: when every candidate RTS found
    /// eligible has gone stale by the time it's scored (here, allocated away
    /// by a concurrent dispatch), RTS has genuinely failed to select a
    /// worker and must fall back to round-robin, logging
    /// `rts→round-robin-fallback`.
    #[tokio::test]
    async fn select_rts_falls_back_to_round_robin_when_candidates_go_stale_mid_pass() {
        let (scheduler, registry, _dir) = test_scheduler().await;
        let total = ResourceVector { cpu: 4.0, mem: 4.0, storage: 0.0, gpu: 0.0 };
        registry.register_worker("w1", "http://x", total).unwrap();
        registry.register_worker("w2", "http://y", total).unwrap();

        let task = sample_task(10);
        let eligible = registry.eligible_workers(&task.resources);
        assert_eq!(eligible.len(), 2, "both workers should start out eligible");

        // Simulate a concurrent dispatch exhausting both workers' capacity
        // between the eligibility snapshot and RTS scoring.
        registry.allocate("w1", &total).unwrap();
        registry.allocate("w2", &total).unwrap();

        let params = SchedulerParams::default();
        match scheduler.select_rts(&task, &eligible, &params) {
            Selection::RoundRobin(_) => {}
            _ => panic!("expected a round-robin fallback once every candidate went stale"),
        }
    }
}
