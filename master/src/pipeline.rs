//! Assignment Pipeline (component F) — turns a scheduler selection into a
//! dispatched task, and handles cancellation and completion reporting.
//!
//! Reserve-then-dispatch, release-on-error (spec §4.6's Open Question
//! resolution): resources are reserved and the task is already marked
//! `running` before the RPC goes out, so a crash between reservation and RPC
//! delivery is recoverable by the Resource Reconciler rather than silently
//! losing the allocation.

use std::sync::Arc;

use shared::api::AssignTaskOutcome;
use shared::model::{Assignment, TaskResult, TaskStatus, Worker};
use shared::utils::current_timestamp;
use shared::SchedulerError;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::database::{db_assignments, MasterDatabase};
use crate::queue::TaskQueue;
use crate::registry::WorkerRegistry;
use crate::rpc_client::WorkerRpcClient;
use crate::tau_store::TauStore;
use crate::telemetry::TelemetryManager;

pub struct AssignmentPipeline {
    registry: Arc<WorkerRegistry>,
    queue: Arc<TaskQueue>,
    tau_store: Arc<TauStore>,
    telemetry: Arc<TelemetryManager>,
    db: Arc<AsyncMutex<MasterDatabase>>,
    rpc: Arc<WorkerRpcClient>,
    cancel_grace_period_s: u64,
}

impl AssignmentPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        queue: Arc<TaskQueue>,
        tau_store: Arc<TauStore>,
        telemetry: Arc<TelemetryManager>,
        db: Arc<AsyncMutex<MasterDatabase>>,
        rpc: Arc<WorkerRpcClient>,
        cancel_grace_period_s: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            queue,
            tau_store,
            telemetry,
            db,
            rpc,
            cancel_grace_period_s,
        })
    }

    /// Steps 1-5 of §4.6. Step 1 (re-check fit under the registry lock) is
    /// folded into `allocate`, which itself re-verifies availability
    /// atomically; a task that no longer fits is simply left `pending` for
    /// the next scheduling pass rather than requeued explicitly, since it
    /// never left the `pending` state.
    pub async fn dispatch(&self, task: shared::model::Task, worker: Worker) -> anyhow::Result<()> {
        if let Err(e) = self.registry.allocate(&worker.id, &task.resources) {
            info!(task_id = %task.id, worker_id = %worker.id, error = ?e, "worker no longer fits task, leaving pending");
            return Ok(());
        }

        let load_at_start = self
            .telemetry
            .snapshot(&worker.id)
            .map(|s| (s.cpu_usage + s.mem_usage + s.gpu_usage) / 3.0)
            .unwrap_or(0.0);
        let assignment = Assignment {
            task_id: task.id.clone(),
            worker_id: worker.id.clone(),
            assigned_at: current_timestamp(),
            load_at_start,
        };
        {
            let mut db = self.db.lock().await;
            if let Ok(conn) = db.workers() {
                if let Err(e) = db_assignments::insert_once(conn, &assignment) {
                    warn!(task_id = %task.id, error = ?e, "failed to persist assignment");
                }
            }
        }

        self.queue
            .transition(&task.id, TaskStatus::Running, Some(&worker.id))
            .await?;

        match self.rpc.assign_task(&worker.address, &task).await {
            Ok(resp) if resp.outcome == AssignTaskOutcome::Accepted => {
                info!(task_id = %task.id, worker_id = %worker.id, "task dispatched");
                Ok(())
            }
            Ok(resp) => {
                self.fail_dispatch(&task.id, &worker, &task.resources, resp.reason.unwrap_or_default())
                    .await
            }
            Err(e) => {
                self.fail_dispatch(&task.id, &worker, &task.resources, e.to_string())
                    .await
            }
        }
    }

    async fn fail_dispatch(
        &self,
        task_id: &str,
        worker: &Worker,
        resources: &shared::model::ResourceVector,
        reason: String,
    ) -> anyhow::Result<()> {
        warn!(task_id, worker_id = %worker.id, reason, "dispatch rejected or RPC failed, not requeued");
        self.registry.release(&worker.id, resources)?;
        self.queue.transition(task_id, TaskStatus::Failed, None).await?;
        self.write_result(task_id, &worker.id, TaskStatus::Failed, reason, false, None)
            .await;
        Ok(())
    }

    /// §4.6 cancellation: idempotent, best-effort graceful-then-forceful on
    /// the worker side (the worker owns the grace-period timer itself).
    pub async fn cancel(&self, task_id: &str) -> anyhow::Result<bool> {
        let task = match self.queue.get(task_id).await {
            Some(t) => t,
            None => return Ok(false),
        };
        if task.status.is_terminal() {
            return Ok(true);
        }
        if task.status == TaskStatus::Running {
            if let Some(worker_id) = &task.assigned_worker {
                if let Some(worker) = self.registry.snapshot(worker_id) {
                    if let Err(e) = self.rpc.cancel_task(&worker.address, task_id).await {
                        warn!(task_id, worker_id, error = ?e, "cancel RPC failed");
                    }
                    self.registry.release(worker_id, &task.resources)?;
                }
            }
        }
        self.queue.transition(task_id, TaskStatus::Cancelled, None).await?;
        Ok(true)
    }

    /// §4.6 completion report: idempotent, releases resources, writes the
    /// Result, trains τ on successful completions only, wakes the scheduler.
    pub async fn report_completion(
        &self,
        task_id: &str,
        worker_id: &str,
        status: TaskStatus,
        logs: String,
        logs_truncated: bool,
        exit_code: Option<i32>,
    ) -> anyhow::Result<()> {
        if !status.is_terminal() {
            return Err(SchedulerError::Validation(format!(
                "completion report for '{task_id}' carries non-terminal status {status}"
            ))
            .into());
        }
        let task = self
            .queue
            .get(task_id)
            .await
            .ok_or_else(|| SchedulerError::NotFound(format!("task '{task_id}' not found")))?;

        if task.status.is_terminal() {
            // Already finalized by an earlier report; discard duplicate.
            return Ok(());
        }

        self.registry.release(worker_id, &task.resources)?;
        let inserted = self
            .write_result(task_id, worker_id, status, logs, logs_truncated, exit_code)
            .await;

        if inserted && status == TaskStatus::Completed {
            if let (Some(started_at), completed_at) = (task.started_at, current_timestamp()) {
                let actual_runtime = completed_at.saturating_sub(started_at) as f64;
                if actual_runtime > 0.0 {
                    let mut db = self.db.lock().await;
                    if let Ok(conn) = db.workers() {
                        self.tau_store.update(conn, task.task_type, actual_runtime);
                    }
                }
            }
        }

        self.queue.transition(task_id, status, None).await?;
        self.queue.notify.notify_one();
        Ok(())
    }

    async fn write_result(
        &self,
        task_id: &str,
        worker_id: &str,
        status: TaskStatus,
        logs: String,
        logs_truncated: bool,
        exit_code: Option<i32>,
    ) -> bool {
        let result = TaskResult {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            status,
            logs,
            logs_truncated,
            exit_code,
            completed_at: current_timestamp(),
        };
        let mut db = self.db.lock().await;
        match db.workers() {
            Ok(conn) => match crate::database::db_results::insert_once(conn, &result) {
                Ok(inserted) => inserted,
                Err(e) => {
                    warn!(task_id, error = ?e, "failed to persist result");
                    false
                }
            },
            Err(e) => {
                warn!(task_id, error = ?e, "failed to open connection for result");
                false
            }
        }
    }

    pub fn cancel_grace_period_s(&self) -> u64 {
        self.cancel_grace_period_s
    }

    /// §4.2: "Unregister(id): remove; any running assignments for that
    /// worker are marked failed." Called before the registry drops the
    /// worker record, so resources don't need releasing on it.
    pub async fn fail_running_tasks_for_worker(&self, worker_id: &str) -> anyhow::Result<()> {
        for task in self.queue.list_by_status(Some(TaskStatus::Running)).await {
            if task.assigned_worker.as_deref() != Some(worker_id) {
                continue;
            }
            warn!(task_id = %task.id, worker_id, "worker removed while task running, marking failed");
            self.queue.transition(&task.id, TaskStatus::Failed, None).await?;
            self.write_result(
                &task.id,
                worker_id,
                TaskStatus::Failed,
                "worker unregistered while task was running".to_string(),
                false,
                None,
            )
            .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::{ResourceVector, Task, TaskType};
    use tempfile::TempDir;

    async fn test_pipeline() -> (Arc<AssignmentPipeline>, Arc<WorkerRegistry>, Arc<TaskQueue>, TempDir) {
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
            tau_store,
            telemetry,
            db,
            rpc,
            10,
        );
        (pipeline, registry, queue, dir)
    }

    fn sample_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            user: "alice".to_string(),
            name: "job".to_string(),
            image: "alpine".to_string(),
            command: None,
            resources: ResourceVector { cpu: 1.0, mem: 1.0, storage: 0.0, gpu: 0.0 },
            status: TaskStatus::Pending,
            submitted_at: 0,
            assigned_at: None,
            started_at: Some(0),
            completed_at: None,
            assigned_worker: None,
            task_type: TaskType::CpuLight,
            tau_at_submission: 5.0,
            sla_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn dispatch_leaves_task_pending_when_worker_no_longer_fits() {
        let (pipeline, registry, queue, _dir) = test_pipeline().await;
        let total = ResourceVector { cpu: 1.0, mem: 1.0, storage: 0.0, gpu: 0.0 };
        registry.register_worker("w1", "http://127.0.0.1:1", total).unwrap();
        // Exhaust the worker's capacity so the re-check inside `allocate` fails.
        registry.allocate("w1", &total).unwrap();

        let task = sample_task("t1");
        queue.submit(task.clone()).await.unwrap();
        let worker = registry.snapshot("w1").unwrap();
        pipeline.dispatch(task, worker).await.unwrap();

        assert_eq!(queue.get("t1").await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_pending_task_is_immediate_no_rpc() {
        let (pipeline, _registry, queue, _dir) = test_pipeline().await;
        queue.submit(sample_task("t1")).await.unwrap();
        assert!(pipeline.cancel("t1").await.unwrap());
        assert_eq!(queue.get("t1").await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_unknown_task_returns_false() {
        let (pipeline, _registry, _queue, _dir) = test_pipeline().await;
        assert!(!pipeline.cancel("nope").await.unwrap());
    }

    #[tokio::test]
    async fn cancel_already_terminal_task_is_idempotent_noop() {
        let (pipeline, _registry, queue, _dir) = test_pipeline().await;
        queue.submit(sample_task("t1")).await.unwrap();
        pipeline.cancel("t1").await.unwrap();
        assert!(pipeline.cancel("t1").await.unwrap());
    }

    #[tokio::test]
    async fn report_completion_is_idempotent_and_trains_tau_on_success_only() {
        let (pipeline, registry, queue, _dir) = test_pipeline().await;
        let total = ResourceVector { cpu: 4.0, mem: 4.0, storage: 0.0, gpu: 0.0 };
        registry.register_worker("w1", "http://127.0.0.1:1", total).unwrap();
        registry.allocate("w1", &ResourceVector { cpu: 1.0, mem: 1.0, storage: 0.0, gpu: 0.0 }).unwrap();

        let mut task = sample_task("t1");
        task.status = TaskStatus::Pending;
        queue.submit(task).await.unwrap();
        queue.transition("t1", TaskStatus::Queued, None).await.unwrap();
        queue.transition("t1", TaskStatus::Running, Some("w1")).await.unwrap();

        pipeline
            .report_completion("t1", "w1", TaskStatus::Completed, "ok".to_string(), false, Some(0))
            .await
            .unwrap();
        assert_eq!(queue.get("t1").await.unwrap().status, TaskStatus::Completed);
        assert_eq!(registry.snapshot("w1").unwrap().allocated.cpu, 0.0);

        // Duplicate report is discarded, not an error.
        pipeline
            .report_completion("t1", "w1", TaskStatus::Failed, "ignored".to_string(), false, Some(1))
            .await
            .unwrap();
        assert_eq!(queue.get("t1").await.unwrap().status, TaskStatus::Completed);
    }
}
