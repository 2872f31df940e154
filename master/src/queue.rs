//! Task Queue & Status Machine (component D) — FIFO admission and the single
//! chokepoint that stamps every status transition.
//!
//! Unlike the registry's per-field mutations, every legal move through
//! `pending → queued → running → {completed, failed}` or `→ cancelled` goes
//! through `transition`, so no call site can forget to stamp a timestamp.
//! Mirrors the teacher's submodule-per-table persistence pattern, with an
//! in-memory cache kept under a single mutex (spec §5: "task queue: single
//! mutex plus a condition/signal channel for the scheduler").

use std::collections::HashMap;
use std::sync::Arc;

use shared::model::{Task, TaskStatus};
use shared::utils::current_timestamp;
use shared::SchedulerError;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{info, warn};

use crate::database::{db_tasks, MasterDatabase};

pub struct TaskQueue {
    tasks: AsyncMutex<HashMap<String, Task>>,
    db: Arc<AsyncMutex<MasterDatabase>>,
    /// Woken on enqueue, heartbeat-driven completion, or a reported result —
    /// the scheduler's single wakeup source besides its periodic tick.
    pub notify: Notify,
}

/// Returns whether `from -> to` is one of the legal edges in §4.4's diagram.
fn is_legal_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    if from.is_terminal() {
        return false;
    }
    match (from, to) {
        (Pending, Queued) => true,
        (Queued, Running) => true,
        (Running, Completed) => true,
        (Running, Failed) => true,
        (Pending, Cancelled) | (Queued, Cancelled) | (Running, Cancelled) => true,
        _ => false,
    }
}

impl TaskQueue {
    pub fn new(db: Arc<AsyncMutex<MasterDatabase>>) -> Self {
        Self {
            tasks: AsyncMutex::new(HashMap::new()),
            db,
            notify: Notify::new(),
        }
    }

    pub async fn load_from_db(&self) -> anyhow::Result<()> {
        let rows = {
            let mut db = self.db.lock().await;
            let conn = db.workers()?;
            db_tasks::list_by_status(conn, None)?
        };
        let count = rows.len();
        let mut tasks = self.tasks.lock().await;
        for t in rows {
            tasks.insert(t.id.clone(), t);
        }
        info!(count, "loaded tasks from persisted state");
        Ok(())
    }

    /// `SubmitTask`: admits a brand-new task at `pending`, FIFO by
    /// `submitted_at`. Wakes the scheduler.
    pub async fn submit(&self, task: Task) -> anyhow::Result<()> {
        {
            let mut db = self.db.lock().await;
            let conn = db.workers()?;
            db_tasks::insert(conn, &task)?;
        }
        self.tasks.lock().await.insert(task.id.clone(), task);
        self.notify.notify_one();
        Ok(())
    }

    /// The single chokepoint for every status change. Stamps the timestamp
    /// implied by `to` and persists via `db_tasks::update_transition`.
    pub async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        assigned_worker: Option<&str>,
    ) -> anyhow::Result<Task> {
        let now = current_timestamp();
        let updated = {
            let mut tasks = self.tasks.lock().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| SchedulerError::NotFound(format!("task '{task_id}' not found")))?;
            if !is_legal_transition(task.status, to) {
                return Err(SchedulerError::Validation(format!(
                    "illegal transition {} -> {} for task '{task_id}'",
                    task.status, to
                ))
                .into());
            }
            task.status = to;
            match to {
                TaskStatus::Queued => {}
                TaskStatus::Running => {
                    task.started_at = Some(now);
                    if let Some(w) = assigned_worker {
                        task.assigned_worker = Some(w.to_string());
                    }
                    task.assigned_at.get_or_insert(now);
                }
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                    task.completed_at = Some(now);
                }
                TaskStatus::Pending => {}
            }
            task.clone()
        };

        let (assigned_at, started_at, completed_at, worker) = (
            updated.assigned_at,
            updated.started_at,
            updated.completed_at,
            updated.assigned_worker.as_deref(),
        );
        let mut db = self.db.lock().await;
        if let Ok(conn) = db.workers() {
            if let Err(e) =
                db_tasks::update_transition(conn, task_id, to, assigned_at, started_at, completed_at, worker)
            {
                warn!(%task_id, error = ?e, "failed to persist task transition");
            }
        }
        Ok(updated)
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// Pending tasks in FIFO admission order, for the scheduler to pop from
    /// the head.
    pub async fn list_pending_fifo(&self) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        let mut pending: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.submitted_at);
        pending
    }

    pub async fn list_by_status(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        let mut out: Vec<Task> = match status {
            Some(s) => tasks.values().filter(|t| t.status == s).cloned().collect(),
            None => tasks.values().cloned().collect(),
        };
        out.sort_by_key(|t| t.submitted_at);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::{ResourceVector, TaskType};
    use tempfile::TempDir;

    async fn test_queue() -> (TaskQueue, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut db = MasterDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        (TaskQueue::new(Arc::new(AsyncMutex::new(db))), dir)
    }

    fn sample_task(id: &str, submitted_at: u64) -> Task {
        Task {
            id: id.to_string(),
            user: "alice".to_string(),
            name: "job".to_string(),
            image: "alpine".to_string(),
            command: None,
            resources: ResourceVector::default(),
            status: TaskStatus::Pending,
            submitted_at,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            assigned_worker: None,
            task_type: TaskType::CpuLight,
            tau_at_submission: 5.0,
            sla_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn submit_then_fifo_order_is_by_submitted_at() {
        let (queue, _dir) = test_queue().await;
        queue.submit(sample_task("t1", 200)).await.unwrap();
        queue.submit(sample_task("t2", 100)).await.unwrap();
        let pending = queue.list_pending_fifo().await;
        assert_eq!(pending[0].id, "t2");
        assert_eq!(pending[1].id, "t1");
    }

    #[tokio::test]
    async fn legal_transition_chain_stamps_timestamps() {
        let (queue, _dir) = test_queue().await;
        queue.submit(sample_task("t1", 100)).await.unwrap();
        queue.transition("t1", TaskStatus::Queued, None).await.unwrap();
        let running = queue.transition("t1", TaskStatus::Running, Some("w1")).await.unwrap();
        assert!(running.started_at.is_some());
        assert_eq!(running.assigned_worker.as_deref(), Some("w1"));
        let completed = queue.transition("t1", TaskStatus::Completed, None).await.unwrap();
        assert!(completed.completed_at.is_some());
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let (queue, _dir) = test_queue().await;
        queue.submit(sample_task("t1", 100)).await.unwrap();
        assert!(queue.transition("t1", TaskStatus::Running, None).await.is_err());
    }

    #[tokio::test]
    async fn cancel_allowed_from_pending_queued_and_running() {
        let (queue, _dir) = test_queue().await;
        queue.submit(sample_task("t1", 100)).await.unwrap();
        queue.transition("t1", TaskStatus::Cancelled, None).await.unwrap();

        queue.submit(sample_task("t2", 100)).await.unwrap();
        queue.transition("t2", TaskStatus::Queued, None).await.unwrap();
        queue.transition("t2", TaskStatus::Cancelled, None).await.unwrap();

        queue.submit(sample_task("t3", 100)).await.unwrap();
        queue.transition("t3", TaskStatus::Queued, None).await.unwrap();
        queue.transition("t3", TaskStatus::Running, Some("w1")).await.unwrap();
        queue.transition("t3", TaskStatus::Cancelled, None).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_states_are_absorbing() {
        let (queue, _dir) = test_queue().await;
        queue.submit(sample_task("t1", 100)).await.unwrap();
        queue.transition("t1", TaskStatus::Cancelled, None).await.unwrap();
        assert!(queue.transition("t1", TaskStatus::Queued, None).await.is_err());
    }
}
