//! In-memory bookkeeping for tasks currently executing on this worker.
//!
//! Task assignment state does not survive a worker restart (§9: the master
//! rebuilds it via the Resource Reconciler and the next `AssignTask`), so
//! this is a plain in-memory registry rather than a database table.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use shared::model::{ResourceVector, TaskStatus};
use tokio::sync::{broadcast, watch};

use crate::ring_buffer::RingBuffer;

/// Shared handle to one in-flight task's live state.
pub struct RunningTask {
    pub container_id: std::sync::Mutex<Option<String>>,
    pub resources: ResourceVector,
    pub logs: Arc<RingBuffer>,
    pub log_tx: broadcast::Sender<Bytes>,
    cancel_tx: watch::Sender<bool>,
    terminal_tx: watch::Sender<Option<TaskStatus>>,
}

impl RunningTask {
    pub fn new(resources: ResourceVector, log_buffer_cap_bytes: usize, log_truncation_marker: String) -> Arc<Self> {
        let (log_tx, _rx) = broadcast::channel(256);
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let (terminal_tx, _terminal_rx) = watch::channel(None);
        Arc::new(Self {
            container_id: std::sync::Mutex::new(None),
            resources,
            logs: Arc::new(RingBuffer::new(log_buffer_cap_bytes, log_truncation_marker)),
            log_tx,
            cancel_tx,
            terminal_tx,
        })
    }

    pub fn push_log(&self, chunk: &[u8]) {
        self.logs.push(chunk);
        let _ = self.log_tx.send(Bytes::copy_from_slice(chunk));
    }

    pub fn request_cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancel_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Subscribes to cancellation; callers must check the receiver's
    /// current value immediately after subscribing, since a cancel issued
    /// before subscription does not fire `changed()`.
    pub fn subscribe_cancel(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Signals that the task has reached a terminal status, waking any
    /// `StreamTaskLogs` followers (see `api::follow_log_chunks`).
    pub fn set_terminal(&self, status: TaskStatus) {
        let _ = self.terminal_tx.send(Some(status));
    }

    /// Subscribes to the terminal-status signal; callers must check the
    /// receiver's current value immediately after subscribing, since a
    /// status set before subscription does not fire `changed()`.
    pub fn terminal_rx(&self) -> watch::Receiver<Option<TaskStatus>> {
        self.terminal_tx.subscribe()
    }
}

/// Registry of tasks currently running on this worker, keyed by task id.
pub struct WorkerState {
    running: RwLock<HashMap<String, Arc<RunningTask>>>,
}

impl WorkerState {
    pub fn new() -> Self {
        Self { running: RwLock::new(HashMap::new()) }
    }

    pub fn len(&self) -> usize {
        self.running.read().unwrap().len()
    }

    pub fn insert(&self, task_id: String, task: Arc<RunningTask>) {
        self.running.write().unwrap().insert(task_id, task);
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<RunningTask>> {
        self.running.read().unwrap().get(task_id).cloned()
    }

    pub fn remove(&self, task_id: &str) -> Option<Arc<RunningTask>> {
        self.running.write().unwrap().remove(task_id)
    }

    pub fn running_task_ids(&self) -> Vec<String> {
        self.running.read().unwrap().keys().cloned().collect()
    }

    /// Sums the resource requests of every currently-running task, for
    /// turning into the heartbeat's usage fractions (§4.2).
    pub fn total_running_resources(&self) -> ResourceVector {
        self.running
            .read()
            .unwrap()
            .values()
            .fold(ResourceVector::default(), |acc, t| acc.add(&t.resources))
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionOutcome {
    pub fn as_task_status(self) -> TaskStatus {
        match self {
            ExecutionOutcome::Completed => TaskStatus::Completed,
            ExecutionOutcome::Failed => TaskStatus::Failed,
            ExecutionOutcome::Cancelled => TaskStatus::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_roundtrip() {
        let state = WorkerState::new();
        let task = RunningTask::new(ResourceVector::default(), 1024, "[T]".to_string());
        state.insert("t1".to_string(), task);
        assert_eq!(state.len(), 1);
        assert!(state.get("t1").is_some());
        assert!(state.remove("t1").is_some());
        assert_eq!(state.len(), 0);
    }

    #[test]
    fn cancel_flag_is_observable() {
        let task = RunningTask::new(ResourceVector::default(), 1024, "[T]".to_string());
        assert!(!task.is_cancel_requested());
        task.request_cancel();
        assert!(task.is_cancel_requested());
    }

    #[test]
    fn terminal_status_is_observable_after_subscribe() {
        let task = RunningTask::new(ResourceVector::default(), 1024, "[T]".to_string());
        let rx = task.terminal_rx();
        assert_eq!(*rx.borrow(), None);
        task.set_terminal(TaskStatus::Completed);
        assert_eq!(*rx.borrow(), Some(TaskStatus::Completed));
    }

    #[test]
    fn total_running_resources_sums_across_tasks() {
        let state = WorkerState::new();
        let a = RunningTask::new(ResourceVector { cpu: 1.0, mem: 2.0, storage: 0.0, gpu: 0.0 }, 1024, "[T]".to_string());
        let b = RunningTask::new(ResourceVector { cpu: 3.0, mem: 1.0, storage: 0.0, gpu: 1.0 }, 1024, "[T]".to_string());
        state.insert("a".to_string(), a);
        state.insert("b".to_string(), b);
        let total = state.total_running_resources();
        assert_eq!(total.cpu, 4.0);
        assert_eq!(total.mem, 3.0);
        assert_eq!(total.gpu, 1.0);
    }
}
