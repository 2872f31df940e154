//! Core data model: Worker, Task, Assignment, Result, τ-entry, File metadata.
//!
//! These are the logical entities every persistence submodule on the master
//! stores and every RPC payload on the wire ultimately carries. Storage
//! format is an implementation choice (we use SQLite); these structs are the
//! shape every caller agrees on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the six fixed task types the τ-store and scheduler reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    CpuLight,
    CpuHeavy,
    MemoryHeavy,
    GpuInference,
    GpuTraining,
    Mixed,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::CpuLight,
        TaskType::CpuHeavy,
        TaskType::MemoryHeavy,
        TaskType::GpuInference,
        TaskType::GpuTraining,
        TaskType::Mixed,
    ];

    /// Parse a free-form tag string, falling back to `Mixed` for anything
    /// unrecognized (§4.1: "empty/unknown types map to mixed").
    pub fn parse_or_mixed(tag: &str) -> Self {
        match tag {
            "cpu-light" => TaskType::CpuLight,
            "cpu-heavy" => TaskType::CpuHeavy,
            "memory-heavy" => TaskType::MemoryHeavy,
            "gpu-inference" => TaskType::GpuInference,
            "gpu-training" => TaskType::GpuTraining,
            _ => TaskType::Mixed,
        }
    }

    /// Infer task type from requested resources when the submitter omits a
    /// tag. Decision table from §4.1, evaluated top to bottom.
    pub fn infer(req: &ResourceVector) -> Self {
        if req.gpu >= 2.0 && req.cpu >= 4.0 {
            TaskType::GpuTraining
        } else if req.gpu > 0.0 {
            TaskType::GpuInference
        } else if req.mem >= 8.0 {
            TaskType::MemoryHeavy
        } else if req.cpu >= 4.0 {
            TaskType::CpuHeavy
        } else if req.cpu > 0.0 || req.mem > 0.0 {
            TaskType::CpuLight
        } else {
            TaskType::Mixed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CpuLight => "cpu-light",
            TaskType::CpuHeavy => "cpu-heavy",
            TaskType::MemoryHeavy => "memory-heavy",
            TaskType::GpuInference => "gpu-inference",
            TaskType::GpuTraining => "gpu-training",
            TaskType::Mixed => "mixed",
        }
    }

    /// Default τ seconds per the data model's fixed defaults.
    pub fn default_tau_seconds(&self) -> f64 {
        match self {
            TaskType::CpuLight => 5.0,
            TaskType::CpuHeavy => 15.0,
            TaskType::MemoryHeavy => 20.0,
            TaskType::GpuInference => 10.0,
            TaskType::GpuTraining => 60.0,
            TaskType::Mixed => 10.0,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// cpu (cores), memory (GiB), storage (GiB), gpu (cores/units) — used both
/// for totals, allocations, and per-task resource requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceVector {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub mem: f64,
    #[serde(default)]
    pub storage: f64,
    #[serde(default)]
    pub gpu: f64,
}

impl ResourceVector {
    /// Rejects a negative request on any resource (spec §7: "negative
    /// resources" is a `ValidationError`, rejected at the API boundary
    /// before it can ever reach the registry's allocation bookkeeping).
    pub fn validate(&self) -> Result<(), crate::SchedulerError> {
        if self.cpu < 0.0 || self.mem < 0.0 || self.storage < 0.0 || self.gpu < 0.0 {
            return Err(crate::SchedulerError::Validation(format!(
                "resource request cannot be negative: {self:?}"
            )));
        }
        Ok(())
    }

    pub fn fits_within(&self, available: &ResourceVector) -> bool {
        self.cpu <= available.cpu
            && self.mem <= available.mem
            && self.storage <= available.storage
            && self.gpu <= available.gpu
    }

    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu: (self.cpu - other.cpu).max(0.0),
            mem: (self.mem - other.mem).max(0.0),
            storage: (self.storage - other.storage).max(0.0),
            gpu: (self.gpu - other.gpu).max(0.0),
        }
    }

    pub fn add(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu: self.cpu + other.cpu,
            mem: self.mem + other.mem,
            storage: self.storage + other.storage,
            gpu: self.gpu + other.gpu,
        }
    }
}

/// Fractional usage snapshot in [0, 1] for cpu/mem/gpu, as reported by a
/// worker's heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageVector {
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub mem_usage: f64,
    #[serde(default)]
    pub gpu_usage: f64,
}

impl UsageVector {
    /// "Load of a worker": mean of current cpu/mem/gpu usage fractions.
    pub fn load(&self) -> f64 {
        (self.cpu_usage + self.mem_usage + self.gpu_usage) / 3.0
    }
}

/// Authoritative worker record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub address: String,
    pub total: ResourceVector,
    pub allocated: ResourceVector,
    pub active: bool,
    pub last_heartbeat: u64,
    pub registered_at: u64,
}

impl Worker {
    pub fn available(&self) -> ResourceVector {
        ResourceVector {
            cpu: (self.total.cpu - self.allocated.cpu).max(0.0),
            mem: (self.total.mem - self.allocated.mem).max(0.0),
            storage: (self.total.storage - self.allocated.storage).max(0.0),
            gpu: (self.total.gpu - self.allocated.gpu).max(0.0),
        }
    }

    /// A worker with zero total capacity is a pre-registration placeholder
    /// and is never eligible for a task (§8 boundary behavior).
    pub fn is_placeholder(&self) -> bool {
        self.total.cpu == 0.0 && self.total.mem == 0.0 && self.total.gpu == 0.0
    }

    pub fn is_eligible_for(&self, req: &ResourceVector) -> bool {
        self.active && req.fits_within(&self.available())
    }
}

/// Legal task lifecycle states (§4.4). Transitions enforced centrally in
/// `master::queue::transition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TaskStatus::Pending,
            "queued" => TaskStatus::Queued,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => return None,
        })
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user: String,
    pub name: String,
    pub image: String,
    pub command: Option<String>,
    pub resources: ResourceVector,
    pub status: TaskStatus,
    pub submitted_at: u64,
    pub assigned_at: Option<u64>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub assigned_worker: Option<String>,
    pub task_type: TaskType,
    /// τ (seconds) drawn from the τ-store at submission time; used for the
    /// task's deadline regardless of how τ subsequently drifts.
    pub tau_at_submission: f64,
    /// SLA multiplier k, in [1.5, 2.5].
    pub sla_multiplier: f64,
}

impl Task {
    pub fn deadline(&self) -> u64 {
        self.submitted_at + (self.sla_multiplier * self.tau_at_submission).round() as u64
    }
}

/// Written once at dispatch time, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: String,
    pub worker_id: String,
    pub assigned_at: u64,
    /// Normalized worker load (mean of cpu/mem/gpu usage fractions)
    /// captured at assignment time.
    pub load_at_start: f64,
}

/// Written exactly once per terminal task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub worker_id: String,
    pub status: TaskStatus,
    pub logs: String,
    pub logs_truncated: bool,
    pub exit_code: Option<i32>,
    pub completed_at: u64,
}

/// One record per task that produced output files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub task_id: String,
    pub user: String,
    pub task_name: String,
    pub submitted_at: u64,
    pub relative_paths: Vec<String>,
    pub storage_path: String,
    pub uploaded_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_task_type_follows_decision_table() {
        assert_eq!(
            TaskType::infer(&ResourceVector { cpu: 4.0, mem: 1.0, storage: 0.0, gpu: 2.0 }),
            TaskType::GpuTraining
        );
        assert_eq!(
            TaskType::infer(&ResourceVector { cpu: 1.0, mem: 1.0, storage: 0.0, gpu: 1.0 }),
            TaskType::GpuInference
        );
        assert_eq!(
            TaskType::infer(&ResourceVector { cpu: 1.0, mem: 8.0, storage: 0.0, gpu: 0.0 }),
            TaskType::MemoryHeavy
        );
        assert_eq!(
            TaskType::infer(&ResourceVector { cpu: 4.0, mem: 1.0, storage: 0.0, gpu: 0.0 }),
            TaskType::CpuHeavy
        );
        assert_eq!(
            TaskType::infer(&ResourceVector { cpu: 1.0, mem: 1.0, storage: 0.0, gpu: 0.0 }),
            TaskType::CpuLight
        );
        assert_eq!(
            TaskType::infer(&ResourceVector::default()),
            TaskType::Mixed
        );
    }

    #[test]
    fn worker_eligibility_requires_active_and_fit() {
        let mut w = Worker {
            id: "w1".into(),
            address: "http://localhost:9000".into(),
            total: ResourceVector { cpu: 4.0, mem: 8.0, storage: 100.0, gpu: 0.0 },
            allocated: ResourceVector::default(),
            active: true,
            last_heartbeat: 0,
            registered_at: 0,
        };
        let req = ResourceVector { cpu: 1.0, mem: 1.0, storage: 0.0, gpu: 0.0 };
        assert!(w.is_eligible_for(&req));
        w.active = false;
        assert!(!w.is_eligible_for(&req));
        w.active = true;
        w.allocated = w.total;
        assert!(!w.is_eligible_for(&req));
    }

    #[test]
    fn placeholder_worker_never_eligible() {
        let w = Worker {
            id: "w1".into(),
            address: "http://localhost:9000".into(),
            total: ResourceVector::default(),
            allocated: ResourceVector::default(),
            active: true,
            last_heartbeat: 0,
            registered_at: 0,
        };
        assert!(w.is_placeholder());
        assert!(!w.is_eligible_for(&ResourceVector::default()));
    }

    #[test]
    fn deadline_uses_submission_time_tau() {
        let t = Task {
            id: "t1".into(),
            user: "u".into(),
            name: "n".into(),
            image: "alpine".into(),
            command: None,
            resources: ResourceVector::default(),
            status: TaskStatus::Pending,
            submitted_at: 1000,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            assigned_worker: None,
            task_type: TaskType::CpuLight,
            tau_at_submission: 5.0,
            sla_multiplier: 2.0,
        };
        assert_eq!(t.deadline(), 1010);
    }
}
