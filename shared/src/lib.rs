//! Shared data structures, RPC contracts, and configuration for the task
//! scheduler's master and worker binaries.

pub mod api;
pub mod config;
pub mod defaults;
pub mod model;
pub mod utils;

// Re-export commonly used types for convenience
pub use api::ApiResponse;
pub use config::{MasterConfig, SchedulerParams, WorkerConfig};
pub use model::{
    Assignment, FileMetadata, ResourceVector, Task, TaskResult, TaskStatus, TaskType, UsageVector,
    Worker,
};

/// Result type alias used throughout the workspace.
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the task scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_imports() {
        // Smoke test ensuring every module compiles and is reachable.
    }
}
