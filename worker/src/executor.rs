//! Worker Executor (component I) — runs one accepted task to completion
//! under Docker via `bollard`.
//!
//! Per spec §4.9/§5: container execution is spawned under a task rooted at
//! the worker process's own lifetime, never under the inbound `AssignTask`
//! request's context — otherwise the container would be torn down the
//! instant the dispatch RPC returns. `run_task` is therefore always invoked
//! via a detached `tokio::spawn` from the RPC handler, and its final
//! `ReportTaskCompletion` call uses its own independently-timed-out client
//! call rather than anything tied to the original request.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::StreamExt;
use shared::api::{ReportTaskCompletionRequest, UploadOutputFilesChunk};
use shared::model::{Task, TaskStatus};
use shared::utils::encode_base64;
use tracing::{info, warn};

use crate::database::db_queue::RpcKind;
use crate::retry::RetryDispatcher;
use crate::rpc_client::RpcClient;
use crate::state::{RunningTask, WorkerState};

const GIGABYTE: f64 = 1024.0 * 1024.0 * 1024.0;

enum WaitOutcome {
    Exited(i64),
    Cancelled,
    Errored(String),
}

pub struct Executor {
    docker: Docker,
    outputs_base_dir: String,
    cancel_grace_period_s: u64,
    upload_chunk_size_bytes: usize,
}

impl Executor {
    pub fn new(outputs_base_dir: String, cancel_grace_period_s: u64, upload_chunk_size_bytes: usize) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("failed to connect to the Docker daemon")?;
        Ok(Self { docker, outputs_base_dir, cancel_grace_period_s, upload_chunk_size_bytes })
    }

    fn host_output_dir(&self, task_id: &str) -> PathBuf {
        Path::new(&self.outputs_base_dir).join(task_id)
    }

    /// Runs `task` to completion and reports the result to the master.
    /// Must be invoked from a detached `tokio::spawn`, never inline with
    /// the `AssignTask` handler (see module docs).
    #[allow(clippy::too_many_arguments)]
    pub async fn run_task(
        self: Arc<Self>,
        task: Task,
        running: Arc<RunningTask>,
        rpc: Arc<RpcClient>,
        retry: Arc<RetryDispatcher>,
        worker_id: String,
        worker_state: Arc<WorkerState>,
    ) {
        let (status, exit_code) = match self.execute(&task, &running).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(task_id = %task.id, error = ?e, "task execution failed before a container status could be determined");
                running.push_log(format!("\n{e}\n").as_bytes());
                (TaskStatus::Failed, None)
            }
        };

        running.set_terminal(status);
        let (logs, logs_truncated) = running.logs.snapshot();

        if status == TaskStatus::Completed {
            if let Err(e) = self.upload_outputs(&task, &rpc, &retry).await {
                warn!(task_id = %task.id, error = ?e, "output upload failed, task result unaffected");
            }
        }

        let req = ReportTaskCompletionRequest {
            task_id: task.id.clone(),
            worker_id,
            status,
            logs,
            logs_truncated,
            exit_code,
        };
        if let Err(e) = rpc.report_task_completion(&req).await {
            warn!(task_id = %task.id, error = ?e, "completion report failed, queuing for retry");
            if let Ok(payload) = serde_json::to_string(&req) {
                retry.enqueue(RpcKind::ReportTaskCompletion, payload).await;
            }
        }

        worker_state.remove(&task.id);
    }

    async fn execute(&self, task: &Task, running: &Arc<RunningTask>) -> Result<(TaskStatus, Option<i32>)> {
        let host_dir = self.host_output_dir(&task.id);
        std::fs::create_dir_all(&host_dir)
            .with_context(|| format!("failed to create output directory {}", host_dir.display()))?;

        self.pull_image(&task.image).await.context("image pull failed")?;

        let container_name = format!("task-{}", task.id);
        let cmd = task
            .command
            .as_ref()
            .map(|c| vec!["/bin/sh".to_string(), "-c".to_string(), c.clone()]);

        let device_requests = if task.resources.gpu > 0.0 {
            Some(vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }])
        } else {
            None
        };

        let host_config = HostConfig {
            nano_cpus: Some((task.resources.cpu * 1e9) as i64),
            memory: Some((task.resources.mem * GIGABYTE) as i64),
            binds: Some(vec![format!("{}:/output", host_dir.display())]),
            device_requests,
            ..Default::default()
        };

        let config = Config {
            image: Some(task.image.clone()),
            cmd,
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: container_name, ..Default::default() };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .context("failed to create container")?;
        *running.container_id.lock().unwrap() = Some(created.id.clone());

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .context("failed to start container")?;

        let log_task = self.spawn_log_stream(created.id.clone(), Arc::clone(running));
        let wait_outcome = self.wait_or_cancel(&created.id, running).await;
        log_task.abort();

        let result = match wait_outcome {
            WaitOutcome::Exited(code) if code == 0 => Ok((TaskStatus::Completed, Some(code as i32))),
            WaitOutcome::Exited(code) => Ok((TaskStatus::Failed, Some(code as i32))),
            WaitOutcome::Cancelled => Ok((TaskStatus::Cancelled, None)),
            WaitOutcome::Errored(msg) => Err(anyhow::anyhow!(msg)),
        };

        if let Err(e) = self
            .docker
            .remove_container(&created.id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await
        {
            warn!(task_id = %task.id, container_id = %created.id, error = ?e, "failed to remove container");
        }

        result
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions { from_image: image.to_string(), ..Default::default() };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    fn spawn_log_stream(&self, container_id: String, running: Arc<RunningTask>) -> tokio::task::JoinHandle<()> {
        let docker = self.docker.clone();
        tokio::spawn(async move {
            let options = LogsOptions::<String> { follow: true, stdout: true, stderr: true, ..Default::default() };
            let mut stream = docker.logs(&container_id, Some(options));
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(output) => running.push_log(&output.into_bytes()),
                    Err(_) => break,
                }
            }
        })
    }

    /// Races container completion against cancellation. On cancel, stops
    /// the container gracefully (SIGTERM + `cancel_grace_period_s`) and
    /// force-kills it if it is still running afterward (spec §5: "always
    /// best-effort graceful then forceful").
    async fn wait_or_cancel(&self, container_id: &str, running: &Arc<RunningTask>) -> WaitOutcome {
        let mut cancel_rx = running.subscribe_cancel();
        if *cancel_rx.borrow() {
            return self.cancel_container(container_id).await;
        }

        let docker = self.docker.clone();
        let container_id_owned = container_id.to_string();
        let wait_fut = async move {
            let mut stream = docker.wait_container(&container_id_owned, None::<WaitContainerOptions<String>>);
            match stream.next().await {
                Some(Ok(resp)) => WaitOutcome::Exited(resp.status_code),
                Some(Err(e)) => WaitOutcome::Errored(e.to_string()),
                None => WaitOutcome::Errored("container wait stream ended with no result".to_string()),
            }
        };

        tokio::select! {
            outcome = wait_fut => outcome,
            _ = cancel_rx.changed() => self.cancel_container(container_id).await,
        }
    }

    async fn cancel_container(&self, container_id: &str) -> WaitOutcome {
        let stop_opts = StopContainerOptions { t: self.cancel_grace_period_s as i64 };
        if let Err(e) = self.docker.stop_container(container_id, Some(stop_opts)).await {
            warn!(container_id, error = ?e, "graceful stop failed, attempting forceful kill");
            if let Err(e) = self.docker.kill_container::<String>(container_id, None::<KillContainerOptions<String>>).await {
                warn!(container_id, error = ?e, "forceful kill also failed");
            }
        }
        WaitOutcome::Cancelled
    }

    /// Tars and gzips `/output`'s host directory, then uploads it in
    /// `upload_chunk_size_bytes` chunks (spec §4.7: "≤ 1 MB").
    async fn upload_outputs(&self, task: &Task, rpc: &RpcClient, retry: &RetryDispatcher) -> Result<()> {
        let host_dir = self.host_output_dir(&task.id);
        let archive = Self::build_archive(&host_dir)?;
        if archive.is_empty() {
            return Ok(());
        }

        let chunks: Vec<&[u8]> = archive.chunks(self.upload_chunk_size_bytes.max(1)).collect();
        let total = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let request = UploadOutputFilesChunk {
                task_id: task.id.clone(),
                user: task.user.clone(),
                task_name: task.name.clone(),
                submitted_at: task.submitted_at,
                chunk_base64: encode_base64(chunk),
                is_last: i + 1 == total,
            };
            if let Err(e) = rpc.upload_output_files_chunk(&request).await {
                warn!(task_id = %task.id, chunk = i, error = ?e, "output chunk upload failed, queuing for retry");
                if let Ok(payload) = serde_json::to_string(&request) {
                    retry.enqueue(RpcKind::UploadOutputFiles, payload).await;
                }
            }
        }
        info!(task_id = %task.id, bytes = archive.len(), "output upload complete");
        Ok(())
    }

    fn build_archive(host_dir: &Path) -> Result<Vec<u8>> {
        if !host_dir.exists() {
            return Ok(Vec::new());
        }
        let gz = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(gz);
        builder
            .append_dir_all(".", host_dir)
            .with_context(|| format!("failed to tar output directory {}", host_dir.display()))?;
        let gz = builder.into_inner().context("failed to finalize tar archive")?;
        Ok(gz.finish().context("failed to finalize gzip stream")?)
    }
}

