//! Outbound RPC client used by the worker to call into the master
//! (`RegisterWorker`, `Heartbeat`, `ReportTaskCompletion`,
//! `UploadOutputFiles`).
//!
//! One shared `reqwest::Client` for connection pooling, mirroring the
//! master's own `WorkerRpcClient`. Every call here is also replayable from
//! the retry queue (`database::db_queue`) since each request type is plain
//! JSON-serializable.

use std::time::Duration;

use shared::api::{
    headers, master_rpc_endpoints, HeartbeatRequest, HeartbeatResponse, RegisterWorkerRequest,
    RegisterWorkerResponse, ReportTaskCompletionRequest, ReportTaskCompletionResponse,
    UploadOutputFilesChunk, UploadOutputFilesResponse,
};
use shared::model::{ResourceVector, UsageVector};

pub struct RpcClient {
    http: reqwest::Client,
    master_url: String,
    api_key: String,
    worker_id: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(master_url: String, api_key: String, worker_id: String, timeout_s: u64) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            master_url,
            api_key,
            worker_id,
            timeout: Duration::from_secs(timeout_s.max(1)),
        })
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header(headers::WORKER_ID, &self.worker_id);
        if self.api_key.is_empty() {
            builder
        } else {
            builder.header(headers::API_KEY, &self.api_key)
        }
    }

    pub async fn register_worker(&self, id: &str, address: &str, total: ResourceVector) -> anyhow::Result<RegisterWorkerResponse> {
        let req = RegisterWorkerRequest { id: id.to_string(), address: address.to_string(), total };
        self.register_worker_raw(&req).await
    }

    pub async fn register_worker_raw(&self, req: &RegisterWorkerRequest) -> anyhow::Result<RegisterWorkerResponse> {
        let url = format!("{}{}", self.master_url, master_rpc_endpoints::REGISTER_WORKER);
        let resp = self
            .authed(self.http.post(&url).timeout(self.timeout))
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn heartbeat(&self, usage: UsageVector, running_task_ids: Vec<String>) -> anyhow::Result<HeartbeatResponse> {
        let req = HeartbeatRequest { worker_id: self.worker_id.clone(), usage, running_task_ids };
        self.heartbeat_raw(&req).await
    }

    pub async fn heartbeat_raw(&self, req: &HeartbeatRequest) -> anyhow::Result<HeartbeatResponse> {
        let url = format!("{}{}", self.master_url, master_rpc_endpoints::HEARTBEAT);
        let resp = self
            .authed(self.http.post(&url).timeout(self.timeout))
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn report_task_completion(&self, req: &ReportTaskCompletionRequest) -> anyhow::Result<ReportTaskCompletionResponse> {
        let url = format!("{}{}", self.master_url, master_rpc_endpoints::REPORT_TASK_COMPLETION);
        let resp = self
            .authed(self.http.post(&url).timeout(self.timeout))
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn upload_output_files_chunk(&self, chunk: &UploadOutputFilesChunk) -> anyhow::Result<UploadOutputFilesResponse> {
        let url = format!("{}{}", self.master_url, master_rpc_endpoints::UPLOAD_OUTPUT_FILES);
        let resp = self
            .authed(self.http.post(&url).timeout(self.timeout))
            .json(chunk)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}
