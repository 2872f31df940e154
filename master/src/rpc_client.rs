//! Outbound RPC client used by the master to call into worker processes
//! (`AssignTask`, `CancelTask`, `MasterRegister`; log streaming lives in
//! `streaming.rs` since it needs a raw byte stream rather than a JSON
//! round-trip).
//!
//! One shared `reqwest::Client` (connection pooling, as the teacher's agent
//! does for its server calls), with the control-RPC and reconnect timeouts
//! set per call since they differ (§6: "3-10 s for control RPCs").

use std::time::Duration;

use shared::api::{
    headers, worker_endpoints, AssignTaskRequest, AssignTaskResponse, CancelTaskResponse,
    MasterRegisterRequest, MasterRegisterResponse,
};
use shared::model::Task;

pub struct WorkerRpcClient {
    http: reqwest::Client,
    api_key: String,
    control_timeout: Duration,
    reconnect_timeout: Duration,
}

impl WorkerRpcClient {
    pub fn new(api_key: String, control_timeout_s: u64, reconnect_timeout_s: u64) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            api_key,
            control_timeout: Duration::from_secs(control_timeout_s),
            reconnect_timeout: Duration::from_secs(reconnect_timeout_s),
        })
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            builder
        } else {
            builder.header(headers::API_KEY, &self.api_key)
        }
    }

    pub async fn assign_task(&self, worker_address: &str, task: &Task) -> anyhow::Result<AssignTaskResponse> {
        let url = format!("{worker_address}{}", worker_endpoints::ASSIGN_TASK);
        let req = self
            .authed(self.http.post(&url).timeout(self.control_timeout))
            .json(&AssignTaskRequest { task: task.clone() });
        let resp = req.send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn cancel_task(&self, worker_address: &str, task_id: &str) -> anyhow::Result<CancelTaskResponse> {
        let path = worker_endpoints::CANCEL_TASK.replace("{task_id}", task_id);
        let url = format!("{worker_address}{path}");
        let resp = self
            .authed(self.http.post(&url).timeout(self.control_timeout))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// §4.8: 3 s timeout, success logged by the caller, failure silent.
    pub async fn master_register(
        &self,
        worker_address: &str,
        master_id: &str,
        master_address: &str,
    ) -> anyhow::Result<MasterRegisterResponse> {
        let url = format!("{worker_address}{}", worker_endpoints::MASTER_REGISTER);
        let resp = self
            .authed(self.http.post(&url).timeout(self.reconnect_timeout))
            .json(&MasterRegisterRequest {
                master_id: master_id.to_string(),
                address: master_address.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}
