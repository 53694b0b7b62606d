//! `HttpApiClient`: the concrete control-plane transport. `piped-core` ships
//! only the `ApiClient` trait and a `MockApiClient` test double; this binary
//! supplies the real adapter, the way the teacher's CLI owns the concrete
//! `reqwest::blocking` client (`registry.rs`'s `RegistryClient`) rather than
//! the library crate.

use std::time::Duration;

use piped_core::api::{ApiClient, ApiError, ApiResult};
use piped_core::retry::{RetryPolicy, calculate_delay};
use piped_core::types::{
    ApplicationId, ApplicationLiveState, Command, CommandId, CommandResult, Deployment,
    DeploymentId, DeploymentStatus, Stage, StageStatus, TriggerSource,
};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::json;

pub struct HttpApiClient {
    base_url: String,
    piped_key: String,
    http: Client,
}

impl HttpApiClient {
    pub fn new(base_url: &str, piped_key: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("piped-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), piped_key: piped_key.to_string(), http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        with_retry(|| {
            let resp = self
                .http
                .get(self.url(path))
                .bearer_auth(&self.piped_key)
                .send()
                .map_err(|err| ApiError::Transient(err.to_string()))?;
            parse_response(resp)
        })
    }

    fn post<B: Serialize, T: serde::de::DeserializeOwned>(&self, path: &str, body: &B) -> ApiResult<T> {
        with_retry(|| {
            let resp = self
                .http
                .post(self.url(path))
                .bearer_auth(&self.piped_key)
                .json(body)
                .send()
                .map_err(|err| ApiError::Transient(err.to_string()))?;
            parse_response(resp)
        })
    }
}

fn parse_response<T: serde::de::DeserializeOwned>(resp: reqwest::blocking::Response) -> ApiResult<T> {
    match resp.status() {
        StatusCode::OK | StatusCode::CREATED => {
            resp.json().map_err(|err| ApiError::Transient(format!("invalid response body: {err}")))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(ApiError::Unauthenticated(resp.status().to_string()))
        }
        StatusCode::NOT_FOUND => Err(ApiError::NotFound(resp.status().to_string())),
        status if status.is_server_error() => Err(ApiError::Transient(status.to_string())),
        status => Err(ApiError::Transient(format!("unexpected status: {status}"))),
    }
}

/// Retry a `Transient` failure with the control-plane's own backoff policy;
/// any other error kind is final. Mirrors the contract `ApiClient`'s doc
/// comment promises its implementations uphold.
fn with_retry<T>(mut call: impl FnMut() -> ApiResult<T>) -> ApiResult<T> {
    let config = RetryPolicy::Aggressive.to_config();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match call() {
            Ok(value) => return Ok(value),
            Err(ApiError::Transient(msg)) if attempt < config.max_attempts => {
                std::thread::sleep(calculate_delay(&config, attempt));
                let _ = &msg;
            }
            Err(err) => return Err(err),
        }
    }
}

impl ApiClient for HttpApiClient {
    fn ping(&self) -> ApiResult<()> {
        self.get("/v1/ping")
    }

    fn report_stat(&self, name: &str, value: f64) -> ApiResult<()> {
        self.post("/v1/stats", &json!({ "name": name, "value": value }))
    }

    fn list_applications(&self, project_id: &str) -> ApiResult<Vec<ApplicationId>> {
        self.get(&format!("/v1/projects/{project_id}/applications"))
    }

    fn report_application_sync_state(&self, application_id: &ApplicationId, deployment_id: &DeploymentId) -> ApiResult<()> {
        self.post(
            &format!("/v1/applications/{}/sync-state", application_id.0),
            &json!({ "deploymentId": deployment_id.0 }),
        )
    }

    fn report_application_live_state(&self, live_state: &ApplicationLiveState) -> ApiResult<()> {
        self.post(&format!("/v1/applications/{}/live-state", live_state.application_id.0), live_state)
    }

    fn list_not_completed_deployments(&self, piped_id: &str) -> ApiResult<Vec<Deployment>> {
        self.get(&format!("/v1/pipeds/{piped_id}/deployments/not-completed"))
    }

    fn get_deployment(&self, deployment_id: &DeploymentId) -> ApiResult<Deployment> {
        self.get(&format!("/v1/deployments/{}", deployment_id.0))
    }

    fn report_deployment_planned(&self, deployment_id: &DeploymentId, stages: &[Stage]) -> ApiResult<()> {
        self.post(&format!("/v1/deployments/{}/plan", deployment_id.0), &json!({ "stages": stages }))
    }

    fn report_deployment_status_changed(
        &self,
        deployment_id: &DeploymentId,
        status: DeploymentStatus,
        reason: Option<&str>,
    ) -> ApiResult<()> {
        self.post(
            &format!("/v1/deployments/{}/status", deployment_id.0),
            &json!({ "status": status, "reason": reason }),
        )
    }

    fn report_stage_status_changed(
        &self,
        deployment_id: &DeploymentId,
        stage_index: usize,
        status: StageStatus,
        reason: Option<&str>,
    ) -> ApiResult<()> {
        self.post(
            &format!("/v1/deployments/{}/stages/{stage_index}/status", deployment_id.0),
            &json!({ "status": status, "reason": reason }),
        )
    }

    fn report_stage_logs(&self, deployment_id: &DeploymentId, stage_index: usize, lines: &[String]) -> ApiResult<()> {
        self.post(
            &format!("/v1/deployments/{}/stages/{stage_index}/logs", deployment_id.0),
            &json!({ "lines": lines }),
        )
    }

    fn list_unhandled_commands(&self, piped_id: &str) -> ApiResult<Vec<Command>> {
        self.get(&format!("/v1/pipeds/{piped_id}/commands/unhandled"))
    }

    fn report_command_handled(&self, command_id: &CommandId, result: CommandResult) -> ApiResult<()> {
        self.post(&format!("/v1/commands/{}/handled", command_id.0), &json!({ "result": result }))
    }

    fn create_deployment(
        &self,
        application_id: &ApplicationId,
        trigger_commit: &str,
        target_commit: &str,
        trigger_source: TriggerSource,
    ) -> ApiResult<DeploymentId> {
        let body: serde_json::Value = self.post(
            &format!("/v1/applications/{}/deployments", application_id.0),
            &json!({ "triggerCommit": trigger_commit, "targetCommit": target_commit, "triggerSource": trigger_source }),
        )?;
        body.get("id")
            .and_then(|v| v.as_str())
            .map(|id| DeploymentId(id.to_string()))
            .ok_or_else(|| ApiError::Transient("create_deployment response missing id".to_string()))
    }
}
