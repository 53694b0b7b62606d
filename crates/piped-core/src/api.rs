//! `ApiClient`: the control-plane wire boundary. Real transport (gRPC/mTLS)
//! is an external adapter; this crate ships only the trait plus a
//! [`MockApiClient`] test double, mirroring the way the teacher's
//! `RegistryClient` wraps a blocking HTTP client behind typed methods rather
//! than exposing raw request plumbing to its callers.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use thiserror::Error;

use crate::types::{
    ApplicationId, ApplicationLiveState, Command, CommandId, CommandResult, Deployment,
    DeploymentId, DeploymentStatus, Stage, StageStatus, TriggerSource,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transient API error: {0}")]
    Transient(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// One blocking method per control-plane RPC (§6). Implementations are
/// expected to apply their own retry policy for `Transient` failures before
/// returning; callers treat every `Err` here as final for this attempt.
pub trait ApiClient: Send + Sync {
    fn ping(&self) -> ApiResult<()>;
    fn report_stat(&self, name: &str, value: f64) -> ApiResult<()>;
    fn list_applications(&self, project_id: &str) -> ApiResult<Vec<ApplicationId>>;
    fn report_application_sync_state(
        &self,
        application_id: &ApplicationId,
        deployment_id: &DeploymentId,
    ) -> ApiResult<()>;
    fn report_application_live_state(&self, live_state: &ApplicationLiveState) -> ApiResult<()>;
    fn list_not_completed_deployments(&self, piped_id: &str) -> ApiResult<Vec<Deployment>>;
    fn get_deployment(&self, deployment_id: &DeploymentId) -> ApiResult<Deployment>;
    fn report_deployment_planned(&self, deployment_id: &DeploymentId, stages: &[Stage]) -> ApiResult<()>;
    fn report_deployment_status_changed(
        &self,
        deployment_id: &DeploymentId,
        status: DeploymentStatus,
        reason: Option<&str>,
    ) -> ApiResult<()>;
    fn report_stage_status_changed(
        &self,
        deployment_id: &DeploymentId,
        stage_index: usize,
        status: StageStatus,
        reason: Option<&str>,
    ) -> ApiResult<()>;
    fn report_stage_logs(&self, deployment_id: &DeploymentId, stage_index: usize, lines: &[String]) -> ApiResult<()>;
    fn list_unhandled_commands(&self, piped_id: &str) -> ApiResult<Vec<Command>>;
    fn report_command_handled(&self, command_id: &CommandId, result: CommandResult) -> ApiResult<()>;
    fn create_deployment(
        &self,
        application_id: &ApplicationId,
        trigger_commit: &str,
        target_commit: &str,
        trigger_source: TriggerSource,
    ) -> ApiResult<DeploymentId>;
}

/// Records every call it receives and answers from caller-programmed
/// fixtures, in the spirit of the teacher's `spawn_registry_server` test
/// harness but without a real HTTP listener — integration tests can drive
/// an in-process controller without any network stack.
#[derive(Default)]
pub struct MockApiClient {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    applications: Vec<ApplicationId>,
    deployments: std::collections::HashMap<String, Deployment>,
    not_completed: Vec<DeploymentId>,
    commands: VecDeque<Command>,
    handled_commands: Vec<(CommandId, CommandResult)>,
    reported_stage_statuses: Vec<(DeploymentId, usize, StageStatus)>,
    reported_deployment_statuses: Vec<(DeploymentId, DeploymentStatus)>,
    live_states: Vec<ApplicationLiveState>,
    next_deployment_seq: u64,
}

impl MockApiClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_applications(&self, ids: Vec<ApplicationId>) {
        self.state.lock().expect("mock state poisoned").applications = ids;
    }

    pub fn seed_command(&self, command: Command) {
        self.state.lock().expect("mock state poisoned").commands.push_back(command);
    }

    /// Seed a deployment resolvable by [`ApiClient::get_deployment`] without
    /// it showing up as not-completed — for a finished deployment a test
    /// needs as history but not as an in-flight one.
    pub fn seed_deployment_record(&self, deployment: Deployment) {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.deployments.insert(deployment.id.0.clone(), deployment);
    }

    pub fn seed_not_completed(&self, deployment: Deployment) {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.not_completed.push(deployment.id.clone());
        state.deployments.insert(deployment.id.0.clone(), deployment);
    }

    pub fn reported_stage_statuses(&self) -> Vec<(DeploymentId, usize, StageStatus)> {
        self.state.lock().expect("mock state poisoned").reported_stage_statuses.clone()
    }

    pub fn reported_deployment_statuses(&self) -> Vec<(DeploymentId, DeploymentStatus)> {
        self.state.lock().expect("mock state poisoned").reported_deployment_statuses.clone()
    }

    pub fn handled_commands(&self) -> Vec<(CommandId, CommandResult)> {
        self.state.lock().expect("mock state poisoned").handled_commands.clone()
    }

    pub fn reported_live_states(&self) -> Vec<ApplicationLiveState> {
        self.state.lock().expect("mock state poisoned").live_states.clone()
    }
}

impl ApiClient for MockApiClient {
    fn ping(&self) -> ApiResult<()> {
        Ok(())
    }

    fn report_stat(&self, _name: &str, _value: f64) -> ApiResult<()> {
        Ok(())
    }

    fn list_applications(&self, _project_id: &str) -> ApiResult<Vec<ApplicationId>> {
        Ok(self.state.lock().expect("mock state poisoned").applications.clone())
    }

    fn report_application_sync_state(
        &self,
        _application_id: &ApplicationId,
        _deployment_id: &DeploymentId,
    ) -> ApiResult<()> {
        Ok(())
    }

    fn report_application_live_state(&self, live_state: &ApplicationLiveState) -> ApiResult<()> {
        self.state.lock().expect("mock state poisoned").live_states.push(live_state.clone());
        Ok(())
    }

    fn list_not_completed_deployments(&self, _piped_id: &str) -> ApiResult<Vec<Deployment>> {
        let state = self.state.lock().expect("mock state poisoned");
        Ok(state
            .not_completed
            .iter()
            .filter_map(|id| state.deployments.get(&id.0).cloned())
            .collect())
    }

    fn get_deployment(&self, deployment_id: &DeploymentId) -> ApiResult<Deployment> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .deployments
            .get(&deployment_id.0)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("deployment {}", deployment_id.0)))
    }

    fn report_deployment_planned(&self, deployment_id: &DeploymentId, stages: &[Stage]) -> ApiResult<()> {
        let mut state = self.state.lock().expect("mock state poisoned");
        if let Some(dep) = state.deployments.get_mut(&deployment_id.0) {
            dep.stages = stages.to_vec();
        }
        Ok(())
    }

    fn report_deployment_status_changed(
        &self,
        deployment_id: &DeploymentId,
        status: DeploymentStatus,
        reason: Option<&str>,
    ) -> ApiResult<()> {
        let mut state = self.state.lock().expect("mock state poisoned");
        if let Some(dep) = state.deployments.get_mut(&deployment_id.0) {
            dep.status = status;
            dep.status_reason = reason.map(|s| s.to_string());
            dep.updated_at = Utc::now();
        }
        state.reported_deployment_statuses.push((deployment_id.clone(), status));
        Ok(())
    }

    fn report_stage_status_changed(
        &self,
        deployment_id: &DeploymentId,
        stage_index: usize,
        status: StageStatus,
        reason: Option<&str>,
    ) -> ApiResult<()> {
        let mut state = self.state.lock().expect("mock state poisoned");
        if let Some(dep) = state.deployments.get_mut(&deployment_id.0)
            && let Some(stage) = dep.stages.get_mut(stage_index)
        {
            stage.status = status;
            stage.status_reason = reason.map(|s| s.to_string());
        }
        state.reported_stage_statuses.push((deployment_id.clone(), stage_index, status));
        Ok(())
    }

    fn report_stage_logs(&self, _deployment_id: &DeploymentId, _stage_index: usize, _lines: &[String]) -> ApiResult<()> {
        Ok(())
    }

    fn list_unhandled_commands(&self, _piped_id: &str) -> ApiResult<Vec<Command>> {
        let state = self.state.lock().expect("mock state poisoned");
        Ok(state.commands.iter().cloned().collect())
    }

    fn report_command_handled(&self, command_id: &CommandId, result: CommandResult) -> ApiResult<()> {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.commands.retain(|c| &c.id != command_id);
        state.handled_commands.push((command_id.clone(), result));
        Ok(())
    }

    fn create_deployment(
        &self,
        application_id: &ApplicationId,
        trigger_commit: &str,
        target_commit: &str,
        trigger_source: TriggerSource,
    ) -> ApiResult<DeploymentId> {
        let mut state = self.state.lock().expect("mock state poisoned");
        let seq = state.next_deployment_seq;
        state.next_deployment_seq += 1;
        let id = DeploymentId(format!("dep-{seq}"));
        let now = Utc::now();
        let deployment = Deployment {
            id: id.clone(),
            application_id: application_id.clone(),
            trigger_commit: crate::types::Commit(trigger_commit.to_string()),
            target_commit: crate::types::Commit(target_commit.to_string()),
            trigger_source,
            stages: Vec::new(),
            status: DeploymentStatus::Running,
            status_reason: None,
            created_at: now,
            updated_at: now,
        };
        state.not_completed.push(id.clone());
        state.deployments.insert(id.0.clone(), deployment);
        Ok(id)
    }
}
