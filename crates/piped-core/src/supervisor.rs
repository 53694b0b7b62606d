//! Lifecycle Supervisor: process startup and shutdown orchestration (§4.11).
//! Parents every independent clock — trigger pollers, image-watcher pollers,
//! the live-state reporter, the command-stream loop, the progress sender —
//! under one root [`CancellationToken`], the way the teacher's CLI parents
//! its one unit of work under a single run; the difference is that this
//! process never has "one unit of work finish", only a shutdown signal.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use piped_encrypt::SealedSecretCipher;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::auth;
use crate::cancel::CancellationToken;
use crate::command_stream::{self, HandlerRegistry};
use crate::config::{PipedConfig, RuntimeOptions};
use crate::controller::{self, ApprovalGate, ControllerOptions};
use crate::encryption;
use crate::executor::ExecutorRegistry;
use crate::git::GitWorkspace;
use crate::image_watcher::{self, ImageWatcher};
use crate::live_state::{self, LiveStateReporter};
use crate::lock::LockRegistry;
use crate::progress::ProgressReporter;
use crate::state;
use crate::store::ApplicationStore;
use crate::tool_registry::ToolRegistry;
use crate::trigger::{self, RepositoryTrigger};
use crate::types::{
    ApplicationId, Deployment, DeploymentCheckpoint, DeploymentId, DeploymentStatus, PipedRuntimeState,
    Stage,
};

const PROGRESS_QUEUE_CAPACITY: usize = 1024;

/// Resolved identity a supervisor authenticates as.
#[derive(Debug, Clone)]
pub struct PipedIdentity {
    pub piped_id: String,
    pub project_id: String,
    pub piped_key: String,
}

/// Resolve the piped key and project id from CLI/env/config, in the order
/// `auth` defines, paired with the config's own `pipedID`.
pub fn resolve_identity(
    config: &PipedConfig,
    runtime: &RuntimeOptions,
    cli_project_id: Option<&str>,
) -> Result<PipedIdentity> {
    let piped_key = auth::resolve_piped_key(runtime.piped_key_file.as_deref(), config.piped_key_file.as_deref())?;
    let project_id = auth::resolve_project_id(cli_project_id, Some(config.project_id.as_str()))?;
    Ok(PipedIdentity { piped_id: config.piped_id.clone(), project_id, piped_key })
}

/// Shared infrastructure every worker is built against, plus the bookkeeping
/// the supervisor needs to start and stop them cleanly. Always held behind
/// an `Arc` so `spawn_*` can hand worker threads a cheap shared handle
/// instead of duplicating the git mirror, the application store or the lock
/// registry per worker.
pub struct Supervisor {
    pub identity: PipedIdentity,
    pub cancel: CancellationToken,
    pub store: ApplicationStore,
    pub progress: ProgressReporter,
    pub git: GitWorkspace,
    pub locks: LockRegistry<ApplicationId>,
    pub cipher: SealedSecretCipher,
    pub approvals: ApprovalGate,
    state_dir: PathBuf,
    runtime_state: Mutex<PipedRuntimeState>,
    deployment_cancels: Mutex<HashMap<DeploymentId, CancellationToken>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    reclaimed_guards: Mutex<Vec<crate::lock::KeyGuard>>,
}

impl Supervisor {
    /// Validate `config`, resolve this piped's identity, and construct the
    /// shared infrastructure every worker consults. Does not start any
    /// worker threads yet; callers spawn only the workers this deployment
    /// needs via `spawn_*`.
    pub fn bootstrap(config: &PipedConfig, runtime: &RuntimeOptions, cli_project_id: Option<&str>) -> Result<Arc<Self>> {
        config.validate().context("invalid piped configuration")?;
        let identity = resolve_identity(config, runtime, cli_project_id)?;

        std::fs::create_dir_all(&runtime.state_dir)
            .with_context(|| format!("failed to create state dir {}", runtime.state_dir.display()))?;

        let git = GitWorkspace::new(runtime.state_dir.join("git"));
        let cipher = encryption::build_cipher(&config.sealed_secret_management)?;

        let runtime_state = match state::load_state(&runtime.state_dir)? {
            Some(previous) => {
                info!(
                    deployments = previous.deployments.len(),
                    "resuming with persisted runtime state from a previous run"
                );
                previous
            }
            None => PipedRuntimeState {
                state_version: state::CURRENT_STATE_VERSION.to_string(),
                piped_id: identity.piped_id.clone(),
                deployments: BTreeMap::new(),
            },
        };

        Ok(Arc::new(Self {
            identity,
            cancel: CancellationToken::new(),
            store: ApplicationStore::new(),
            progress: ProgressReporter::new(PROGRESS_QUEUE_CAPACITY),
            git,
            locks: LockRegistry::new(),
            cipher,
            approvals: ApprovalGate::new(),
            state_dir: runtime.state_dir.clone(),
            runtime_state: Mutex::new(runtime_state),
            deployment_cancels: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            reclaimed_guards: Mutex::new(Vec::new()),
        }))
    }

    /// List this piped's non-terminal deployments and acquire the
    /// per-application lock for each. A deployment whose lock cannot be
    /// acquired is skipped: per the resolved open question on reclaim
    /// semantics, the API's own single-active-deployment-per-application
    /// guarantee should already prevent this, so a local lock conflict here
    /// is a defence-in-depth signal worth logging, not retrying. Locks for
    /// returned deployments are held for the supervisor's lifetime so a
    /// racing trigger tick cannot step on a resumed controller.
    pub fn reclaim_in_flight(&self, api: &dyn ApiClient) -> Result<Vec<Deployment>> {
        let candidates = api
            .list_not_completed_deployments(&self.identity.piped_id)
            .context("failed to list not-completed deployments for reclaim")?;

        let mut reclaimed = Vec::new();
        let mut guards = self.reclaimed_guards.lock().expect("reclaim guards poisoned");
        for deployment in candidates {
            if matches!(
                deployment.status,
                DeploymentStatus::Success | DeploymentStatus::Failure | DeploymentStatus::Cancelled
            ) {
                continue;
            }
            match self.locks.try_acquire(&deployment.application_id) {
                Ok(guard) => {
                    info!(deployment_id = %deployment.id.0, application_id = %deployment.application_id.0, "reclaimed in-flight deployment on restart");
                    guards.push(guard);
                    reclaimed.push(deployment);
                }
                Err(err) => {
                    warn!(deployment_id = %deployment.id.0, application_id = %deployment.application_id.0, error = %err, "could not acquire application lock to reclaim deployment; skipping");
                }
            }
        }
        Ok(reclaimed)
    }

    /// Whether `id` currently has a non-terminal deployment, according to
    /// the store's cached view of its last known deployment.
    fn has_active_deployment(&self, api: &dyn ApiClient, id: &ApplicationId) -> bool {
        match self.store.get(id) {
            Some(app) => trigger::deployment_is_active(api, &app),
            None => false,
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.handles.lock().expect("worker handle list poisoned").push(handle);
    }

    /// Spawn one `RepositoryTrigger` poller per configured repository.
    pub fn spawn_triggers(self: &Arc<Self>, triggers: Vec<RepositoryTrigger>, api: Arc<dyn ApiClient>, sync_interval: Duration) {
        for repo_trigger in triggers {
            let sup = Arc::clone(self);
            let api = api.clone();
            let handle = thread::spawn(move || {
                let repo_trigger = repo_trigger;
                trigger::run(&repo_trigger, &sup.git, &sup.store, api.as_ref(), &sup.cancel, sync_interval, |id| {
                    sup.has_active_deployment(api.as_ref(), id)
                });
            });
            self.track(handle);
        }
    }

    /// Spawn one `ImageWatcher` poller per configured image provider.
    pub fn spawn_image_watcher(self: &Arc<Self>, watcher: Arc<ImageWatcher>, api: Arc<dyn ApiClient>, pull_interval: Duration) {
        let sup = Arc::clone(self);
        let handle = thread::spawn(move || {
            image_watcher::run(&watcher, &sup.store, api.as_ref(), &sup.cancel, pull_interval, |id| {
                sup.has_active_deployment(api.as_ref(), id)
            });
        });
        self.track(handle);
    }

    /// Spawn the application live-state reporter.
    pub fn spawn_live_state_reporter(self: &Arc<Self>, reporter: Arc<LiveStateReporter>, api: Arc<dyn ApiClient>, poll_interval: Duration) {
        let sup = Arc::clone(self);
        let handle = thread::spawn(move || {
            live_state::run(&reporter, &sup.store, api.as_ref(), &sup.cancel, poll_interval, |id| {
                sup.has_active_deployment(api.as_ref(), id)
            });
        });
        self.track(handle);
    }

    /// Spawn the command-stream long-poll loop.
    pub fn spawn_command_stream(self: &Arc<Self>, handlers: HandlerRegistry, api: Arc<dyn ApiClient>, poll_interval: Duration) {
        let sup = Arc::clone(self);
        let handle = thread::spawn(move || {
            command_stream::run(api.as_ref(), &sup.identity.piped_id, &handlers, &sup.cancel, poll_interval);
        });
        self.track(handle);
    }

    /// Cancel a specific deployment this supervisor is currently driving.
    /// A deployment id with no tracked token — already completed, not yet
    /// dispatched, or not ours — is a no-op; command delivery is
    /// at-least-once, so the caller acknowledges regardless.
    pub fn cancel_deployment(&self, deployment_id: &DeploymentId) {
        let cancels = self.deployment_cancels.lock().expect("deployment cancels poisoned");
        if let Some(token) = cancels.get(deployment_id) {
            token.cancel();
        }
    }

    /// Poll for this piped's not-completed deployments at `poll_interval`
    /// and drive each one that isn't already in flight to a terminal
    /// status, one thread per deployment, serialised per application via
    /// `self.locks`.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_controller(
        self: &Arc<Self>,
        api: Arc<dyn ApiClient>,
        executors: ExecutorRegistry,
        tools: ToolRegistry,
        tool_base_dir: PathBuf,
        opts: ControllerOptions,
        poll_interval: Duration,
    ) {
        let sup = Arc::clone(self);
        let handle = thread::spawn(move || {
            while !sup.cancel.is_cancelled() {
                match api.list_not_completed_deployments(&sup.identity.piped_id) {
                    Ok(deployments) => {
                        for deployment in deployments {
                            sup.try_dispatch(&deployment, &api, &executors, &tools, &tool_base_dir, &opts);
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to list not-completed deployments"),
                }
                if sup.cancel.wait_for(poll_interval) {
                    return;
                }
            }
        });
        self.track(handle);
    }

    /// Claim `deployment` via the per-application lock and drive it on its
    /// own thread. Already-claimed deployments (tracked in
    /// `deployment_cancels`, or whose application lock is held by a
    /// concurrent dispatch) are skipped — the next poll retries them.
    #[allow(clippy::too_many_arguments)]
    fn try_dispatch(
        self: &Arc<Self>,
        deployment: &Deployment,
        api: &Arc<dyn ApiClient>,
        executors: &ExecutorRegistry,
        tools: &ToolRegistry,
        tool_base_dir: &Path,
        opts: &ControllerOptions,
    ) {
        if self.deployment_cancels.lock().expect("deployment cancels poisoned").contains_key(&deployment.id) {
            return;
        }

        let Some(application) = self.store.get(&deployment.application_id) else {
            warn!(deployment_id = %deployment.id.0, application_id = %deployment.application_id.0, "no cached application for deployment; will retry next poll");
            return;
        };

        let guard = match self.locks.try_acquire(&deployment.application_id) {
            Ok(guard) => guard,
            Err(_) => return,
        };

        let trigger_workspace = match self.git.checkout(&application.repo_id, &deployment.trigger_commit) {
            Ok(ws) => ws,
            Err(err) => {
                warn!(deployment_id = %deployment.id.0, error = %err, "failed to checkout trigger commit; will retry next poll");
                return;
            }
        };
        let target_workspace = match self.git.checkout(&application.repo_id, &deployment.target_commit) {
            Ok(ws) => ws,
            Err(err) => {
                warn!(deployment_id = %deployment.id.0, error = %err, "failed to checkout target commit; will retry next poll");
                self.git.release(trigger_workspace);
                return;
            }
        };

        let cancel = CancellationToken::new();
        self.deployment_cancels
            .lock()
            .expect("deployment cancels poisoned")
            .insert(deployment.id.clone(), cancel.clone());

        let sup = Arc::clone(self);
        let api = api.clone();
        let executors = executors.clone();
        let tools = tools.clone();
        let tool_base_dir = tool_base_dir.to_path_buf();
        let opts = opts.clone();
        let deployment_id = deployment.id.clone();
        let application_id = deployment.application_id.clone();
        let pipeline = application.config.pipeline.clone();
        let app_config = application.config.clone();
        let target_commit = deployment.target_commit.clone();

        let handle = thread::spawn(move || {
            let checkpoint_deployment_id = deployment_id.clone();
            let checkpoint_application_id = application_id.clone();
            let checkpoint = move |stages: &[Stage]| {
                sup.persist_checkpoint(DeploymentCheckpoint {
                    deployment_id: checkpoint_deployment_id.clone(),
                    application_id: checkpoint_application_id.clone(),
                    plan_id: checkpoint_deployment_id.0.clone(),
                    stages: stages.to_vec(),
                    updated_at: Utc::now(),
                });
            };

            if let Err(err) = controller::run_deployment(
                &deployment_id,
                &target_commit,
                &pipeline,
                &app_config,
                &trigger_workspace,
                &target_workspace,
                &executors,
                &tools,
                &tool_base_dir,
                api.as_ref(),
                &sup.progress,
                &cancel,
                &sup.approvals,
                &opts,
                &checkpoint,
            ) {
                warn!(deployment_id = %deployment_id.0, error = %err, "run_deployment errored");
            }

            sup.clear_checkpoint(&deployment_id);
            sup.deployment_cancels.lock().expect("deployment cancels poisoned").remove(&deployment_id);
            sup.git.release(trigger_workspace);
            sup.git.release(target_workspace);
            drop(guard);
        });
        self.track(handle);
    }

    /// Persist a deployment's latest stage progress so a restart can resume
    /// it from this point rather than from scratch.
    fn persist_checkpoint(&self, checkpoint: DeploymentCheckpoint) {
        let mut state = self.runtime_state.lock().expect("runtime state poisoned");
        state.deployments.insert(checkpoint.deployment_id.0.clone(), checkpoint);
        if let Err(err) = state::save_state(&self.state_dir, &state) {
            warn!(error = %err, "failed to persist runtime state checkpoint");
        }
    }

    /// Drop a deployment's checkpoint once it reaches a terminal status.
    /// Clears the state file entirely once no checkpoints remain, rather
    /// than leaving an empty-but-present runtime-state.json behind.
    fn clear_checkpoint(&self, deployment_id: &DeploymentId) {
        let mut state = self.runtime_state.lock().expect("runtime state poisoned");
        state.deployments.remove(&deployment_id.0);
        let result = if state.deployments.is_empty() {
            state::clear_state(&self.state_dir)
        } else {
            state::save_state(&self.state_dir, &state)
        };
        if let Err(err) = result {
            warn!(deployment_id = %deployment_id.0, error = %err, "failed to update persisted runtime state after deployment completion");
        }
    }

    /// Spawn the progress-event sender.
    pub fn spawn_progress_sender(self: &Arc<Self>, api: Arc<dyn ApiClient>, batch_size: usize, batch_interval: Duration) {
        let sup = Arc::clone(self);
        let handle = thread::spawn(move || {
            crate::progress::run(&sup.progress, api.as_ref(), &sup.cancel, batch_size, batch_interval);
        });
        self.track(handle);
    }

    /// Signal every worker to stop, join them, and flush any progress events
    /// still queued so a clean shutdown never silently drops a report.
    pub fn shutdown(&self, api: &dyn ApiClient) {
        self.cancel.cancel();
        for token in self.deployment_cancels.lock().expect("deployment cancels poisoned").values() {
            token.cancel();
        }

        let handles = std::mem::take(&mut *self.handles.lock().expect("worker handle list poisoned"));
        for handle in handles {
            let _ = handle.join();
        }

        for event in self.progress.drain_all() {
            if let Err(err) = crate::progress::send_once(api, &event) {
                warn!(deployment_id = %event.deployment_id.0, seq = event.seq, error = %err, "failed to flush progress event on shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use chrono::Utc;
    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;
    use crate::config::{
        GitConfig, NotificationsConfig, SealedSecretManagementConfig,
    };
    use crate::types::{ApplicationId, Stage, StageKind, StageStatus};

    struct EnvGuard {
        key: String,
        old: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let old = env::var(key).ok();
            unsafe { env::set_var(key, value) };
            Self { key: key.to_string(), old }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.old {
                Some(v) => unsafe { env::set_var(&self.key, v) },
                None => unsafe { env::remove_var(&self.key) },
            }
        }
    }

    fn minimal_config(state_dir: &std::path::Path) -> PipedConfig {
        PipedConfig {
            project_id: "proj-1".to_string(),
            piped_id: "piped-1".to_string(),
            piped_key_file: None,
            api_address: "localhost:9000".to_string(),
            web_address: None,
            sync_interval: Duration::from_secs(60),
            git: GitConfig::default(),
            repositories: vec![],
            chart_repositories: vec![],
            cloud_providers: vec![],
            analysis_providers: vec![],
            image_providers: vec![],
            notifications: NotificationsConfig::default(),
            sealed_secret_management: SealedSecretManagementConfig::default(),
            state_dir: Some(state_dir.to_path_buf()),
        }
    }

    fn bootstrap_for_test(td: &std::path::Path) -> Arc<Supervisor> {
        let config = minimal_config(td);
        let runtime = config.build_runtime_options(crate::config::CliOverrides::default());
        Supervisor::bootstrap(&config, &runtime, None).expect("bootstrap")
    }

    #[test]
    #[serial]
    fn cancel_deployment_is_noop_for_unknown_id() {
        let td = tempdir().expect("tempdir");
        let _env = EnvGuard::set("PIPED_KEY", "test-key");
        let supervisor = bootstrap_for_test(td.path());

        // Must not panic for a deployment this supervisor never dispatched.
        supervisor.cancel_deployment(&DeploymentId("unknown".to_string()));
    }

    #[test]
    #[serial]
    fn cancel_deployment_cancels_tracked_token() {
        let td = tempdir().expect("tempdir");
        let _env = EnvGuard::set("PIPED_KEY", "test-key");
        let supervisor = bootstrap_for_test(td.path());

        let token = CancellationToken::new();
        let deployment_id = DeploymentId("d1".to_string());
        supervisor
            .deployment_cancels
            .lock()
            .expect("deployment cancels poisoned")
            .insert(deployment_id.clone(), token.clone());

        supervisor.cancel_deployment(&deployment_id);

        assert!(token.is_cancelled());
    }

    #[test]
    #[serial]
    fn persist_and_clear_checkpoint_roundtrip_through_disk() {
        let td = tempdir().expect("tempdir");
        let _env = EnvGuard::set("PIPED_KEY", "test-key");
        let supervisor = bootstrap_for_test(td.path());

        let deployment_id = DeploymentId("d1".to_string());
        let checkpoint = DeploymentCheckpoint {
            deployment_id: deployment_id.clone(),
            application_id: ApplicationId("app-1".to_string()),
            plan_id: deployment_id.0.clone(),
            stages: vec![Stage {
                index: 0,
                kind: StageKind::Sync,
                requires: vec![],
                config: serde_json::Value::Null,
                status: StageStatus::Running,
                retry_count: 0,
                status_reason: None,
                started_at: Some(Utc::now()),
                completed_at: None,
            }],
            updated_at: Utc::now(),
        };

        supervisor.persist_checkpoint(checkpoint);
        let persisted = state::load_state(&supervisor.state_dir)
            .expect("load state")
            .expect("state file exists");
        assert!(persisted.deployments.contains_key("d1"));

        supervisor.clear_checkpoint(&deployment_id);
        // The last checkpoint was cleared, so the whole state file is removed
        // rather than left behind holding an empty map.
        assert!(state::load_state(&supervisor.state_dir).expect("load state").is_none());
    }

    #[test]
    #[serial]
    fn shutdown_cancels_tracked_deployments() {
        let td = tempdir().expect("tempdir");
        let _env = EnvGuard::set("PIPED_KEY", "test-key");
        let supervisor = bootstrap_for_test(td.path());
        let api = crate::api::MockApiClient::new();

        let token = CancellationToken::new();
        supervisor
            .deployment_cancels
            .lock()
            .expect("deployment cancels poisoned")
            .insert(DeploymentId("d1".to_string()), token.clone());

        supervisor.shutdown(&api);

        assert!(token.is_cancelled());
        assert!(supervisor.cancel.is_cancelled());
    }
}
