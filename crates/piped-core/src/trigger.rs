//! Deployment Trigger: one worker per configured repository, polling at a
//! configurable cadence for config or watched-path changes and submitting
//! `CreateDeployment` to the API when it finds one.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::cancel::CancellationToken;
use crate::git::GitWorkspace;
use crate::store::ApplicationStore;
use crate::types::{
    Application, ApplicationConfig, ApplicationId, Commit, DeploymentStatus, ProjectId,
    RepositoryConfig, RepositoryId, TriggerSource,
};

/// Filename an application's pipeline config is expected under, anywhere in
/// the checked-out repository.
const APP_CONFIG_FILENAME: &str = "app.yaml";

struct TriggerRecord {
    last_triggered_commit: Commit,
    config_hash: String,
}

/// Tracks, for one repository, the state needed to decide whether each
/// application's config has changed since it was last triggered.
pub struct RepositoryTrigger {
    repo: RepositoryConfig,
    project_id: ProjectId,
    records: Mutex<HashMap<ApplicationId, TriggerRecord>>,
}

impl RepositoryTrigger {
    pub fn new(repo: RepositoryConfig, project_id: ProjectId) -> Self {
        Self { repo, project_id, records: Mutex::new(HashMap::new()) }
    }

    /// Run one poll cycle: fetch the repo, discover applications from the
    /// checkout and reconcile them into the store, diff each against its
    /// last-triggered state, and submit deployments for the ones that
    /// changed, in application-id order. `has_active_deployment` lets the
    /// caller suppress a new deployment while one is already running — the
    /// API's own uniqueness guarantee is the source of truth, this is a
    /// defence-in-depth check against a stale local view.
    pub fn tick(
        &self,
        git: &GitWorkspace,
        store: &ApplicationStore,
        api: &dyn ApiClient,
        has_active_deployment: impl Fn(&ApplicationId) -> bool,
    ) -> Result<()> {
        let head = git
            .clone_or_fetch(&self.repo.id, &self.repo.remote, &self.repo.branch)
            .context("clone_or_fetch failed")?;

        let workspace = git
            .checkout(&self.repo.id, &head)
            .context("checkout of head commit failed")?;

        let existing: HashMap<ApplicationId, Application> = store
            .list()
            .into_iter()
            .filter(|app| app.repo_id == self.repo.id)
            .map(|app| (app.id.clone(), app))
            .collect();

        let discovered = discover_applications(&workspace.path, &self.repo.id, &self.project_id);
        let merged: Vec<Application> = discovered
            .into_iter()
            .map(|mut app| {
                if let Some(previous) = existing.get(&app.id) {
                    app.live_state = previous.live_state.clone();
                    app.latest_deployment_id = previous.latest_deployment_id.clone();
                }
                app
            })
            .collect();
        store.reconcile_repo(&self.repo.id, merged);

        let mut applications: Vec<Application> = store
            .list()
            .into_iter()
            .filter(|app| app.repo_id == self.repo.id)
            .collect();
        applications.sort_by(|a, b| a.id.cmp(&b.id));

        for app in &applications {
            if has_active_deployment(&app.id) {
                info!(application_id = %app.id.0, "trigger suppressed: deployment already running");
                continue;
            }

            let config_path = workspace.path.join(&app.path);
            let bytes = match fs::read(&config_path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(application_id = %app.id.0, error = %err, "failed to read application config; skipping");
                    continue;
                }
            };
            let config_hash = hex_sha256(&bytes);

            let mut records = self.records.lock().expect("trigger records poisoned");
            let changed = match records.get(&app.id) {
                Some(record) => record.config_hash != config_hash,
                None => true,
            };
            if !changed {
                continue;
            }

            let previous_commit = records
                .get(&app.id)
                .map(|r| r.last_triggered_commit.clone())
                .unwrap_or_else(|| head.clone());
            drop(records);

            match api.create_deployment(&app.id, &previous_commit.0, &head.0, TriggerSource::Scheduled) {
                Ok(deployment_id) => {
                    info!(application_id = %app.id.0, deployment_id = %deployment_id.0, "deployment created by trigger");
                    let mut records = self.records.lock().expect("trigger records poisoned");
                    records.insert(
                        app.id.clone(),
                        TriggerRecord { last_triggered_commit: head.clone(), config_hash },
                    );
                }
                Err(err) => {
                    warn!(application_id = %app.id.0, error = %err, "create_deployment failed; will retry next tick");
                }
            }
        }

        git.release(workspace);
        Ok(())
    }
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Deterministic id for an application discovered at `path` (relative to the
/// repo root) within `repo_id` — stable across ticks so the same config file
/// always reconciles to the same `Application`.
pub fn derive_application_id(repo_id: &RepositoryId, path: &Path) -> ApplicationId {
    ApplicationId(format!("{}:{}", repo_id.0, path.to_string_lossy()))
}

/// Walk the checkout looking for `app.yaml` files and parse each into an
/// `Application`. A file that fails to parse is skipped with a warning
/// rather than failing the whole tick — one broken application shouldn't
/// block every other one in the same repo.
fn discover_applications(
    workspace_root: &Path,
    repo_id: &RepositoryId,
    project_id: &ProjectId,
) -> Vec<Application> {
    let mut config_paths = Vec::new();
    walk_for_app_configs(workspace_root, &mut config_paths);

    config_paths
        .into_iter()
        .filter_map(|absolute| {
            let relative = absolute.strip_prefix(workspace_root).unwrap_or(&absolute).to_path_buf();
            let text = match fs::read_to_string(&absolute) {
                Ok(text) => text,
                Err(err) => {
                    warn!(path = %relative.display(), error = %err, "failed to read discovered application config");
                    return None;
                }
            };
            let config: ApplicationConfig = match toml::from_str(&text) {
                Ok(config) => config,
                Err(err) => {
                    warn!(path = %relative.display(), error = %err, "failed to parse discovered application config");
                    return None;
                }
            };

            let id = derive_application_id(repo_id, &relative);
            Some(Application {
                id,
                project_id: project_id.clone(),
                kind: config.kind,
                repo_id: repo_id.clone(),
                path: relative,
                config,
                live_state: None,
                latest_deployment_id: None,
                deleted: false,
            })
        })
        .collect()
}

fn walk_for_app_configs(dir: &Path, found: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if path.file_name().is_some_and(|n| n == ".git") {
                continue;
            }
            walk_for_app_configs(&path, found);
        } else if path.file_name().is_some_and(|n| n == APP_CONFIG_FILENAME) {
            found.push(path);
        }
    }
}

/// Run `trigger`'s tick loop at `repo.sync_interval` until `cancel` fires.
pub fn run(
    trigger: &RepositoryTrigger,
    git: &GitWorkspace,
    store: &ApplicationStore,
    api: &dyn ApiClient,
    cancel: &CancellationToken,
    sync_interval: Duration,
    has_active_deployment: impl Fn(&ApplicationId) -> bool,
) {
    while !cancel.is_cancelled() {
        if let Err(err) = trigger.tick(git, store, api, &has_active_deployment) {
            warn!(error = %err, "trigger tick failed");
        }
        if cancel.wait_for(sync_interval) {
            return;
        }
    }
}

/// Helper for callers wiring `has_active_deployment` against the real API:
/// an application has an active deployment if its last known deployment id
/// resolves to a non-terminal status.
pub fn deployment_is_active(api: &dyn ApiClient, application: &Application) -> bool {
    match &application.latest_deployment_id {
        None => false,
        Some(deployment_id) => match api.get_deployment(deployment_id) {
            Ok(deployment) => !matches!(
                deployment.status,
                DeploymentStatus::Success | DeploymentStatus::Failure | DeploymentStatus::Cancelled
            ),
            Err(_) => false,
        },
    }
}
