//! Image Watcher: one poller per image provider, run at `PullInterval`.
//! Resolves each tracked image pattern against the registry and, on a tag
//! change, creates a redeploy for every application bound to that pattern —
//! an alternative trigger source to git polling (§4.9), using the same
//! create-then-suppress shape as the Deployment Trigger and the Live-State
//! Reporter's auto-sync path.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::cancel::CancellationToken;
use crate::store::ApplicationStore;
use crate::types::{Application, ApplicationId, TriggerSource};

/// The registry's current answer for one tracked image pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub tag: String,
    pub digest: String,
}

/// Resolves an image pattern (e.g. `registry.example.com/app:*`) to the
/// newest matching tag. `None` means the pattern currently has no matching
/// tag in the registry, which is not an error.
pub trait ImageRegistryProvider: Send + Sync {
    fn resolve(&self, pattern: &str) -> Result<Option<ImageRef>>;
}

/// Polls one provider's tracked patterns and redeploys the applications
/// bound to whichever pattern's tag advances.
pub struct ImageWatcher {
    provider: Box<dyn ImageRegistryProvider>,
    last_seen: Mutex<HashMap<String, ImageRef>>,
}

impl ImageWatcher {
    pub fn new(provider: Box<dyn ImageRegistryProvider>) -> Self {
        Self { provider, last_seen: Mutex::new(HashMap::new()) }
    }

    /// Resolve every distinct pattern referenced by `store`'s applications
    /// and redeploy the bound applications whose pattern advanced.
    pub fn tick(
        &self,
        store: &ApplicationStore,
        api: &dyn ApiClient,
        has_active_deployment: impl Fn(&ApplicationId) -> bool,
    ) -> Result<()> {
        let applications = store.list();

        let patterns: BTreeSet<&String> =
            applications.iter().flat_map(|app| app.config.watched_images.iter()).collect();

        for pattern in patterns {
            let resolved = match self.provider.resolve(pattern) {
                Ok(Some(resolved)) => resolved,
                Ok(None) => continue,
                Err(err) => {
                    warn!(pattern, error = %err, "image registry resolve failed");
                    continue;
                }
            };

            let changed = {
                let seen = self.last_seen.lock().expect("image-watcher cache poisoned");
                seen.get(pattern) != Some(&resolved)
            };
            if !changed {
                continue;
            }

            let mut bound_apps: Vec<&Application> =
                applications.iter().filter(|app| app.config.watched_images.iter().any(|p| p == pattern)).collect();
            bound_apps.sort_by(|a, b| a.id.cmp(&b.id));

            for app in bound_apps {
                if has_active_deployment(&app.id) {
                    info!(application_id = %app.id.0, pattern, "image-update trigger suppressed: deployment already running");
                    continue;
                }
                self.redeploy(app, pattern, api);
            }

            self.last_seen.lock().expect("image-watcher cache poisoned").insert(pattern.clone(), resolved);
        }

        Ok(())
    }

    fn redeploy(&self, app: &Application, pattern: &str, api: &dyn ApiClient) {
        let Some(latest_deployment_id) = &app.latest_deployment_id else {
            warn!(application_id = %app.id.0, pattern, "no prior deployment to redeploy at; skipping image-update trigger");
            return;
        };
        let commit = match api.get_deployment(latest_deployment_id) {
            Ok(deployment) => deployment.target_commit.0,
            Err(err) => {
                warn!(application_id = %app.id.0, error = %err, "failed to resolve commit for image-update redeploy");
                return;
            }
        };

        match api.create_deployment(&app.id, &commit, &commit, TriggerSource::ImageUpdate) {
            Ok(deployment_id) => {
                info!(application_id = %app.id.0, deployment_id = %deployment_id.0, pattern, "deployment created by image watcher");
            }
            Err(err) => {
                warn!(application_id = %app.id.0, error = %err, "create_deployment failed; will retry next tick");
            }
        }
    }
}

/// Run `watcher`'s tick loop at `pull_interval` until `cancel` fires.
pub fn run(
    watcher: &ImageWatcher,
    store: &ApplicationStore,
    api: &dyn ApiClient,
    cancel: &CancellationToken,
    pull_interval: Duration,
    has_active_deployment: impl Fn(&ApplicationId) -> bool,
) {
    while !cancel.is_cancelled() {
        if let Err(err) = watcher.tick(store, api, &has_active_deployment) {
            warn!(error = %err, "image watcher tick failed");
        }
        if cancel.wait_for(pull_interval) {
            return;
        }
    }
}
