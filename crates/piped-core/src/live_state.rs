//! Application Live-State Reporter: for every application whose provider
//! supports introspection, observes the deployed resources, diffs them
//! against the desired manifests rendered from the configured branch, and
//! reports the result to the API. Mirrors the Deployment Trigger's
//! poll-and-diff shape but reports state rather than creating a deployment —
//! except when the application is auto-sync and the diff implies drift, in
//! which case it creates one with [`TriggerSource::Drift`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::cancel::CancellationToken;
use crate::store::ApplicationStore;
use crate::types::{Application, ApplicationId, ApplicationLiveState, Commit, HealthSummary, LiveStateDiff, TriggerSource};

/// What one observation of an application's live resources found.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedState {
    pub health: HealthSummary,
    pub diff: Option<LiveStateDiff>,
}

/// Introspects an application's deployed resources. `None` means this
/// provider has nothing to say about the application (e.g. its kind isn't
/// supported), which the reporter treats as "skip, not an error".
pub trait LiveStateProvider: Send + Sync {
    fn observe(&self, application: &Application) -> Result<Option<ObservedState>>;
}

struct Coalesced {
    reported_at: DateTime<Utc>,
    state: ApplicationLiveState,
}

/// Coalescing reporter: at most one pending snapshot is kept per
/// application, so a burst of changes on a slow-moving resource never grows
/// unbounded the way an ordered queue would. A snapshot is sent when it
/// differs from the last one sent, or `min_report_interval` has elapsed,
/// whichever comes first.
pub struct LiveStateReporter {
    provider: Box<dyn LiveStateProvider>,
    min_report_interval: Duration,
    last_reported: Mutex<HashMap<ApplicationId, Coalesced>>,
    last_synced_commit: Mutex<HashMap<ApplicationId, Commit>>,
}

impl LiveStateReporter {
    pub fn new(provider: Box<dyn LiveStateProvider>, min_report_interval: Duration) -> Self {
        Self {
            provider,
            min_report_interval,
            last_reported: Mutex::new(HashMap::new()),
            last_synced_commit: Mutex::new(HashMap::new()),
        }
    }

    /// Observe every application in `store`, report changed or overdue
    /// snapshots, and create a drift-sourced deployment for any auto-sync
    /// application with an undeployed diff and no active deployment.
    pub fn tick(
        &self,
        store: &ApplicationStore,
        api: &dyn ApiClient,
        has_active_deployment: impl Fn(&ApplicationId) -> bool,
    ) -> Result<()> {
        let now = Utc::now();

        for app in store.list() {
            let observed = match self.provider.observe(&app) {
                Ok(Some(observed)) => observed,
                Ok(None) => continue,
                Err(err) => {
                    warn!(application_id = %app.id.0, error = %err, "live-state observation failed");
                    continue;
                }
            };

            let live_state = ApplicationLiveState {
                application_id: app.id.clone(),
                observed_at: now,
                health: observed.health,
                diff: observed.diff.clone(),
            };

            if self.should_report(&app.id, &live_state, now) {
                match api.report_application_live_state(&live_state) {
                    Ok(()) => {
                        self.last_reported
                            .lock()
                            .expect("live-state cache poisoned")
                            .insert(app.id.clone(), Coalesced { reported_at: now, state: live_state.clone() });
                    }
                    Err(err) => {
                        warn!(application_id = %app.id.0, error = %err, "failed to report live state");
                    }
                }
            }

            store.upsert(Application { live_state: Some(live_state.clone()), ..app.clone() });

            if app.config.auto_sync && !has_active_deployment(&app.id) {
                if let Some(diff) = &live_state.diff {
                    self.maybe_auto_sync(&app, diff, api);
                }
            }
        }

        Ok(())
    }

    fn should_report(&self, id: &ApplicationId, live_state: &ApplicationLiveState, now: DateTime<Utc>) -> bool {
        let cache = self.last_reported.lock().expect("live-state cache poisoned");
        match cache.get(id) {
            None => true,
            Some(previous) => {
                let changed = previous.state.health != live_state.health || previous.state.diff != live_state.diff;
                let elapsed = now.signed_duration_since(previous.reported_at).to_std().unwrap_or(Duration::ZERO);
                changed || elapsed >= self.min_report_interval
            }
        }
    }

    fn maybe_auto_sync(&self, app: &Application, diff: &LiveStateDiff, api: &dyn ApiClient) {
        let trigger_commit = {
            let synced = self.last_synced_commit.lock().expect("synced-commit cache poisoned");
            synced.get(&app.id).cloned().unwrap_or_else(|| diff.desired_commit.clone())
        };

        match api.create_deployment(&app.id, &trigger_commit.0, &diff.desired_commit.0, TriggerSource::Drift) {
            Ok(deployment_id) => {
                info!(application_id = %app.id.0, deployment_id = %deployment_id.0, "auto-sync deployment created from drift");
                self.last_synced_commit
                    .lock()
                    .expect("synced-commit cache poisoned")
                    .insert(app.id.clone(), diff.desired_commit.clone());
            }
            Err(err) => {
                warn!(application_id = %app.id.0, error = %err, "auto-sync create_deployment failed; will retry next tick");
            }
        }
    }
}

/// Run `reporter`'s tick loop at `poll_interval` until `cancel` fires.
pub fn run(
    reporter: &LiveStateReporter,
    store: &ApplicationStore,
    api: &dyn ApiClient,
    cancel: &CancellationToken,
    poll_interval: Duration,
    has_active_deployment: impl Fn(&ApplicationId) -> bool,
) {
    while !cancel.is_cancelled() {
        if let Err(err) = reporter.tick(store, api, &has_active_deployment) {
            warn!(error = %err, "live-state tick failed");
        }
        if cancel.wait_for(poll_interval) {
            return;
        }
    }
}
