//! Concrete [`CommandHandler`] implementations for the four command kinds
//! the control plane can issue (§6 "Command"). Registered against a
//! [`HandlerRegistry`](crate::command_stream::HandlerRegistry) by the agent
//! binary and driven by [`crate::command_stream::run`].

use std::sync::Arc;

use tracing::{info, warn};

use crate::api::ApiClient;
use crate::command_stream::CommandHandler;
use crate::controller::ApprovalGate;
use crate::store::ApplicationStore;
use crate::supervisor::Supervisor;
use crate::trigger;
use crate::types::{Command, CommandPayload, CommandResult, TriggerSource};

/// Cancels a running deployment by signalling its per-deployment
/// [`crate::cancel::CancellationToken`]. A deployment id the supervisor
/// isn't currently driving (already completed, or not dispatched yet) is a
/// no-op; the command is still acknowledged since there is nothing more this
/// piped can do about it.
pub struct CancelDeploymentHandler {
    pub supervisor: Arc<Supervisor>,
}

impl CommandHandler for CancelDeploymentHandler {
    fn handle(&self, command: &Command) -> CommandResult {
        let CommandPayload::CancelDeployment { deployment_id } = &command.kind else {
            warn!(command_id = %command.id.0, "cancel_deployment handler received mismatched payload");
            return CommandResult::Failed;
        };
        self.supervisor.cancel_deployment(deployment_id);
        CommandResult::Succeeded
    }
}

/// Records a stage approval so a blocked `APPROVAL` stage can proceed on the
/// controller's next poll of the gate.
pub struct ApproveStageHandler {
    pub approvals: ApprovalGate,
}

impl CommandHandler for ApproveStageHandler {
    fn handle(&self, command: &Command) -> CommandResult {
        let CommandPayload::ApproveStage { deployment_id, stage_index } = &command.kind else {
            warn!(command_id = %command.id.0, "approve_stage handler received mismatched payload");
            return CommandResult::Failed;
        };
        self.approvals.approve(deployment_id.clone(), *stage_index);
        CommandResult::Succeeded
    }
}

/// Forces a redeploy of an application's last known target commit outside
/// the Deployment Trigger's normal poll cadence, the way a user clicking
/// "sync" on an otherwise-unchanged application expects a fresh deployment
/// rather than waiting for the next diff.
///
/// If the application already has a non-terminal deployment, the sync is
/// suppressed — the API's single-active-deployment-per-application
/// invariant would reject a second one anyway, and the in-flight deployment
/// already reflects the most recent trigger.
pub struct SyncApplicationHandler {
    pub api: Arc<dyn ApiClient>,
    pub store: ApplicationStore,
}

impl CommandHandler for SyncApplicationHandler {
    fn handle(&self, command: &Command) -> CommandResult {
        let CommandPayload::SyncApplication { application_id } = &command.kind else {
            warn!(command_id = %command.id.0, "sync_application handler received mismatched payload");
            return CommandResult::Failed;
        };
        force_resync(self.api.as_ref(), &self.store, application_id, "sync_application")
    }
}

/// Re-triggers an application when its config changed while a deployment for
/// it was already running. The spec allows either re-planning the in-flight
/// deployment or picking the change up on its next completion; this agent
/// takes the latter, simpler path — a running deployment is left alone and
/// the command is acknowledged as a no-op, since the Deployment Trigger will
/// observe the same config change on its next tick once the current
/// deployment finishes. An idle application is force-resynced exactly like
/// `SyncApplicationHandler`.
pub struct ChainUpdateHandler {
    pub api: Arc<dyn ApiClient>,
    pub store: ApplicationStore,
}

impl CommandHandler for ChainUpdateHandler {
    fn handle(&self, command: &Command) -> CommandResult {
        let CommandPayload::ChainUpdate { deployment_id } = &command.kind else {
            warn!(command_id = %command.id.0, "chain_update handler received mismatched payload");
            return CommandResult::Failed;
        };

        let Some(deployment) = self.store.list().into_iter().find_map(|app| {
            (app.latest_deployment_id.as_ref() == Some(deployment_id)).then_some(app)
        }) else {
            warn!(command_id = %command.id.0, deployment_id = %deployment_id.0, "chain_update targets an unknown deployment; nothing to chain");
            return CommandResult::Failed;
        };

        if trigger::deployment_is_active(self.api.as_ref(), &deployment) {
            info!(command_id = %command.id.0, application_id = %deployment.id.0, "chain_update deferred: deployment already running, will be picked up on completion");
            return CommandResult::Succeeded;
        }

        force_resync(self.api.as_ref(), &self.store, &deployment.id, "chain_update")
    }
}

fn force_resync(
    api: &dyn ApiClient,
    store: &ApplicationStore,
    application_id: &crate::types::ApplicationId,
    reason: &'static str,
) -> CommandResult {
    let Some(application) = store.get(application_id) else {
        warn!(application_id = %application_id.0, reason, "force-resync requested for an application this piped doesn't track");
        return CommandResult::Failed;
    };

    if trigger::deployment_is_active(api, &application) {
        info!(application_id = %application_id.0, reason, "force-resync suppressed: deployment already running");
        return CommandResult::Succeeded;
    }

    let Some(last_deployment_id) = &application.latest_deployment_id else {
        warn!(application_id = %application_id.0, reason, "force-resync requested but application has never been deployed; will be picked up once the trigger discovers it");
        return CommandResult::Failed;
    };

    let last_deployment = match api.get_deployment(last_deployment_id) {
        Ok(deployment) => deployment,
        Err(err) => {
            warn!(application_id = %application_id.0, reason, error = %err, "force-resync failed to look up last deployment");
            return CommandResult::Failed;
        }
    };

    match api.create_deployment(
        application_id,
        &last_deployment.target_commit.0,
        &last_deployment.target_commit.0,
        TriggerSource::Command,
    ) {
        Ok(deployment_id) => {
            info!(application_id = %application_id.0, deployment_id = %deployment_id.0, reason, "force-resync created deployment");
            CommandResult::Succeeded
        }
        Err(err) => {
            warn!(application_id = %application_id.0, reason, error = %err, "force-resync failed to create deployment");
            CommandResult::Failed
        }
    }
}
