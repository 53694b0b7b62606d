//! Long-poll loop against `ApiClient::list_unhandled_commands`, dispatching
//! each command by kind to a registered handler. Delivery is at-least-once;
//! handlers are responsible for being idempotent with respect to
//! `command.id`, since the same command may be redelivered if the agent
//! restarts before acknowledging it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use piped_retry::{RetryPolicy, calculate_delay};
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::cancel::CancellationToken;
use crate::types::{Command, CommandId, CommandPayload, CommandResult};

/// A handler reacts to one command and returns the result to acknowledge
/// with. Handlers never see redelivery suppressed for them — that is the
/// caller's responsibility, keyed by `command.id`.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: &Command) -> CommandResult;
}

fn kind_key(payload: &CommandPayload) -> &'static str {
    match payload {
        CommandPayload::SyncApplication { .. } => "sync_application",
        CommandPayload::CancelDeployment { .. } => "cancel_deployment",
        CommandPayload::ApproveStage { .. } => "approve_stage",
        CommandPayload::ChainUpdate { .. } => "chain_update",
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<&'static str, Arc<dyn CommandHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: &'static str, handler: Arc<dyn CommandHandler>) {
        self.handlers.write().expect("handler registry poisoned").insert(kind, handler);
    }

    fn get(&self, kind: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.read().expect("handler registry poisoned").get(kind).cloned()
    }
}

/// Poll `api` for unhandled commands at `poll_interval` until `cancel`
/// fires, dispatching each to its registered handler and acknowledging the
/// result. Commands whose kind has no registered handler are left
/// unacknowledged so the API redelivers once a handler is registered or an
/// operator intervenes.
pub fn run(
    api: &dyn ApiClient,
    piped_id: &str,
    handlers: &HandlerRegistry,
    cancel: &CancellationToken,
    poll_interval: Duration,
) {
    let retry_config = RetryPolicy::Conservative.to_config();
    let mut consecutive_failures: u32 = 0;

    while !cancel.is_cancelled() {
        match api.list_unhandled_commands(piped_id) {
            Ok(commands) => {
                consecutive_failures = 0;
                for command in &commands {
                    dispatch_one(api, handlers, command);
                }
            }
            Err(err) => {
                consecutive_failures += 1;
                warn!(error = %err, attempt = consecutive_failures, "command poll failed");
                let delay = calculate_delay(&retry_config, consecutive_failures);
                if cancel.wait_for(delay) {
                    return;
                }
                continue;
            }
        }

        if cancel.wait_for(poll_interval) {
            return;
        }
    }
}

fn dispatch_one(api: &dyn ApiClient, handlers: &HandlerRegistry, command: &Command) {
    let kind = kind_key(&command.kind);
    let Some(handler) = handlers.get(kind) else {
        warn!(command_id = %command.id.0, kind, "no handler registered; leaving unacknowledged");
        return;
    };

    let result = handler.handle(command);
    info!(command_id = %command.id.0, kind, ?result, "command handled");
    if let Err(err) = api.report_command_handled(&command.id, result) {
        warn!(command_id = %command.id.0, error = %err, "failed to acknowledge command");
    }
}
