//! `piped-agent`: the CLI entrypoint. Parses flags, loads and validates the
//! `piped.toml` config, wires the Lifecycle Supervisor, and blocks until
//! shutdown (§4.11).
//!
//! Concrete provider mechanics below the stage-executor boundary — cloud
//! deployment tools, image-registry and live-state introspection backends —
//! are out of scope here the same way they are for `piped-core` (§1's
//! Non-goals: "provider-specific deployment mechanics ... below the
//! stage-executor boundary"). This binary wires the workers it can run for
//! real: git-backed triggers, the deployment controller, the command
//! stream (with its four `CommandHandler`s registered), and the progress
//! sender. A deployment hosting this agent with real cloud/image providers
//! plugs them in via `Supervisor::spawn_live_state_reporter` /
//! `spawn_image_watcher`, and registers its `StageExecutor`s on the
//! `ExecutorRegistry` built below.

mod api_client;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use piped_core::api::ApiClient;
use piped_core::command_handlers::{
    ApproveStageHandler, CancelDeploymentHandler, ChainUpdateHandler, SyncApplicationHandler,
};
use piped_core::command_stream::HandlerRegistry;
use piped_core::config::{CliOverrides, LogFormat, PipedConfig};
use piped_core::controller::ControllerOptions;
use piped_core::executor::ExecutorRegistry;
use piped_core::supervisor::Supervisor;
use piped_core::tool_registry::ToolRegistry;
use piped_core::trigger::RepositoryTrigger;
use piped_core::types::ProjectId;
use tracing_subscriber::EnvFilter;

use crate::api_client::HttpApiClient;

#[derive(Parser, Debug)]
#[command(name = "piped-agent", version)]
#[command(about = "Continuous-delivery deployment agent")]
struct Cli {
    /// Path to the piped.toml config file.
    #[arg(long, default_value = "./piped.toml")]
    config: PathBuf,

    /// Overrides the piped signing key file path from the config.
    #[arg(long)]
    piped_key_file: Option<PathBuf>,

    /// Overrides the state directory from the config.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Overrides the log level from the config (e.g. "info", "debug").
    #[arg(long)]
    log_level: Option<String>,

    /// Overrides the log format from the config ("plain" or "json").
    #[arg(long)]
    log_format: Option<String>,

    /// Overrides the project id this piped authenticates as.
    #[arg(long)]
    project_id: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("piped-agent: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = PipedConfig::load_from_file(&cli.config)
        .with_context(|| format!("failed to load config: {}", cli.config.display()))?;

    let overrides = CliOverrides {
        piped_key_file: cli.piped_key_file.clone(),
        state_dir: cli.state_dir.clone(),
        log_level: cli.log_level.clone(),
        log_format: cli.log_format.clone(),
    };
    let runtime = config.build_runtime_options(overrides);

    init_tracing(&runtime.log_level, runtime.log_format);

    let supervisor = Supervisor::bootstrap(&config, &runtime, cli.project_id.as_deref())?;

    let api: Arc<dyn ApiClient> = Arc::new(
        HttpApiClient::new(&config.api_address, &supervisor.identity.piped_key)
            .context("failed to build API client")?,
    );

    for deployment in supervisor.reclaim_in_flight(api.as_ref())? {
        tracing::info!(deployment_id = %deployment.id.0, application_id = %deployment.application_id.0, "reclaimed deployment on startup");
    }

    let project_id = ProjectId(supervisor.identity.project_id.clone());
    let triggers: Vec<RepositoryTrigger> = config
        .repositories
        .iter()
        .cloned()
        .map(|repo| RepositoryTrigger::new(repo, project_id.clone()))
        .collect();
    supervisor.spawn_triggers(triggers, api.clone(), config.sync_interval);

    let handlers = HandlerRegistry::new();
    handlers.register(
        "cancel_deployment",
        Arc::new(CancelDeploymentHandler { supervisor: supervisor.clone() }),
    );
    handlers.register(
        "approve_stage",
        Arc::new(ApproveStageHandler { approvals: supervisor.approvals.clone() }),
    );
    handlers.register(
        "sync_application",
        Arc::new(SyncApplicationHandler { api: api.clone(), store: supervisor.store.clone() }),
    );
    handlers.register(
        "chain_update",
        Arc::new(ChainUpdateHandler { api: api.clone(), store: supervisor.store.clone() }),
    );
    supervisor.spawn_command_stream(handlers, api.clone(), Duration::from_secs(5));

    let executors = ExecutorRegistry::new();
    let tool_base_dir = runtime.state_dir.join("tools");
    let tools = ToolRegistry::new(tool_base_dir.clone());
    supervisor.spawn_controller(
        api.clone(),
        executors,
        tools,
        tool_base_dir,
        ControllerOptions::default(),
        Duration::from_secs(5),
    );

    supervisor.spawn_progress_sender(api.clone(), 50, Duration::from_secs(2));

    let shutdown_signal = supervisor.cancel.clone();
    ctrlc::set_handler(move || shutdown_signal.cancel()).context("failed to install signal handler")?;

    while !supervisor.cancel.wait_for(Duration::from_secs(3600)) {}

    tracing::info!("shutdown signal received, draining workers");
    supervisor.shutdown(api.as_ref());
    Ok(())
}

fn init_tracing(log_level: &str, log_format: LogFormat) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Plain => subscriber.init(),
    }
}
