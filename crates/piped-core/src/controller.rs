//! Deployment Controller: drives one deployment's stage DAG from Plan
//! through Execute/React to a terminal status, the Plan/Execute/React/Report
//! cycle described in §4.7. Grounded in the teacher's `engine.rs::run_publish`
//! loop (state-checkpointed per-unit progress, retry-with-backoff around a
//! unit of work, classify-then-react), retargeted from a package publish
//! list to a stage DAG and from `cargo publish` exit codes to
//! [`ExecutorOutcome`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use piped_retry::{RetryPolicy, RetryStrategyConfig, calculate_delay};
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::cancel::CancellationToken;
use crate::executor::{ExecutorRegistry, Input, StageExecutor};
use crate::plan::{self, build_plan};
use crate::progress::{ProgressEventKind, ProgressReporter};
use crate::tool_registry::ToolRegistry;
use crate::types::{
    ApplicationConfig, Commit, DeploymentId, DeploymentStatus, ExecutorOutcome, Stage, StageKind,
    StageSpec, StageStatus, WorkspaceHandle,
};

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub max_parallel_stages: usize,
    pub approval_timeout: Duration,
    pub executor_cancellation_window: Duration,
    pub stage_retry: RetryStrategyConfig,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_parallel_stages: 4,
            approval_timeout: Duration::from_secs(3600),
            executor_cancellation_window: Duration::from_secs(30),
            stage_retry: RetryPolicy::Default.to_config(),
        }
    }
}

/// Tracks which `(deployment_id, stage_index)` approvals a command handler
/// has recorded. Cheap to clone; all clones share the same underlying set.
#[derive(Clone, Default)]
pub struct ApprovalGate {
    approved: Arc<Mutex<HashSet<(DeploymentId, usize)>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approve(&self, deployment_id: DeploymentId, stage_index: usize) {
        self.approved.lock().expect("approval gate poisoned").insert((deployment_id, stage_index));
    }

    pub fn is_approved(&self, deployment_id: &DeploymentId, stage_index: usize) -> bool {
        self.approved.lock().expect("approval gate poisoned").contains(&(deployment_id.clone(), stage_index))
    }
}

/// A small counting semaphore bounding the number of stage executions
/// running in parallel across the whole agent (§4.7, §5).
struct Semaphore {
    available: Mutex<usize>,
    freed: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self { available: Mutex::new(permits), freed: Condvar::new() }
    }

    fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut available = self.available.lock().expect("semaphore poisoned");
        while *available == 0 {
            available = self.freed.wait(available).expect("semaphore poisoned");
        }
        *available -= 1;
        SemaphoreGuard { semaphore: self }
    }
}

struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        *self.semaphore.available.lock().expect("semaphore poisoned") += 1;
        self.semaphore.freed.notify_one();
    }
}

/// Drive `deployment_id` to a terminal status. `pipeline` is the
/// application's declared pipeline; an empty pipeline becomes a single
/// `Sync` stage per §4.7.
#[allow(clippy::too_many_arguments)]
pub fn run_deployment(
    deployment_id: &DeploymentId,
    target_commit: &Commit,
    pipeline: &[StageSpec],
    app_config: &ApplicationConfig,
    trigger_workspace: &WorkspaceHandle,
    target_workspace: &WorkspaceHandle,
    executors: &ExecutorRegistry,
    tools: &ToolRegistry,
    tool_base_dir: &Path,
    api: &dyn ApiClient,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
    approvals: &ApprovalGate,
    opts: &ControllerOptions,
    checkpoint: &dyn Fn(&[Stage]),
) -> Result<DeploymentStatus> {
    let effective_pipeline: Vec<StageSpec> = if pipeline.is_empty() {
        vec![StageSpec { kind: StageKind::Sync, requires: Vec::new(), config: serde_json::Value::Null }]
    } else {
        pipeline.to_vec()
    };

    let built = build_plan(deployment_id, target_commit, &effective_pipeline)?;
    let mut stages = built.stages;
    api.report_deployment_planned(deployment_id, &stages).ok();
    info!(deployment_id = %deployment_id.0, plan_id = %built.plan_id, stage_count = stages.len(), "deployment planned");

    let levels = plan::group_by_levels(&stages);
    let semaphore = Semaphore::new(opts.max_parallel_stages.max(1));

    let mut terminal_status = DeploymentStatus::Success;

    for level in &levels {
        if terminal_status != DeploymentStatus::Success {
            for &index in level {
                skip_stage(&mut stages[index], deployment_id, progress);
            }
            checkpoint(&stages);
            continue;
        }

        if cancel.is_cancelled() {
            for &index in level {
                cancel_stage(&mut stages[index], deployment_id, progress);
            }
            terminal_status = DeploymentStatus::Cancelled;
            checkpoint(&stages);
            continue;
        }

        let outcomes = run_level(
            level,
            &mut stages,
            deployment_id,
            app_config,
            trigger_workspace,
            target_workspace,
            executors,
            tools,
            tool_base_dir,
            progress,
            cancel,
            approvals,
            opts,
            &semaphore,
        );

        for outcome in outcomes {
            match outcome {
                ExecutorOutcome::Failure => terminal_status = DeploymentStatus::Failure,
                ExecutorOutcome::Cancelled => terminal_status = DeploymentStatus::Cancelled,
                ExecutorOutcome::Success | ExecutorOutcome::ExitedWithSkip => {}
            }
        }
        checkpoint(&stages);
    }

    progress.emit(
        deployment_id.clone(),
        ProgressEventKind::DeploymentStatusChanged { status: terminal_status, reason: None },
    );
    api.report_deployment_status_changed(deployment_id, terminal_status, None).ok();

    Ok(terminal_status)
}

#[allow(clippy::too_many_arguments)]
fn run_level(
    level: &[usize],
    stages: &mut [Stage],
    deployment_id: &DeploymentId,
    app_config: &ApplicationConfig,
    trigger_workspace: &WorkspaceHandle,
    target_workspace: &WorkspaceHandle,
    executors: &ExecutorRegistry,
    tools: &ToolRegistry,
    tool_base_dir: &Path,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
    approvals: &ApprovalGate,
    opts: &ControllerOptions,
    semaphore: &Semaphore,
) -> Vec<ExecutorOutcome> {
    let mut outcomes = vec![ExecutorOutcome::Success; level.len()];

    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for (slot, &index) in level.iter().enumerate() {
            let stage = &mut stages[index];
            let handle = scope.spawn(|| {
                let _permit = semaphore.acquire();
                run_stage(
                    stage,
                    deployment_id,
                    app_config,
                    trigger_workspace,
                    target_workspace,
                    executors,
                    tools,
                    tool_base_dir,
                    progress,
                    cancel,
                    approvals,
                    opts,
                )
            });
            handles.push((slot, handle));
        }
        for (slot, handle) in handles {
            outcomes[slot] = handle.join().unwrap_or(ExecutorOutcome::Failure);
        }
    });

    outcomes
}

#[allow(clippy::too_many_arguments)]
fn run_stage(
    stage: &mut Stage,
    deployment_id: &DeploymentId,
    app_config: &ApplicationConfig,
    trigger_workspace: &WorkspaceHandle,
    target_workspace: &WorkspaceHandle,
    executors: &ExecutorRegistry,
    tools: &ToolRegistry,
    tool_base_dir: &Path,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
    approvals: &ApprovalGate,
    opts: &ControllerOptions,
) -> ExecutorOutcome {
    transition(stage, deployment_id, StageStatus::Running, None, progress);
    stage.started_at = Some(Utc::now());

    let outcome = if stage.kind == StageKind::Approval {
        run_approval(stage, deployment_id, cancel, approvals, opts.approval_timeout)
    } else {
        run_with_retry(
            stage,
            deployment_id,
            app_config,
            trigger_workspace,
            target_workspace,
            executors,
            tools,
            tool_base_dir,
            cancel,
            opts,
        )
    };

    stage.completed_at = Some(Utc::now());
    let final_status = match outcome {
        ExecutorOutcome::Success => StageStatus::Success,
        ExecutorOutcome::Failure => StageStatus::Failure,
        ExecutorOutcome::Cancelled => StageStatus::Cancelled,
        ExecutorOutcome::ExitedWithSkip => StageStatus::Skipped,
    };
    transition(stage, deployment_id, final_status, stage.status_reason.clone(), progress);
    outcome
}

fn run_approval(
    stage: &mut Stage,
    deployment_id: &DeploymentId,
    cancel: &CancellationToken,
    approvals: &ApprovalGate,
    timeout: Duration,
) -> ExecutorOutcome {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if approvals.is_approved(deployment_id, stage.index) {
            return ExecutorOutcome::Success;
        }
        if cancel.is_cancelled() {
            return ExecutorOutcome::Cancelled;
        }
        if std::time::Instant::now() >= deadline {
            stage.status_reason = Some("approval timed out".to_string());
            return ExecutorOutcome::Failure;
        }
        if cancel.wait_for(Duration::from_millis(200)) {
            return ExecutorOutcome::Cancelled;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_with_retry(
    stage: &mut Stage,
    deployment_id: &DeploymentId,
    app_config: &ApplicationConfig,
    trigger_workspace: &WorkspaceHandle,
    target_workspace: &WorkspaceHandle,
    executors: &ExecutorRegistry,
    tools: &ToolRegistry,
    tool_base_dir: &Path,
    cancel: &CancellationToken,
    opts: &ControllerOptions,
) -> ExecutorOutcome {
    loop {
        if cancel.is_cancelled() {
            return ExecutorOutcome::Cancelled;
        }

        let executor = match executors.executor_for(stage.kind) {
            Ok(executor) => executor,
            Err(err) => {
                stage.status_reason = Some(err.to_string());
                return ExecutorOutcome::Failure;
            }
        };

        let outcome = match execute_with_watchdog(
            executor,
            stage.config.clone(),
            app_config.clone(),
            trigger_workspace.clone(),
            target_workspace.clone(),
            tools.clone(),
            tool_base_dir.to_path_buf(),
            cancel.clone(),
            opts.executor_cancellation_window,
        ) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(deployment_id = %deployment_id.0, stage_index = stage.index, error = %err, "stage executor errored");
                stage.status_reason = Some(err.to_string());
                ExecutorOutcome::Failure
            }
        };

        if outcome != ExecutorOutcome::Failure {
            return outcome;
        }

        if stage.retry_count >= opts.stage_retry.max_attempts {
            return ExecutorOutcome::Failure;
        }
        stage.retry_count += 1;
        let delay = calculate_delay(&opts.stage_retry, stage.retry_count);
        warn!(deployment_id = %deployment_id.0, stage_index = stage.index, attempt = stage.retry_count, "stage failed; retrying");
        if cancel.wait_for(delay) {
            return ExecutorOutcome::Cancelled;
        }
    }
}

/// Run `executor` on a detached thread and wait for it, but only up to
/// `window` past the moment `cancel` first fires. A well-behaved executor
/// observes `cancel` via its `Input` and returns promptly; one that doesn't
/// (hung subprocess, blocking call with no cancellation check) is abandoned
/// — its thread is left running unjoined — so the stage still reaches a
/// terminal `Cancelled` status instead of blocking the whole deployment.
#[allow(clippy::too_many_arguments)]
fn execute_with_watchdog(
    executor: Box<dyn StageExecutor>,
    stage_config: serde_json::Value,
    app_config: ApplicationConfig,
    trigger_workspace: WorkspaceHandle,
    target_workspace: WorkspaceHandle,
    tools: ToolRegistry,
    tool_base_dir: PathBuf,
    cancel: CancellationToken,
    window: Duration,
) -> Result<ExecutorOutcome> {
    let (tx, rx) = mpsc::channel();
    let thread_cancel = cancel.clone();
    std::thread::spawn(move || {
        let mut log = |_line: &str| {};
        let input = Input {
            trigger_workspace: &trigger_workspace,
            target_workspace: &target_workspace,
            stage_config: &stage_config,
            app_config: &app_config,
            cancel: &thread_cancel,
            log: &mut log,
            tools: &tools,
            tool_base_dir: &tool_base_dir,
        };
        let _ = tx.send(executor.execute(input));
    });

    let mut cancelled_at: Option<Instant> = None;
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(result) => return result,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Ok(ExecutorOutcome::Failure);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    let since = *cancelled_at.get_or_insert_with(Instant::now);
                    if since.elapsed() >= window {
                        warn!("stage executor did not return within the cancellation window; abandoning it");
                        return Ok(ExecutorOutcome::Cancelled);
                    }
                }
            }
        }
    }
}

fn transition(
    stage: &mut Stage,
    deployment_id: &DeploymentId,
    status: StageStatus,
    reason: Option<String>,
    progress: &ProgressReporter,
) {
    stage.status = status;
    progress.emit(
        deployment_id.clone(),
        ProgressEventKind::StageStatusChanged { stage_index: stage.index, status, reason: reason.clone() },
    );
}

fn skip_stage(stage: &mut Stage, deployment_id: &DeploymentId, progress: &ProgressReporter) {
    if stage.status.is_terminal() {
        return;
    }
    transition(stage, deployment_id, StageStatus::Skipped, None, progress);
}

fn cancel_stage(stage: &mut Stage, deployment_id: &DeploymentId, progress: &ProgressReporter) {
    if stage.status.is_terminal() {
        return;
    }
    transition(stage, deployment_id, StageStatus::Cancelled, None, progress);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockApiClient;
    use crate::executor::StageExecutorFactory;
    use crate::types::{Commit, RepositoryId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sample_app_config(pipeline: Vec<StageSpec>) -> ApplicationConfig {
        ApplicationConfig {
            kind: crate::types::ProviderKind::Kubernetes,
            pipeline,
            auto_sync: false,
            watched_paths: Vec::new(),
            watched_images: Vec::new(),
        }
    }

    fn sample_workspace() -> WorkspaceHandle {
        WorkspaceHandle {
            repo_id: RepositoryId("repo-1".to_string()),
            commit: Commit("abc".to_string()),
            path: PathBuf::from("/tmp/workspace"),
        }
    }

    struct ScriptedExecutor {
        outcome: ExecutorOutcome,
    }

    impl StageExecutor for ScriptedExecutor {
        fn execute(&self, _input: Input<'_>) -> Result<ExecutorOutcome> {
            Ok(self.outcome)
        }
    }

    fn scripted_factory(outcome: ExecutorOutcome) -> Arc<dyn StageExecutorFactory> {
        Arc::new(move || -> Box<dyn StageExecutor> { Box::new(ScriptedExecutor { outcome }) })
    }

    fn spec(kind: StageKind, requires: &[usize]) -> StageSpec {
        StageSpec { kind, requires: requires.to_vec(), config: serde_json::Value::Null }
    }

    /// Push every event still sitting in `progress` through to `api`,
    /// mirroring what the real `progress::run` consumer would have done.
    fn flush_progress(progress: &ProgressReporter, api: &dyn ApiClient) {
        for event in progress.drain_all() {
            crate::progress::send_once(api, &event).expect("mock api send never fails");
        }
    }

    #[test]
    fn linear_pipeline_happy_path() {
        let registry = ExecutorRegistry::new();
        registry.register(StageKind::Plan, scripted_factory(ExecutorOutcome::Success)).unwrap();
        registry.register(StageKind::Apply, scripted_factory(ExecutorOutcome::Success)).unwrap();

        let pipeline = vec![spec(StageKind::Plan, &[]), spec(StageKind::Apply, &[0])];
        let app_config = sample_app_config(pipeline.clone());
        let tools = ToolRegistry::new(PathBuf::from("/tmp/tools"));
        let api = MockApiClient::new();
        let progress = ProgressReporter::new(64);
        let cancel = CancellationToken::new();
        let approvals = ApprovalGate::new();
        let opts = ControllerOptions::default();
        let deployment_id = DeploymentId("d1".to_string());
        let trigger_ws = sample_workspace();
        let target_ws = sample_workspace();

        let status = run_deployment(
            &deployment_id,
            &Commit("b".to_string()),
            &pipeline,
            &app_config,
            &trigger_ws,
            &target_ws,
            &registry,
            &tools,
            Path::new("/tmp/tools"),
            &api,
            &progress,
            &cancel,
            &approvals,
            &opts,
            &|_stages: &[Stage]| {},
        )
        .expect("run_deployment");

        assert_eq!(status, DeploymentStatus::Success);
        flush_progress(&progress, &api);
        let statuses = api.reported_stage_statuses();
        assert!(statuses.iter().any(|(_, idx, s)| *idx == 0 && *s == StageStatus::Success));
        assert!(statuses.iter().any(|(_, idx, s)| *idx == 1 && *s == StageStatus::Success));
    }

    #[test]
    fn failure_skips_subsequent_stages() {
        let registry = ExecutorRegistry::new();
        registry.register(StageKind::Plan, scripted_factory(ExecutorOutcome::Success)).unwrap();
        registry.register(StageKind::Analysis, scripted_factory(ExecutorOutcome::Failure)).unwrap();
        registry.register(StageKind::Apply, scripted_factory(ExecutorOutcome::Success)).unwrap();

        let pipeline = vec![
            spec(StageKind::Plan, &[]),
            spec(StageKind::Analysis, &[0]),
            spec(StageKind::Apply, &[1]),
        ];
        let app_config = sample_app_config(pipeline.clone());
        let tools = ToolRegistry::new(PathBuf::from("/tmp/tools"));
        let api = MockApiClient::new();
        let progress = ProgressReporter::new(64);
        let cancel = CancellationToken::new();
        let approvals = ApprovalGate::new();
        let mut opts = ControllerOptions::default();
        opts.stage_retry.max_attempts = 0;
        let deployment_id = DeploymentId("d1".to_string());
        let trigger_ws = sample_workspace();
        let target_ws = sample_workspace();

        let status = run_deployment(
            &deployment_id,
            &Commit("b".to_string()),
            &pipeline,
            &app_config,
            &trigger_ws,
            &target_ws,
            &registry,
            &tools,
            Path::new("/tmp/tools"),
            &api,
            &progress,
            &cancel,
            &approvals,
            &opts,
            &|_stages: &[Stage]| {},
        )
        .expect("run_deployment");

        assert_eq!(status, DeploymentStatus::Failure);
        flush_progress(&progress, &api);
        let statuses = api.reported_stage_statuses();
        assert!(statuses.iter().any(|(_, idx, s)| *idx == 1 && *s == StageStatus::Failure));
        assert!(statuses.iter().any(|(_, idx, s)| *idx == 2 && *s == StageStatus::Skipped));
    }

    #[test]
    fn approval_timeout_fails_stage_and_skips_rest() {
        let registry = ExecutorRegistry::new();
        registry.register(StageKind::Apply, scripted_factory(ExecutorOutcome::Success)).unwrap();

        let pipeline = vec![spec(StageKind::Approval, &[]), spec(StageKind::Apply, &[0])];
        let app_config = sample_app_config(pipeline.clone());
        let tools = ToolRegistry::new(PathBuf::from("/tmp/tools"));
        let api = MockApiClient::new();
        let progress = ProgressReporter::new(64);
        let cancel = CancellationToken::new();
        let approvals = ApprovalGate::new();
        let mut opts = ControllerOptions::default();
        opts.approval_timeout = Duration::from_millis(50);
        let deployment_id = DeploymentId("d1".to_string());
        let trigger_ws = sample_workspace();
        let target_ws = sample_workspace();

        let status = run_deployment(
            &deployment_id,
            &Commit("b".to_string()),
            &pipeline,
            &app_config,
            &trigger_ws,
            &target_ws,
            &registry,
            &tools,
            Path::new("/tmp/tools"),
            &api,
            &progress,
            &cancel,
            &approvals,
            &opts,
            &|_stages: &[Stage]| {},
        )
        .expect("run_deployment");

        assert_eq!(status, DeploymentStatus::Failure);
        flush_progress(&progress, &api);
        let statuses = api.reported_stage_statuses();
        assert!(statuses.iter().any(|(_, idx, s)| *idx == 0 && *s == StageStatus::Failure));
        assert!(statuses.iter().any(|(_, idx, s)| *idx == 1 && *s == StageStatus::Skipped));
    }

    #[test]
    fn approval_granted_lets_pipeline_proceed() {
        let registry = ExecutorRegistry::new();
        registry.register(StageKind::Apply, scripted_factory(ExecutorOutcome::Success)).unwrap();

        let pipeline = vec![spec(StageKind::Approval, &[]), spec(StageKind::Apply, &[0])];
        let app_config = sample_app_config(pipeline.clone());
        let tools = ToolRegistry::new(PathBuf::from("/tmp/tools"));
        let api = MockApiClient::new();
        let progress = ProgressReporter::new(64);
        let cancel = CancellationToken::new();
        let approvals = ApprovalGate::new();
        let deployment_id = DeploymentId("d1".to_string());
        approvals.approve(deployment_id.clone(), 0);
        let mut opts = ControllerOptions::default();
        opts.approval_timeout = Duration::from_secs(5);
        let trigger_ws = sample_workspace();
        let target_ws = sample_workspace();

        let status = run_deployment(
            &deployment_id,
            &Commit("b".to_string()),
            &pipeline,
            &app_config,
            &trigger_ws,
            &target_ws,
            &registry,
            &tools,
            Path::new("/tmp/tools"),
            &api,
            &progress,
            &cancel,
            &approvals,
            &opts,
            &|_stages: &[Stage]| {},
        )
        .expect("run_deployment");

        assert_eq!(status, DeploymentStatus::Success);
    }

    #[test]
    fn empty_pipeline_becomes_single_sync_stage() {
        let registry = ExecutorRegistry::new();
        registry.register(StageKind::Sync, scripted_factory(ExecutorOutcome::Success)).unwrap();

        let app_config = sample_app_config(Vec::new());
        let tools = ToolRegistry::new(PathBuf::from("/tmp/tools"));
        let api = MockApiClient::new();
        let progress = ProgressReporter::new(64);
        let cancel = CancellationToken::new();
        let approvals = ApprovalGate::new();
        let opts = ControllerOptions::default();
        let deployment_id = DeploymentId("d1".to_string());
        let trigger_ws = sample_workspace();
        let target_ws = sample_workspace();

        let status = run_deployment(
            &deployment_id,
            &Commit("b".to_string()),
            &[],
            &app_config,
            &trigger_ws,
            &target_ws,
            &registry,
            &tools,
            Path::new("/tmp/tools"),
            &api,
            &progress,
            &cancel,
            &approvals,
            &opts,
            &|_stages: &[Stage]| {},
        )
        .expect("run_deployment");

        assert_eq!(status, DeploymentStatus::Success);
    }

    #[test]
    fn retryable_failure_eventually_succeeds() {
        struct FlakyExecutor {
            remaining_failures: AtomicUsize,
        }
        impl StageExecutor for FlakyExecutor {
            fn execute(&self, _input: Input<'_>) -> Result<ExecutorOutcome> {
                if self.remaining_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                    Ok(ExecutorOutcome::Failure)
                } else {
                    Ok(ExecutorOutcome::Success)
                }
            }
        }

        let registry = ExecutorRegistry::new();
        registry
            .register(
                StageKind::Plan,
                Arc::new(|| -> Box<dyn StageExecutor> {
                    Box::new(FlakyExecutor { remaining_failures: AtomicUsize::new(2) })
                }),
            )
            .unwrap();

        let pipeline = vec![spec(StageKind::Plan, &[])];
        let app_config = sample_app_config(pipeline.clone());
        let tools = ToolRegistry::new(PathBuf::from("/tmp/tools"));
        let api = MockApiClient::new();
        let progress = ProgressReporter::new(64);
        let cancel = CancellationToken::new();
        let approvals = ApprovalGate::new();
        let mut opts = ControllerOptions::default();
        opts.stage_retry.max_attempts = 5;
        opts.stage_retry.base_delay = Duration::from_millis(1);
        opts.stage_retry.max_delay = Duration::from_millis(5);
        opts.stage_retry.jitter = 0.0;
        let deployment_id = DeploymentId("d1".to_string());
        let trigger_ws = sample_workspace();
        let target_ws = sample_workspace();

        let status = run_deployment(
            &deployment_id,
            &Commit("b".to_string()),
            &pipeline,
            &app_config,
            &trigger_ws,
            &target_ws,
            &registry,
            &tools,
            Path::new("/tmp/tools"),
            &api,
            &progress,
            &cancel,
            &approvals,
            &opts,
            &|_stages: &[Stage]| {},
        )
        .expect("run_deployment");

        assert_eq!(status, DeploymentStatus::Success);
    }

    #[test]
    fn cancellation_mid_apply_force_completes_within_watchdog_window() {
        struct HangingExecutor {
            started: Arc<std::sync::atomic::AtomicBool>,
        }
        impl StageExecutor for HangingExecutor {
            fn execute(&self, _input: Input<'_>) -> Result<ExecutorOutcome> {
                self.started.store(true, Ordering::SeqCst);
                // Never observes `cancel` — models a stuck/unresponsive
                // stage executor that the watchdog must abandon.
                std::thread::sleep(Duration::from_secs(5));
                Ok(ExecutorOutcome::Success)
            }
        }

        let started = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let registry = ExecutorRegistry::new();
        registry
            .register(StageKind::Apply, {
                let started = started.clone();
                Arc::new(move || -> Box<dyn StageExecutor> { Box::new(HangingExecutor { started: started.clone() }) })
            })
            .unwrap();
        registry.register(StageKind::Sync, scripted_factory(ExecutorOutcome::Success)).unwrap();

        let pipeline = vec![spec(StageKind::Apply, &[]), spec(StageKind::Sync, &[0])];
        let app_config = sample_app_config(pipeline.clone());
        let tools = ToolRegistry::new(PathBuf::from("/tmp/tools"));
        let api = MockApiClient::new();
        let progress = ProgressReporter::new(64);
        let cancel = CancellationToken::new();
        let approvals = ApprovalGate::new();
        let mut opts = ControllerOptions::default();
        opts.executor_cancellation_window = Duration::from_millis(100);
        let deployment_id = DeploymentId("d1".to_string());
        let trigger_ws = sample_workspace();
        let target_ws = sample_workspace();

        let canceller = {
            let cancel = cancel.clone();
            let started = started.clone();
            std::thread::spawn(move || {
                while !started.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                cancel.cancel();
            })
        };

        let start = Instant::now();
        let status = run_deployment(
            &deployment_id,
            &Commit("b".to_string()),
            &pipeline,
            &app_config,
            &trigger_ws,
            &target_ws,
            &registry,
            &tools,
            Path::new("/tmp/tools"),
            &api,
            &progress,
            &cancel,
            &approvals,
            &opts,
            &|_stages: &[Stage]| {},
        )
        .expect("run_deployment");
        let elapsed = start.elapsed();
        canceller.join().expect("canceller joins");

        assert_eq!(status, DeploymentStatus::Cancelled);
        assert!(elapsed < Duration::from_secs(2), "deployment should not wait for the hung executor: {elapsed:?}");

        flush_progress(&progress, &api);
        let statuses = api.reported_stage_statuses();
        assert!(statuses.iter().any(|(_, idx, s)| *idx == 0 && *s == StageStatus::Cancelled));
        assert!(statuses.iter().any(|(_, idx, s)| *idx == 1 && *s == StageStatus::Skipped));
    }
}
