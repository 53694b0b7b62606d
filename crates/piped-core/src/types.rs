//! Domain types for the Piped deployment engine: applications, deployments,
//! stages, live state, commands, and the workspace handle that threads
//! through the git and execution layers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{DurationMilliSeconds, serde_as};

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds).
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds so it roundtrips with `deserialize_duration`.
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Stable identifiers. Newtypes rather than bare `String` so a project id can
/// never be handed where an application id is expected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApplicationId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepositoryId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeploymentId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommandId(pub String);

/// Commit SHA. No validation beyond non-empty; git is the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Commit(pub String);

impl std::fmt::Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cloud provider an application can be deployed to. Stage kinds below
/// are not tied 1:1 to providers; a kind interprets its own config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Kubernetes,
    Terraform,
    CloudRun,
    Lambda,
}

/// A unit of deployable software, discovered by scanning a configured repo.
///
/// Invariant: `(repo_id, path)` is unique within a project — enforced by
/// `ApplicationStore` at insert time, not by this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    pub project_id: ProjectId,
    pub kind: ProviderKind,
    pub repo_id: RepositoryId,
    pub path: PathBuf,
    pub config: ApplicationConfig,
    pub live_state: Option<ApplicationLiveState>,
    pub latest_deployment_id: Option<DeploymentId>,
    /// Set when the config file at `path` has disappeared. Soft-deleted
    /// applications remain in the store (deployments reference them by id)
    /// but are excluded from trigger/live-state scans.
    pub deleted: bool,
}

/// The per-application config file content (§6 "Per-application file").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub kind: ProviderKind,
    pub pipeline: Vec<StageSpec>,
    #[serde(default)]
    pub auto_sync: bool,
    #[serde(default)]
    pub watched_paths: Vec<PathBuf>,
    /// Image patterns (e.g. `registry.example.com/app:*`) this application
    /// reacts to. The Image Watcher binds a tracked pattern's tag change to
    /// every application whose `watched_images` contains it.
    #[serde(default)]
    pub watched_images: Vec<String>,
}

/// A stage as declared in config, before planning resolves it against a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub kind: StageKind,
    #[serde(default)]
    pub requires: Vec<usize>,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// The closed set of stage kinds a controller can plan. Third-party stages
/// are compiled in, not discovered at runtime (§9 Design Notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Plan,
    Apply,
    Analysis,
    Canary,
    Approval,
    Sync,
}

/// What caused a deployment to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Scheduled,
    Command,
    ImageUpdate,
    Drift,
}

/// An intent to move an application from one commit to another.
///
/// Invariant: at most one non-terminal deployment per application id,
/// enforced by the control-plane API and defended locally by the
/// per-application lock in [`crate::lock`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub application_id: ApplicationId,
    pub trigger_commit: Commit,
    pub target_commit: Commit,
    pub trigger_source: TriggerSource,
    pub stages: Vec<Stage>,
    pub status: DeploymentStatus,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Running,
    Success,
    Failure,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Failure | DeploymentStatus::Cancelled
        )
    }
}

/// A single node in a deployment's stage DAG.
///
/// Invariant: a stage transitions only `NotStarted -> Running -> terminal`,
/// never backward. Enforced by [`crate::controller`], not by this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub index: usize,
    pub kind: StageKind,
    pub requires: Vec<usize>,
    pub config: serde_json::Value,
    pub status: StageStatus,
    pub retry_count: u32,
    pub status_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    NotStarted,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Success
                | StageStatus::Failure
                | StageStatus::Cancelled
                | StageStatus::Skipped
        )
    }
}

/// What a stage executor reports back to the controller for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorOutcome {
    Success,
    Failure,
    Cancelled,
    ExitedWithSkip,
}

/// The last observed projection of an application's resources, plus the
/// diff against the desired state rendered from the configured branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationLiveState {
    pub application_id: ApplicationId,
    pub observed_at: DateTime<Utc>,
    pub health: HealthSummary,
    pub diff: Option<LiveStateDiff>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthSummary {
    Healthy,
    Degraded,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStateDiff {
    pub desired_commit: Commit,
    pub changed_resource_keys: Vec<String>,
}

/// A user-initiated request. Claimed by exactly one handler and acknowledged
/// by writing `handled_at`; the API redelivers until acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub target_id: String,
    pub issuer: String,
    pub issued_at: DateTime<Utc>,
    pub handled_at: Option<DateTime<Utc>>,
    pub kind: CommandPayload,
}

/// Tagged union so the payload shape is pinned to the command kind at parse
/// time (same pattern as the engine's `PackageState`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandPayload {
    SyncApplication { application_id: ApplicationId },
    CancelDeployment { deployment_id: DeploymentId },
    ApproveStage { deployment_id: DeploymentId, stage_index: usize },
    ChainUpdate { deployment_id: DeploymentId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandResult {
    Succeeded,
    Failed,
}

/// A local checked-out working tree, keyed by `(repo_id, commit)`.
#[derive(Debug, Clone)]
pub struct WorkspaceHandle {
    pub repo_id: RepositoryId,
    pub commit: Commit,
    pub path: PathBuf,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    pub id: RepositoryId,
    pub remote: String,
    pub branch: String,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_sync_interval"
    )]
    pub sync_interval: Duration,
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Permanent,
    Ambiguous,
}

/// Runtime checkpoint of one deployment's stage progress, persisted by
/// [`crate::state`] and reloaded by the supervisor on restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentCheckpoint {
    pub deployment_id: DeploymentId,
    pub application_id: ApplicationId,
    pub plan_id: String,
    pub stages: Vec<Stage>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipedRuntimeState {
    pub state_version: String,
    pub piped_id: String,
    pub deployments: BTreeMap<String, DeploymentCheckpoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_roundtrips_via_millis() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper(
            #[serde(
                deserialize_with = "deserialize_duration",
                serialize_with = "serialize_duration"
            )]
            Duration,
        );

        let w = Wrapper(Duration::from_millis(1500));
        let json = serde_json::to_string(&w).expect("serialize");
        assert_eq!(json, "1500");
        let back: Wrapper = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.0, Duration::from_millis(1500));
    }

    #[test]
    fn duration_accepts_humantime_string() {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(deserialize_with = "deserialize_duration")] Duration);

        let w: Wrapper = serde_json::from_str("\"30s\"").expect("deserialize");
        assert_eq!(w.0, Duration::from_secs(30));
    }

    #[test]
    fn stage_status_terminal_classification() {
        assert!(!StageStatus::NotStarted.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
        for terminal in [
            StageStatus::Success,
            StageStatus::Failure,
            StageStatus::Cancelled,
            StageStatus::Skipped,
        ] {
            assert!(terminal.is_terminal());
        }
    }

    #[test]
    fn command_payload_tagged_union_roundtrip() {
        let cmd = CommandPayload::ApproveStage {
            deployment_id: DeploymentId("d1".to_string()),
            stage_index: 2,
        };
        let json = serde_json::to_string(&cmd).expect("serialize");
        assert!(json.contains("\"kind\":\"approve_stage\""));
        let back: CommandPayload = serde_json::from_str(&json).expect("deserialize");
        match back {
            CommandPayload::ApproveStage { stage_index, .. } => assert_eq!(stage_index, 2),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn deployment_status_is_terminal() {
        assert!(!DeploymentStatus::Running.is_terminal());
        assert!(DeploymentStatus::Success.is_terminal());
        assert!(DeploymentStatus::Failure.is_terminal());
        assert!(DeploymentStatus::Cancelled.is_terminal());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn duration_millis_roundtrip(ms in 0u64..1_000_000_000) {
                #[derive(Serialize, Deserialize)]
                struct Wrapper(
                    #[serde(
                        deserialize_with = "deserialize_duration",
                        serialize_with = "serialize_duration"
                    )]
                    Duration,
                );

                let w = Wrapper(Duration::from_millis(ms));
                let json = serde_json::to_string(&w).expect("serialize");
                let back: Wrapper = serde_json::from_str(&json).expect("deserialize");
                prop_assert_eq!(back.0, Duration::from_millis(ms));
            }
        }
    }
}
