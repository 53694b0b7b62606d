//! Configuration file support (`piped.toml`).
//!
//! This module loads the piped's own configuration: control-plane
//! connection details, the repositories it watches, and the provider/
//! notification integrations available to stage executors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::types::{RepositoryConfig, deserialize_duration, serialize_duration};

/// `git` section: identity used for commits this piped makes itself (e.g.
/// writing back a rendered manifest) and the key used to authenticate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub ssh_key_file: Option<PathBuf>,
    #[serde(default)]
    pub ssh_config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartRepositoryConfig {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudProviderConfig {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisProviderConfig {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageProviderConfig {
    pub name: String,
    pub kind: String,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_pull_interval"
    )]
    pub pull_interval: Duration,
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_pull_interval() -> Duration {
    Duration::from_secs(300)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRoute {
    pub name: String,
    #[serde(default)]
    pub events: Vec<String>,
    pub receiver: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationReceiver {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub routes: Vec<NotificationRoute>,
    #[serde(default)]
    pub receivers: Vec<NotificationReceiver>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SealedSecretManagementConfig {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Configuration loaded from `piped.toml`.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedConfig {
    #[serde(rename = "projectID")]
    pub project_id: String,
    #[serde(rename = "pipedID")]
    pub piped_id: String,

    #[serde(default)]
    pub piped_key_file: Option<PathBuf>,

    pub api_address: String,

    #[serde(default)]
    pub web_address: Option<String>,

    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_sync_interval"
    )]
    pub sync_interval: Duration,

    #[serde(default)]
    pub git: GitConfig,

    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,

    #[serde(default)]
    pub chart_repositories: Vec<ChartRepositoryConfig>,

    #[serde(default)]
    pub cloud_providers: Vec<CloudProviderConfig>,

    #[serde(default)]
    pub analysis_providers: Vec<AnalysisProviderConfig>,

    #[serde(default)]
    pub image_providers: Vec<ImageProviderConfig>,

    #[serde(default)]
    pub notifications: NotificationsConfig,

    #[serde(default)]
    pub sealed_secret_management: SealedSecretManagementConfig,

    /// Base directory for `repos/`, `workspaces/`, `tools/`, and the runtime
    /// state checkpoint. Overridable by `--state-dir`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(60)
}

/// CLI overrides merged on top of the parsed file. `Option` fields mean "the
/// user did not pass this flag."
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub piped_key_file: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

/// Fully resolved runtime options: config file merged with CLI overrides.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub piped_key_file: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl PipedConfig {
    /// Load and parse `path`. Any IO or TOML error is a fatal configuration
    /// error at startup (§7).
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: PipedConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Structural validation beyond what serde enforces: non-empty
    /// identifiers, unique repository ids, and well-formed durations.
    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            bail!("projectID must not be empty");
        }
        if self.piped_id.trim().is_empty() {
            bail!("pipedID must not be empty");
        }
        if self.api_address.trim().is_empty() {
            bail!("apiAddress must not be empty");
        }
        if self.sync_interval.is_zero() {
            bail!("syncInterval must be greater than 0");
        }

        let mut seen = std::collections::HashSet::new();
        for repo in &self.repositories {
            if !seen.insert(repo.id.0.clone()) {
                bail!("duplicate repository id in config: {}", repo.id.0);
            }
            if repo.remote.trim().is_empty() {
                bail!("repositories[{}].remote must not be empty", repo.id.0);
            }
        }

        for provider in &self.image_providers {
            if provider.pull_interval.is_zero() {
                bail!("imageProviders[{}].pullInterval must be greater than 0", provider.name);
            }
        }

        Ok(())
    }

    /// Merge CLI overrides on top of this config's values.
    pub fn build_runtime_options(&self, cli: CliOverrides) -> RuntimeOptions {
        RuntimeOptions {
            piped_key_file: cli.piped_key_file.or_else(|| self.piped_key_file.clone()),
            state_dir: cli
                .state_dir
                .or_else(|| self.state_dir.clone())
                .unwrap_or_else(|| PathBuf::from(".piped")),
            log_level: cli.log_level.unwrap_or_else(|| "info".to_string()),
            log_format: match cli.log_format.as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        }
    }

    pub fn default_toml_template() -> String {
        r#"# Piped configuration file

projectID = "my-project"
pipedID = "piped-1"
pipedKeyFile = "/etc/piped/key"
apiAddress = "control-plane.example.com:443"
webAddress = "https://control-plane.example.com"
syncInterval = "1m"

[git]
user = "piped"
email = "piped@example.com"

[[repositories]]
id = "repo-1"
remote = "git@github.com:example/repo.git"
branch = "main"

[notifications]
routes = []
receivers = []

[sealedSecretManagement]
kind = "none"
"#
        .to_string()
    }
}
