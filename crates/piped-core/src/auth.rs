//! Resolution of the piped↔API signing key.
//!
//! Resolution order mirrors the way cargo resolves registry tokens: an
//! explicit override wins, then an environment variable, then the path
//! named in config.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const PIPED_KEY_ENV: &str = "PIPED_KEY";

/// Resolve the piped signing key.
///
/// Resolution order:
/// 1. `cli_override` (the `--piped-key-file` flag)
/// 2. `PIPED_KEY` environment variable (the raw key value)
/// 3. `config_path` (the `pipedKeyFile` config field)
pub fn resolve_piped_key(
    cli_override: Option<&Path>,
    config_path: Option<&Path>,
) -> Result<String> {
    if let Some(path) = cli_override {
        return read_key_file(path);
    }

    if let Ok(v) = env::var(PIPED_KEY_ENV) {
        let v = v.trim().to_string();
        if !v.is_empty() {
            return Ok(v);
        }
    }

    if let Some(path) = config_path {
        return read_key_file(path);
    }

    anyhow::bail!(
        "no piped key configured: set --piped-key-file, {}, or pipedKeyFile in config",
        PIPED_KEY_ENV
    )
}

fn read_key_file(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read piped key file at {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("piped key file at {} is empty", path.display());
    }
    Ok(key)
}

/// Resolve the project id a piped is registered under, from CLI/env/config in
/// the same precedence order, erroring only if none is configured.
pub fn resolve_project_id(cli_override: Option<&str>, config_value: Option<&str>) -> Result<String> {
    if let Some(v) = cli_override {
        return Ok(v.to_string());
    }
    if let Ok(v) = env::var("PIPED_PROJECT_ID") {
        let v = v.trim().to_string();
        if !v.is_empty() {
            return Ok(v);
        }
    }
    config_value
        .map(|s| s.to_string())
        .context("no project id configured: set PIPED_PROJECT_ID or projectID in config")
}

pub(crate) fn default_key_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join("piped.key")
}
