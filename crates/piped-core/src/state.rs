//! Schema-versioned, crash-durable persistence of the runtime checkpoint
//! (`piped.state.vN`): the set of in-flight deployments and their per-stage
//! progress, written after every stage transition so a restart can resume.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::types::PipedRuntimeState;

pub const CURRENT_STATE_VERSION: &str = "piped.state.v1";
pub const MINIMUM_SUPPORTED_VERSION: &str = "piped.state.v1";
pub const STATE_FILE: &str = "runtime-state.json";

pub fn state_path(state_dir: &Path) -> PathBuf {
    state_dir.join(STATE_FILE)
}

pub fn load_state(state_dir: &Path) -> Result<Option<PipedRuntimeState>> {
    let path = state_path(state_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;
    let st: PipedRuntimeState = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse state JSON {}", path.display()))?;
    validate_schema_version(&st.state_version)?;
    Ok(Some(st))
}

pub fn save_state(state_dir: &Path, state: &PipedRuntimeState) -> Result<()> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
    atomic_write_json(&state_path(state_dir), state)
}

pub fn clear_state(state_dir: &Path) -> Result<()> {
    let path = state_path(state_dir);
    if path.exists() {
        fs::remove_file(&path)
            .with_context(|| format!("failed to remove state file {}", path.display()))?;
    }
    Ok(())
}

/// Validate a `piped.state.vN` schema version string against the minimum
/// this build supports.
pub fn validate_schema_version(version: &str) -> Result<()> {
    let version_num = parse_schema_version(version)
        .with_context(|| format!("invalid schema version format: {}", version))?;
    let minimum_num = parse_schema_version(MINIMUM_SUPPORTED_VERSION)
        .expect("MINIMUM_SUPPORTED_VERSION is well-formed");

    if version_num < minimum_num {
        anyhow::bail!(
            "state schema version {} is too old; minimum supported is {}",
            version,
            MINIMUM_SUPPORTED_VERSION
        );
    }
    Ok(())
}

fn parse_schema_version(version: &str) -> Result<u32> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3 || parts[0] != "piped" || parts[1] != "state" || !parts[2].starts_with('v') {
        anyhow::bail!("invalid schema version format: {}", version);
    }
    parts[2][1..]
        .parse::<u32>()
        .with_context(|| format!("invalid version number in schema version: {}", version))
}

/// Best-effort fsync of the parent directory after a rename, so the
/// directory entry update is durable on crash. Errors are silently ignored:
/// not every platform supports opening a directory for sync.
pub(crate) fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!("failed to rename tmp file {} to {}", tmp.display(), path.display())
    })?;

    fsync_parent_dir(path);

    Ok(())
}
