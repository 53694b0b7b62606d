//! Turns a declared pipeline (`ApplicationConfig.pipeline`, a list of
//! [`StageSpec`] referencing each other by index via `requires`) into an
//! ordered, deterministic execution plan for one deployment: a topologically
//! sorted stage list, a stable plan id, and a grouping into waves that can
//! run in parallel up to a concurrency cap.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{Result, bail};
use sha2::{Digest, Sha256};

use crate::types::{Commit, DeploymentId, Stage, StageSpec, StageStatus};

/// A fully resolved, ordered plan for one deployment.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub plan_id: String,
    pub stages: Vec<Stage>,
}

/// Validate `pipeline`, topologically sort it by `requires`, and assign a
/// stable plan id. Each returned [`Stage`] starts `NotStarted`.
pub fn build_plan(
    deployment_id: &DeploymentId,
    target_commit: &Commit,
    pipeline: &[StageSpec],
) -> Result<DeploymentPlan> {
    validate_requires(pipeline)?;
    let order = topo_sort(pipeline)?;

    let stages: Vec<Stage> = order
        .into_iter()
        .map(|index| {
            let spec = &pipeline[index];
            Stage {
                index,
                kind: spec.kind,
                requires: spec.requires.clone(),
                config: spec.config.clone(),
                status: StageStatus::NotStarted,
                retry_count: 0,
                status_reason: None,
                started_at: None,
                completed_at: None,
            }
        })
        .collect();

    let plan_id = compute_plan_id(deployment_id, target_commit, &stages);

    Ok(DeploymentPlan { plan_id, stages })
}

fn validate_requires(pipeline: &[StageSpec]) -> Result<()> {
    for (index, spec) in pipeline.iter().enumerate() {
        for &dep in &spec.requires {
            if dep >= pipeline.len() {
                bail!("stage {index} requires out-of-range stage index {dep}");
            }
            if dep == index {
                bail!("stage {index} requires itself");
            }
        }
    }
    Ok(())
}

/// Deterministic Kahn's-algorithm topo sort: among stages ready to run at
/// any point, the lowest declared index goes first, so two runs of the same
/// pipeline always produce the same order.
fn topo_sort(pipeline: &[StageSpec]) -> Result<Vec<usize>> {
    let n = pipeline.len();
    let mut indegree: Vec<usize> = pipeline.iter().map(|s| s.requires.len()).collect();
    let mut dependents: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for (index, spec) in pipeline.iter().enumerate() {
        for &dep in &spec.requires {
            dependents.entry(dep).or_default().insert(index);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut out = Vec::with_capacity(n);

    while let Some(&index) = ready.iter().next() {
        ready.remove(&index);
        out.push(index);

        if let Some(deps) = dependents.get(&index) {
            for &dependent in deps {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if out.len() != n {
        bail!("dependency cycle detected in pipeline's requires graph");
    }

    Ok(out)
}

fn compute_plan_id(deployment_id: &DeploymentId, target_commit: &Commit, stages: &[Stage]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(deployment_id.0.as_bytes());
    hasher.update(b"\n");
    hasher.update(target_commit.0.as_bytes());
    hasher.update(b"\n");
    for stage in stages {
        hasher.update(stage.index.to_le_bytes());
        hasher.update(format!("{:?}", stage.kind).as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Group a plan's stages into waves: level 0 has no unfinished dependency,
/// level N depends only on stages in levels < N. Stages within a wave have
/// no ordering constraint between them and can run up to the controller's
/// configured concurrency cap.
pub fn group_by_levels(stages: &[Stage]) -> Vec<Vec<usize>> {
    if stages.is_empty() {
        return Vec::new();
    }

    let mut level_of: BTreeMap<usize, usize> = BTreeMap::new();
    let mut levels: Vec<Vec<usize>> = Vec::new();

    for stage in stages {
        let max_dep_level = stage
            .requires
            .iter()
            .filter_map(|dep| level_of.get(dep).copied())
            .max();
        let level = max_dep_level.map(|l| l + 1).unwrap_or(0);
        level_of.insert(stage.index, level);

        while levels.len() <= level {
            levels.push(Vec::new());
        }
        levels[level].push(stage.index);
    }

    levels
}
