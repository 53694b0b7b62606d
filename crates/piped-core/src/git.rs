//! Git Workspace: maintains a local mirror of each configured repository and
//! hands out isolated checkouts at requested commits.
//!
//! Git mutates working-tree state, so every mutation for a given repo is
//! serialised through a [`LockRegistry`] keyed by `repo_id` — the same shape
//! used for per-application mutual exclusion in [`crate::lock`], here applied
//! to repositories instead.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::lock::LockRegistry;
use crate::process::run_command_with_timeout;
use crate::types::{Commit, RepositoryId, WorkspaceHandle};

/// Subprocess git commands (clone/fetch/worktree) are bounded by this
/// timeout; a hung or unreachable remote fails the trigger tick instead of
/// blocking it forever.
const GIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Owns the on-disk layout under `<base_dir>/repos/<repo_id>/` (bare mirrors)
/// and `<base_dir>/workspaces/<repo_id>/<commit>/` (checkouts), plus the
/// per-repo lock registry that serialises mutations.
#[derive(Clone)]
pub struct GitWorkspace {
    base_dir: PathBuf,
    locks: LockRegistry<RepositoryId>,
}

impl GitWorkspace {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            locks: LockRegistry::new(),
        }
    }

    fn mirror_path(&self, repo_id: &RepositoryId) -> PathBuf {
        self.base_dir.join("repos").join(&repo_id.0)
    }

    fn workspace_path(&self, repo_id: &RepositoryId, commit: &Commit) -> PathBuf {
        self.base_dir
            .join("workspaces")
            .join(&repo_id.0)
            .join(&commit.0)
    }

    /// Ensure a local mirror of `remote`/`branch` exists and is current.
    /// Returns the resolved head commit of `branch`.
    pub fn clone_or_fetch(
        &self,
        repo_id: &RepositoryId,
        remote: &str,
        branch: &str,
    ) -> Result<Commit> {
        let _guard = self.locks.acquire(repo_id);
        let mirror = self.mirror_path(repo_id);

        if mirror.join("HEAD").exists() {
            run_git(&mirror, &["fetch", "--quiet", "origin", branch])
                .context("git fetch failed")?;
        } else {
            fs::create_dir_all(mirror.parent().expect("repos dir"))
                .context("failed to create repos directory")?;
            run_git(
                &self.base_dir,
                &[
                    "clone",
                    "--quiet",
                    "--mirror",
                    remote,
                    mirror.to_str().context("mirror path is not valid UTF-8")?,
                ],
            )
            .context("git clone --mirror failed")?;
        }

        let out = run_git(&mirror, &["rev-parse", &format!("refs/heads/{branch}")])
            .context("failed to resolve branch head")?;
        Ok(Commit(out.trim().to_string()))
    }

    /// Produce an isolated working tree at `commit`, reusing an existing one
    /// if `release` left it in place. Serialised per `repo_id`.
    pub fn checkout(&self, repo_id: &RepositoryId, commit: &Commit) -> Result<WorkspaceHandle> {
        let _guard = self.locks.acquire(repo_id);
        let mirror = self.mirror_path(repo_id);
        let workspace = self.workspace_path(repo_id, commit);

        if workspace.join(".git").exists() {
            return Ok(WorkspaceHandle {
                repo_id: repo_id.clone(),
                commit: commit.clone(),
                path: workspace,
            });
        }

        fs::create_dir_all(workspace.parent().expect("workspaces dir"))
            .context("failed to create workspaces directory")?;
        run_git(
            &self.base_dir,
            &[
                "worktree",
                "add",
                "--detach",
                workspace.to_str().context("workspace path is not valid UTF-8")?,
                &commit.0,
            ],
        )
        .with_context(|| format!("git worktree add for {mirror:?} at {commit} failed", commit = &commit.0))?;

        Ok(WorkspaceHandle {
            repo_id: repo_id.clone(),
            commit: commit.clone(),
            path: workspace,
        })
    }

    /// Return a workspace handle to the pool. Keeps the checkout on disk for
    /// reuse; eviction of stale checkouts is an LRU policy applied separately
    /// by the caller, not by this method.
    pub fn release(&self, _handle: WorkspaceHandle) {}

    /// Remove a workspace's checkout from disk, used by the LRU eviction
    /// policy when the base directory exceeds its configured size.
    pub fn evict(&self, repo_id: &RepositoryId, commit: &Commit) -> Result<()> {
        let _guard = self.locks.acquire(repo_id);
        let workspace = self.workspace_path(repo_id, commit);
        if !workspace.exists() {
            return Ok(());
        }
        run_git(
            &self.base_dir,
            &["worktree", "remove", "--force", workspace.to_str().context("utf8")?],
        )
        .context("git worktree remove failed")?;
        Ok(())
    }
}

fn run_git(cwd: &Path, args: &[&str]) -> Result<String> {
    let out = run_command_with_timeout(&git_program(), args, cwd, Some(GIT_COMMAND_TIMEOUT))
        .context("failed to execute git; is git installed?")?;

    if out.timed_out {
        bail!("git {} timed out after {:?}: {}", args.join(" "), out.duration, out.stderr.trim());
    }
    if out.exit_code != 0 {
        bail!("git {} failed: {}", args.join(" "), out.stderr.trim());
    }

    Ok(out.stdout)
}

fn git_program() -> String {
    env::var("PIPED_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;

    struct EnvGuard {
        key: String,
        old: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let old = env::var(key).ok();
            unsafe { env::set_var(key, value) };
            Self { key: key.to_string(), old }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.old {
                Some(v) => unsafe { env::set_var(&self.key, v) },
                None => unsafe { env::remove_var(&self.key) },
            }
        }
    }

    fn write_fake_git(bin_dir: &Path, script: &str) -> PathBuf {
        let path = bin_dir.join("git");
        fs::write(&path, script).expect("write fake git");
        let mut perms = fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    #[test]
    #[serial]
    fn clone_or_fetch_clones_when_mirror_absent() {
        let td = tempdir().expect("tempdir");
        let bin = td.path().join("bin");
        fs::create_dir_all(&bin).expect("mkdir");
        let fake_git = write_fake_git(
            &bin,
            "#!/usr/bin/env sh\ncase \"$1\" in\n  clone) mkdir -p \"$3\" && touch \"$3/HEAD\" ;;\n  rev-parse) echo deadbeef ;;\nesac\n",
        );
        let _bin_override = EnvGuard::set("PIPED_GIT_BIN", fake_git.to_str().expect("utf8"));

        let ws = GitWorkspace::new(td.path().join("state"));
        let repo_id = RepositoryId("repo-1".to_string());
        let commit = ws
            .clone_or_fetch(&repo_id, "https://example.invalid/repo.git", "main")
            .expect("clone_or_fetch");
        assert_eq!(commit.0, "deadbeef");
    }

    #[test]
    #[serial]
    fn clone_or_fetch_fetches_when_mirror_present() {
        let td = tempdir().expect("tempdir");
        let bin = td.path().join("bin");
        fs::create_dir_all(&bin).expect("mkdir");
        let fake_git = write_fake_git(
            &bin,
            "#!/usr/bin/env sh\ncase \"$1\" in\n  fetch) exit 0 ;;\n  rev-parse) echo cafebabe ;;\nesac\n",
        );
        let _bin_override = EnvGuard::set("PIPED_GIT_BIN", fake_git.to_str().expect("utf8"));

        let ws = GitWorkspace::new(td.path().join("state"));
        let repo_id = RepositoryId("repo-1".to_string());
        fs::create_dir_all(ws.mirror_path(&repo_id)).expect("mkdir mirror");
        fs::write(ws.mirror_path(&repo_id).join("HEAD"), "ref: refs/heads/main").expect("write HEAD");

        let commit = ws
            .clone_or_fetch(&repo_id, "https://example.invalid/repo.git", "main")
            .expect("clone_or_fetch");
        assert_eq!(commit.0, "cafebabe");
    }

    #[test]
    #[serial]
    fn clone_or_fetch_surfaces_git_failure() {
        let td = tempdir().expect("tempdir");
        let bin = td.path().join("bin");
        fs::create_dir_all(&bin).expect("mkdir");
        let fake_git = write_fake_git(
            &bin,
            "#!/usr/bin/env sh\necho 'fatal: mock failure' >&2\nexit 1\n",
        );
        let _bin_override = EnvGuard::set("PIPED_GIT_BIN", fake_git.to_str().expect("utf8"));

        let ws = GitWorkspace::new(td.path().join("state"));
        let repo_id = RepositoryId("repo-1".to_string());
        let err = ws
            .clone_or_fetch(&repo_id, "https://example.invalid/repo.git", "main")
            .expect_err("must fail");
        assert!(format!("{err:#}").contains("git clone --mirror failed"));
    }

    #[test]
    #[serial]
    fn checkout_reuses_existing_workspace() {
        let td = tempdir().expect("tempdir");
        let ws = GitWorkspace::new(td.path().join("state"));
        let repo_id = RepositoryId("repo-1".to_string());
        let commit = Commit("deadbeef".to_string());
        let workspace_dir = ws.workspace_path(&repo_id, &commit);
        fs::create_dir_all(workspace_dir.join(".git")).expect("mkdir");

        let handle = ws.checkout(&repo_id, &commit).expect("checkout");
        assert_eq!(handle.path, workspace_dir);
    }
}
