//! Tool Registry: resolves a named deployment tool (`kubectl`, a cloud
//! provider CLI, a chart renderer) at a pinned version to a local binary
//! path, downloading and verifying it on first use.
//!
//! Concurrent callers requesting the same `(name, version)` are
//! single-flighted through [`LockRegistry`]: at most one installation
//! happens, and every caller observes the same outcome. A failed install is
//! not cached — the next `resolve` call retries from scratch.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::lock::LockRegistry;

#[derive(Debug, Error)]
pub enum ToolRegistryError {
    #[error("tool {name} is not supported on this host")]
    NotSupported { name: String },
    #[error("failed to install {name}@{version}: {cause}")]
    InstallFailed { name: String, version: String, cause: String },
    #[error("checksum mismatch for {name}@{version}: expected {expected}, got {actual}")]
    ChecksumMismatch { name: String, version: String, expected: String, actual: String },
}

/// What's needed to install one tool version, provided by the caller
/// (the executor that needs it) rather than discovered by this registry.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub version: String,
    pub download_url: String,
    pub binary_name: String,
    pub expected_sha256: Option<String>,
}

#[derive(Clone)]
pub struct ToolRegistry {
    base_dir: PathBuf,
    locks: LockRegistry<(String, String)>,
    http: reqwest::blocking::Client,
}

impl ToolRegistry {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            locks: LockRegistry::new(),
            http: reqwest::blocking::Client::new(),
        }
    }

    fn install_dir(&self, name: &str, version: &str) -> PathBuf {
        self.base_dir.join("tools").join(name).join(version)
    }

    /// Resolve `name`@`version` to a local binary path, installing it if
    /// this is the first call for this pair.
    pub fn resolve(&self, spec: &ToolSpec) -> Result<PathBuf, ToolRegistryError> {
        let target = self.install_dir(&spec.name, &spec.version).join(&spec.binary_name);
        if target.exists() {
            return Ok(target);
        }

        let key = (spec.name.clone(), spec.version.clone());
        let _guard = self.locks.acquire(&key);

        // Re-check: another caller may have finished installing while we
        // waited for the lock.
        if target.exists() {
            return Ok(target);
        }

        self.install(spec, &target)?;
        Ok(target)
    }

    fn install(&self, spec: &ToolSpec, target: &Path) -> Result<(), ToolRegistryError> {
        let dir = target.parent().expect("install target always has a parent");
        fs::create_dir_all(dir).map_err(|e| ToolRegistryError::InstallFailed {
            name: spec.name.clone(),
            version: spec.version.clone(),
            cause: format!("failed to create install directory: {e}"),
        })?;

        let bytes = self
            .http
            .get(&spec.download_url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.bytes())
            .map_err(|e| ToolRegistryError::InstallFailed {
                name: spec.name.clone(),
                version: spec.version.clone(),
                cause: format!("download failed: {e}"),
            })?;

        if let Some(expected) = &spec.expected_sha256 {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            let actual = hex::encode(hasher.finalize());
            if &actual != expected {
                return Err(ToolRegistryError::ChecksumMismatch {
                    name: spec.name.clone(),
                    version: spec.version.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let tmp = dir.join(format!(".{}.download", spec.binary_name));
        {
            let mut f = fs::File::create(&tmp).map_err(|e| ToolRegistryError::InstallFailed {
                name: spec.name.clone(),
                version: spec.version.clone(),
                cause: format!("failed to create tmp file: {e}"),
            })?;
            f.write_all(&bytes).map_err(|e| ToolRegistryError::InstallFailed {
                name: spec.name.clone(),
                version: spec.version.clone(),
                cause: format!("failed to write tmp file: {e}"),
            })?;
            f.sync_all().ok();
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&tmp)
                .map_err(|e| ToolRegistryError::InstallFailed {
                    name: spec.name.clone(),
                    version: spec.version.clone(),
                    cause: format!("failed to stat tmp file: {e}"),
                })?
                .permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&tmp, perms).ok();
        }

        fs::rename(&tmp, target).map_err(|e| ToolRegistryError::InstallFailed {
            name: spec.name.clone(),
            version: spec.version.clone(),
            cause: format!("failed to publish downloaded binary: {e}"),
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tiny_http::{Response, Server};

    fn spawn_server(body: &'static [u8]) -> (String, std::thread::JoinHandle<()>) {
        let server = Server::http("127.0.0.1:0").expect("bind");
        let addr = server.server_addr().to_string();
        let handle = std::thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let _ = request.respond(Response::from_data(body));
            }
        });
        (format!("http://{addr}/tool.bin"), handle)
    }

    #[test]
    fn resolve_downloads_and_publishes_binary() {
        let (url, handle) = spawn_server(b"#!/bin/sh\necho hi\n");
        let td = tempdir().expect("tempdir");
        let registry = ToolRegistry::new(td.path());

        let spec = ToolSpec {
            name: "kubectl".to_string(),
            version: "1.30.0".to_string(),
            download_url: url,
            binary_name: "kubectl".to_string(),
            expected_sha256: None,
        };

        let path = registry.resolve(&spec).expect("resolve");
        assert!(path.exists());
        assert_eq!(fs::read(&path).expect("read"), b"#!/bin/sh\necho hi\n");
        handle.join().expect("join");
    }

    #[test]
    fn resolve_is_idempotent_once_installed() {
        let (url, handle) = spawn_server(b"binary-one");
        let td = tempdir().expect("tempdir");
        let registry = ToolRegistry::new(td.path());
        let spec = ToolSpec {
            name: "kubectl".to_string(),
            version: "1.30.0".to_string(),
            download_url: url,
            binary_name: "kubectl".to_string(),
            expected_sha256: None,
        };

        let first = registry.resolve(&spec).expect("resolve");
        handle.join().expect("join");

        // Second resolve must short-circuit without contacting the (now dead) server.
        let second = registry.resolve(&spec).expect("resolve");
        assert_eq!(first, second);
    }

    #[test]
    fn resolve_rejects_checksum_mismatch() {
        let (url, handle) = spawn_server(b"unexpected-content");
        let td = tempdir().expect("tempdir");
        let registry = ToolRegistry::new(td.path());
        let spec = ToolSpec {
            name: "kubectl".to_string(),
            version: "1.30.0".to_string(),
            download_url: url,
            binary_name: "kubectl".to_string(),
            expected_sha256: Some("0".repeat(64)),
        };

        let err = registry.resolve(&spec).expect_err("must fail");
        handle.join().expect("join");
        assert!(matches!(err, ToolRegistryError::ChecksumMismatch { .. }));
    }

    #[test]
    fn resolve_accepts_matching_checksum() {
        let body: &'static [u8] = b"verified-binary";
        let mut hasher = Sha256::new();
        hasher.update(body);
        let expected = hex::encode(hasher.finalize());

        let (url, handle) = spawn_server(body);
        let td = tempdir().expect("tempdir");
        let registry = ToolRegistry::new(td.path());
        let spec = ToolSpec {
            name: "helm".to_string(),
            version: "3.14.0".to_string(),
            download_url: url,
            binary_name: "helm".to_string(),
            expected_sha256: Some(expected),
        };

        let path = registry.resolve(&spec).expect("resolve");
        handle.join().expect("join");
        assert!(path.exists());
    }
}
