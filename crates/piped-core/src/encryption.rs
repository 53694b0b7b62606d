//! Sealed-secret unsealing: builds a [`piped_encrypt::SealedSecretCipher`]
//! from the `sealedSecretManagement` config block, so executors can unseal
//! secrets embedded in rendered manifests without reaching into
//! `piped-encrypt`'s lower-level primitives directly. Passphrase resolution
//! (explicit value, then a named environment variable) mirrors the way
//! `auth::resolve_piped_key` layers its own sources.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use piped_encrypt::{EncryptionConfig, SealedSecretCipher};
use serde::Deserialize;

use crate::config::SealedSecretManagementConfig;

const DEFAULT_PASSPHRASE_ENV: &str = "PIPED_SEALED_SECRET_KEY";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalCipherConfig {
    #[serde(default)]
    env_var: Option<String>,
    #[serde(default)]
    passphrase_file: Option<PathBuf>,
}

/// Build the cipher a piped uses to unseal secrets, from the
/// `sealedSecretManagement` config block. An absent or empty `kind` disables
/// unsealing entirely — [`SealedSecretCipher::is_enabled`] will be `false`
/// and `read_file`/`decrypt` pass data through unchanged.
pub fn build_cipher(config: &SealedSecretManagementConfig) -> Result<SealedSecretCipher> {
    let Some(kind) = config.kind.as_deref().filter(|k| !k.is_empty()) else {
        return SealedSecretCipher::new(EncryptionConfig::default());
    };

    match kind {
        "local" => {
            let local: LocalCipherConfig = if config.config.is_null() {
                LocalCipherConfig::default()
            } else {
                serde_json::from_value(config.config.clone())
                    .context("invalid sealedSecretManagement.config for kind \"local\"")?
            };

            let passphrase = match &local.passphrase_file {
                Some(path) => Some(
                    fs::read_to_string(path)
                        .with_context(|| format!("failed to read passphrase file {}", path.display()))?
                        .trim()
                        .to_string(),
                ),
                None => None,
            };
            let env_var = local.env_var.unwrap_or_else(|| DEFAULT_PASSPHRASE_ENV.to_string());

            SealedSecretCipher::new(EncryptionConfig { enabled: true, passphrase, env_var: Some(env_var) })
        }
        other => bail!("unsupported sealedSecretManagement.kind: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn absent_kind_builds_a_disabled_cipher() {
        let config = SealedSecretManagementConfig { kind: None, config: serde_json::Value::Null };
        let cipher = build_cipher(&config).expect("build cipher");
        assert!(!cipher.is_enabled());
    }

    #[test]
    #[serial]
    fn local_kind_with_env_var_enables_cipher() {
        unsafe { std::env::set_var("PIPED_SEALED_SECRET_KEY", "test-passphrase") };
        let config = SealedSecretManagementConfig { kind: Some("local".to_string()), config: serde_json::Value::Null };
        let cipher = build_cipher(&config).expect("build cipher");
        assert!(cipher.is_enabled());
        unsafe { std::env::remove_var("PIPED_SEALED_SECRET_KEY") };
    }

    #[test]
    fn local_kind_with_passphrase_file_enables_cipher() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("secret.key");
        fs::write(&path, "from-file\n").expect("write");
        let config = SealedSecretManagementConfig {
            kind: Some("local".to_string()),
            config: serde_json::json!({ "passphraseFile": path }),
        };
        let cipher = build_cipher(&config).expect("build cipher");
        assert!(cipher.is_enabled());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let config = SealedSecretManagementConfig { kind: Some("gcp-kms".to_string()), config: serde_json::Value::Null };
        let err = build_cipher(&config).expect_err("must fail");
        assert!(format!("{err:#}").contains("unsupported sealedSecretManagement.kind"));
    }

    #[test]
    #[serial]
    fn round_trips_through_the_built_cipher() {
        let config = SealedSecretManagementConfig {
            kind: Some("local".to_string()),
            config: serde_json::json!({ "envVar": "PIPED_TEST_PASSPHRASE_RT" }),
        };
        unsafe { std::env::set_var("PIPED_TEST_PASSPHRASE_RT", "roundtrip-pass") };
        let cipher = build_cipher(&config).expect("build cipher");
        let sealed = cipher.encrypt(b"super-secret").expect("encrypt");
        let opened = cipher.decrypt(&sealed).expect("decrypt");
        assert_eq!(opened, b"super-secret");
        unsafe { std::env::remove_var("PIPED_TEST_PASSPHRASE_RT") };
    }
}
