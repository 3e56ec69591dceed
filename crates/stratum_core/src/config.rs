//! Engine and encryption configuration.

use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// Default history retention window in seconds.
pub const DEFAULT_HISTORY_WINDOW_SECS: u64 = 300;

/// Configuration for opening a storage engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Data directory.
    pub path: PathBuf,

    /// How many seconds of history to keep behind the stable timestamp.
    pub history_window_secs: u64,

    /// Whether majority reads are served, which requires the engine to keep
    /// history back to the stable timestamp.
    pub majority_read_concern: bool,

    /// Whether the engine keeps nothing on disk.
    pub ephemeral: bool,

    /// Whether the engine was opened read-only.
    pub read_only: bool,

    /// Whether damaged tables may be salvaged or rebuilt.
    pub repair: bool,

    /// At-rest encryption settings; `None` disables the key store.
    pub encryption: Option<EncryptionConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            history_window_secs: DEFAULT_HISTORY_WINDOW_SECS,
            majority_read_concern: true,
            ephemeral: false,
            read_only: false,
            repair: false,
            encryption: None,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration for `path` with default values.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Sets the history window.
    #[must_use]
    pub const fn history_window_secs(mut self, secs: u64) -> Self {
        self.history_window_secs = secs;
        self
    }

    /// Sets majority read concern.
    #[must_use]
    pub const fn majority_read_concern(mut self, value: bool) -> Self {
        self.majority_read_concern = value;
        self
    }

    /// Sets ephemeral mode.
    #[must_use]
    pub const fn ephemeral(mut self, value: bool) -> Self {
        self.ephemeral = value;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets repair mode.
    #[must_use]
    pub const fn repair(mut self, value: bool) -> Self {
        self.repair = value;
        self
    }

    /// Enables the encryption key store.
    #[must_use]
    pub fn encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Whether history is retained for majority reads and rollback.
    #[must_use]
    pub const fn keeps_data_history(&self) -> bool {
        self.majority_read_concern
    }
}

/// Master key and key store settings.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// File holding the base64 master key.
    pub key_file: Option<PathBuf>,

    /// Secret name of the master key in the secret service.
    pub secret_name: Option<String>,

    /// Secret service token.
    pub secret_token: Option<String>,

    /// File holding the secret service token.
    pub secret_token_file: Option<PathBuf>,

    /// Accept group read on root-owned key files.
    pub relaxed_permission_checks: bool,

    /// Rotate the master key during startup.
    pub rotate_master_key: bool,
}

impl EncryptionConfig {
    /// Uses a local key file.
    #[must_use]
    pub fn with_key_file(path: impl Into<PathBuf>) -> Self {
        Self {
            key_file: Some(path.into()),
            ..Self::default()
        }
    }

    /// Uses the secret service under `secret_name`.
    #[must_use]
    pub fn with_secret(secret_name: impl Into<String>) -> Self {
        Self {
            secret_name: Some(secret_name.into()),
            ..Self::default()
        }
    }

    /// Sets the secret service token.
    #[must_use]
    pub fn secret_token(mut self, token: impl Into<String>) -> Self {
        self.secret_token = Some(token.into());
        self
    }

    /// Sets the secret service token file.
    #[must_use]
    pub fn secret_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.secret_token_file = Some(path.into());
        self
    }

    /// Sets relaxed permission checks.
    #[must_use]
    pub const fn relaxed_permission_checks(mut self, value: bool) -> Self {
        self.relaxed_permission_checks = value;
        self
    }

    /// Requests a master key rotation.
    #[must_use]
    pub const fn rotate_master_key(mut self, value: bool) -> Self {
        self.rotate_master_key = value;
        self
    }
}

impl fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("key_file", &self.key_file)
            .field("secret_name", &self.secret_name)
            .field("secret_token", &self.secret_token.as_ref().map(|_| "[REDACTED]"))
            .field("secret_token_file", &self.secret_token_file)
            .field("relaxed_permission_checks", &self.relaxed_permission_checks)
            .field("rotate_master_key", &self.rotate_master_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.history_window_secs, 300);
        assert!(config.majority_read_concern);
        assert!(!config.ephemeral);
        assert!(config.encryption.is_none());
    }

    #[test]
    fn builder_pattern() {
        let config = EngineConfig::new("/data")
            .history_window_secs(60)
            .repair(true)
            .encryption(EncryptionConfig::with_key_file("/keys/master").rotate_master_key(true));

        assert_eq!(config.history_window_secs, 60);
        assert!(config.repair);
        assert!(config.encryption.unwrap().rotate_master_key);
    }

    #[test]
    fn deserializes_partial_json() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"path": "/srv/db", "ephemeral": true, "encryption": {"secret_name": "kv/master"}}"#,
        )
        .unwrap();
        assert!(config.ephemeral);
        assert_eq!(config.history_window_secs, 300);
        assert_eq!(
            config.encryption.unwrap().secret_name.as_deref(),
            Some("kv/master")
        );
    }

    #[test]
    fn debug_redacts_token() {
        let config = EncryptionConfig::with_secret("kv/master").secret_token("s3cr3t");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cr3t"));
    }
}
