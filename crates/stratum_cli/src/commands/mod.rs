//! CLI command implementations.

pub mod backup;
pub mod drop_key;
pub mod info;
pub mod init;
pub mod rotate;

use crate::error::{CliError, CliResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratum_core::{
    DirectorySecretService, EncryptionConfig, EngineConfig, EngineServices, OpenOutcome,
    StorageEngine,
};
use tracing::debug;

/// Options shared by every command.
#[derive(Debug, Clone, Default)]
pub struct TargetOptions {
    /// Data directory; overrides the config file.
    pub path: Option<PathBuf>,
    /// JSON engine configuration.
    pub config_file: Option<PathBuf>,
    /// Master key file.
    pub key_file: Option<PathBuf>,
    /// Master key secret name.
    pub secret_name: Option<String>,
    /// Directory backing the secret service.
    pub secrets_dir: Option<PathBuf>,
}

/// A resolved data directory and how to open it.
#[derive(Debug, Clone)]
pub struct Target {
    /// Engine configuration.
    pub config: EngineConfig,
    secrets_dir: Option<PathBuf>,
}

impl Target {
    /// Merges the config file with command-line overrides.
    pub fn resolve(options: &TargetOptions, command: &'static str) -> CliResult<Self> {
        let mut config = match &options.config_file {
            Some(path) => read_config(path)?,
            None => match &options.path {
                Some(_) => EngineConfig::default(),
                None => return Err(CliError::MissingPath { command }),
            },
        };
        if let Some(path) = &options.path {
            config.path = path.clone();
        }

        let relaxed = config
            .encryption
            .as_ref()
            .is_some_and(|e| e.relaxed_permission_checks);
        if let Some(key_file) = &options.key_file {
            config.encryption = Some(
                EncryptionConfig::with_key_file(key_file).relaxed_permission_checks(relaxed),
            );
        }
        if let Some(name) = &options.secret_name {
            config.encryption = Some(
                EncryptionConfig::with_secret(name.clone()).relaxed_permission_checks(relaxed),
            );
        }
        if let Some(encryption) = config.encryption.as_mut() {
            // Only the rotate command rotates.
            encryption.rotate_master_key = false;
        }

        debug!(?config, "resolved engine configuration");
        Ok(Self {
            config,
            secrets_dir: options.secrets_dir.clone(),
        })
    }

    /// Data directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Fails unless a master key source is configured.
    pub fn require_encryption(&self, command: &'static str) -> CliResult<()> {
        if self.config.encryption.is_none() {
            return Err(CliError::EncryptionRequired { command });
        }
        Ok(())
    }

    /// Services for opening the engine.
    #[must_use]
    pub fn services(&self) -> EngineServices {
        match &self.secrets_dir {
            Some(dir) => EngineServices::new()
                .secret_service(Arc::new(DirectorySecretService::new(dir.clone()))),
            None => EngineServices::new(),
        }
    }

    /// Opens the data directory.
    pub fn open(&self) -> CliResult<StorageEngine> {
        match StorageEngine::open_durable(self.config.clone(), &self.services())? {
            OpenOutcome::Ready(engine) => Ok(*engine),
            OpenOutcome::RestartRequired(_) => Err(CliError::RotationSkipped),
        }
    }
}

fn read_config(path: &Path) -> CliResult<EngineConfig> {
    let contents = fs::read_to_string(path).map_err(|source| CliError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| CliError::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn path_is_required_without_config() {
        assert!(matches!(
            Target::resolve(&TargetOptions::default(), "info"),
            Err(CliError::MissingPath { command: "info" })
        ));
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempdir().unwrap();
        let config_file = dir.path().join("stratum.json");
        fs::write(
            &config_file,
            r#"{"path": "/srv/old", "encryption": {"key_file": "/keys/a", "rotate_master_key": true}}"#,
        )
        .unwrap();

        let target = Target::resolve(
            &TargetOptions {
                path: Some(dir.path().join("data")),
                config_file: Some(config_file),
                secret_name: Some("master".into()),
                ..TargetOptions::default()
            },
            "info",
        )
        .unwrap();

        assert_eq!(target.path(), dir.path().join("data"));
        let encryption = target.config.encryption.unwrap();
        assert_eq!(encryption.secret_name.as_deref(), Some("master"));
        assert!(encryption.key_file.is_none());
        assert!(!encryption.rotate_master_key);
    }

    #[test]
    fn bad_config_names_the_file() {
        let dir = tempdir().unwrap();
        let config_file = dir.path().join("stratum.json");
        fs::write(&config_file, "{not json").unwrap();
        let err = Target::resolve(
            &TargetOptions {
                config_file: Some(config_file.clone()),
                ..TargetOptions::default()
            },
            "info",
        )
        .unwrap_err();
        assert!(matches!(err, CliError::ConfigParse { path, .. } if path == config_file));
    }
}
