//! CLI error type.

use std::io;
use std::path::PathBuf;
use stratum_core::CoreError;
use thiserror::Error;

/// Result alias for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Errors reported by `stratum` commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// No data directory was given.
    #[error("database path required for {command}")]
    MissingPath {
        /// Command that needed it.
        command: &'static str,
    },

    /// The configuration file could not be read.
    #[error("cannot read config file {path}: {source}")]
    ConfigRead {
        /// Config file.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The configuration file is not valid JSON for an engine config.
    #[error("invalid config file {path}: {source}")]
    ConfigParse {
        /// Config file.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// The command needs encryption to be configured.
    #[error("{command} requires --key-file, --secret-name or an encryption section in the config")]
    EncryptionRequired {
        /// Command that needed it.
        command: &'static str,
    },

    /// Rotation did not run.
    #[error("master key rotation did not run")]
    RotationSkipped,

    /// Engine error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Output error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
