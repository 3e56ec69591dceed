//! Error types for Stratum core.

use crate::types::Timestamp;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Stratum core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(#[from] stratum_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A pin was requested below the current oldest timestamp.
    #[error("snapshot too old. Requested timestamp: {requested} Current oldest timestamp: {oldest}")]
    SnapshotTooOld {
        /// The requested timestamp.
        requested: Timestamp,
        /// The oldest timestamp at the time of the request.
        oldest: Timestamp,
    },

    /// No stable timestamp is available to roll back to.
    #[error("No stable timestamp available to recover to. Initial data timestamp: {initial_data}, Stable timestamp: {stable}")]
    UnrecoverableRollback {
        /// The stable timestamp at the time of the request.
        stable: Timestamp,
        /// The initial data timestamp.
        initial_data: Timestamp,
    },

    /// The engine failed to roll back to the stable timestamp.
    #[error("Error rolling back to stable. Err: {source}")]
    RollbackFailed {
        /// The stable timestamp being rolled back to.
        stable: Timestamp,
        /// The engine error.
        #[source]
        source: stratum_storage::StorageError,
    },

    /// A backup cursor is already open.
    #[error("a backup cursor is already open")]
    BackupInProgress,

    /// No backup cursor is open.
    #[error("no backup cursor is open")]
    BackupNotOpen,

    /// A path listed by a backup cursor does not exist.
    #[error("invalid backup path: {path}")]
    InvalidPath {
        /// The missing path.
        path: PathBuf,
    },

    /// The operation was interrupted.
    #[error("operation interrupted")]
    Interrupted,

    /// The data engine could not be opened.
    #[error("failed to open storage engine: {message}")]
    EngineOpen {
        /// Description of the failure.
        message: String,
    },

    /// A key file could not be read.
    #[error("key file {path}: {message}")]
    KeyFile {
        /// Path of the key file.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// A key file is readable or writable by other users.
    #[error("permissions on {path} are too open")]
    KeyFilePermissions {
        /// Path of the key file.
        path: PathBuf,
    },

    /// A master key could not be decoded.
    #[error("invalid master key: {message}")]
    InvalidMasterKey {
        /// Description of the failure.
        message: String,
    },

    /// The secret service holds no master key for an existing key store.
    #[error("Cannot start. Master encryption key is absent in the secret service: {secret}")]
    MasterKeyAbsent {
        /// Name of the secret.
        secret: String,
    },

    /// The secret service rejected a request.
    #[error("secret service error: {message}")]
    SecretService {
        /// Description of the failure.
        message: String,
    },

    /// A key store is already registered for the role.
    #[error("a {role} key store is already open")]
    KeyStoreRoleTaken {
        /// The contested role.
        role: &'static str,
    },

    /// A previous rotation left its working directory behind.
    #[error("cannot rotate master key because rotation directory {path} already exists")]
    RotationDirectoryExists {
        /// The leftover directory.
        path: PathBuf,
    },

    /// Invalid argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the argument problem.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Encryption failed.
    #[error("encryption failed: {message}")]
    EncryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Decryption failed.
    #[error("decryption failed: {message}")]
    DecryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Invalid key size.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },
}

impl CoreError {
    /// Creates an engine open error.
    pub fn engine_open(message: impl Into<String>) -> Self {
        Self::EngineOpen {
            message: message.into(),
        }
    }

    /// Creates a key file error.
    pub fn key_file(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::KeyFile {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid master key error.
    pub fn invalid_master_key(message: impl Into<String>) -> Self {
        Self::InvalidMasterKey {
            message: message.into(),
        }
    }

    /// Creates a secret service error.
    pub fn secret_service(message: impl Into<String>) -> Self {
        Self::SecretService {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an encryption failed error.
    pub fn encryption_failed(message: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            message: message.into(),
        }
    }

    /// Creates a decryption failed error.
    pub fn decryption_failed(message: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid key size error.
    pub fn invalid_key_size(actual: usize, expected: usize) -> Self {
        Self::InvalidKeySize { expected, actual }
    }

    /// Returns true if the error is a storage write conflict.
    #[must_use]
    pub fn is_write_conflict(&self) -> bool {
        matches!(
            self,
            Self::Storage(stratum_storage::StorageError::WriteConflict)
        )
    }

    /// Returns true if the error reports an engine shutdown.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            Self::Storage(
                stratum_storage::StorageError::ShuttingDown | stratum_storage::StorageError::Closed
            )
        )
    }
}
