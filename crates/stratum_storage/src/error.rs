//! Error types for storage engine operations.
//!
//! Engines report failures as raw integer return codes. [`StorageError::from_code`]
//! is the only place those codes are interpreted; everything above this crate
//! matches on typed variants.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Raw engine return codes.
pub mod codes {
    /// Success.
    pub const OK: i32 = 0;
    /// No such file or table.
    pub const ENOENT: i32 = 2;
    /// Resource busy (open cursors, running checkpoint).
    pub const EBUSY: i32 = 16;
    /// Invalid argument or configuration.
    pub const EINVAL: i32 = 22;
    /// Operation conflicted with a concurrent update and was rolled back.
    pub const WT_ROLLBACK: i32 = -31800;
    /// Attempt to insert an existing key.
    pub const WT_DUPLICATE_KEY: i32 = -31801;
    /// Non-specific engine failure.
    pub const WT_ERROR: i32 = -31802;
    /// Item not found.
    pub const WT_NOTFOUND: i32 = -31803;
    /// Engine panic; the handle must be closed.
    pub const WT_PANIC: i32 = -31804;
    /// Recovery must be run before the handle can be used.
    pub const WT_RUN_RECOVERY: i32 = -31806;
    /// Metadata is damaged and salvage is required.
    pub const WT_TRY_SALVAGE: i32 = -31809;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested key or timestamp does not exist.
    #[error("item not found")]
    NotFound,

    /// The requested table or file does not exist.
    #[error("no such table or file")]
    NoEntry,

    /// The object is in use and the operation should be retried later.
    #[error("resource busy")]
    Busy,

    /// The operation conflicted with a concurrent writer.
    #[error("write conflict")]
    WriteConflict,

    /// The key already exists.
    #[error("duplicate key")]
    DuplicateKey,

    /// An argument or configuration string was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine metadata is damaged and needs salvage.
    #[error("engine metadata damaged; salvage required")]
    TrySalvage,

    /// Recovery must run before the engine can be used.
    #[error("engine requires recovery")]
    RunRecovery,

    /// The engine panicked and cannot continue.
    #[error("engine panic")]
    Panic,

    /// The engine is shutting down.
    #[error("engine shutdown in progress")]
    ShuttingDown,

    /// Stored data is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The engine or session is closed.
    #[error("storage is closed")]
    Closed,

    /// Another process holds the engine directory lock.
    #[error("engine directory locked: another process has exclusive access")]
    Locked,

    /// Encryption or decryption failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Any other engine return code.
    #[error("engine error {code}: {message}")]
    Engine {
        /// Raw return code.
        code: i32,
        /// Description of the failure.
        message: String,
    },
}

impl StorageError {
    /// Translates a non-zero engine return code.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            codes::ENOENT => Self::NoEntry,
            codes::EBUSY => Self::Busy,
            codes::EINVAL => Self::InvalidArgument(String::from("rejected by engine")),
            codes::WT_ROLLBACK => Self::WriteConflict,
            codes::WT_DUPLICATE_KEY => Self::DuplicateKey,
            codes::WT_NOTFOUND => Self::NotFound,
            codes::WT_PANIC => Self::Panic,
            codes::WT_RUN_RECOVERY => Self::RunRecovery,
            codes::WT_TRY_SALVAGE => Self::TrySalvage,
            other => Self::Engine {
                code: other,
                message: format!("unrecognized return code {other}"),
            },
        }
    }

    /// Converts an engine return code into a result.
    pub fn check(code: i32) -> StorageResult<()> {
        if code == codes::OK {
            Ok(())
        } else {
            Err(Self::from_code(code))
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Returns true for "item not found" and "no such table".
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::NotFound | Self::NoEntry)
    }
}
