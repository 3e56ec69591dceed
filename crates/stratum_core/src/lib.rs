//! # Stratum Core
//!
//! Timestamp consistency, checkpoint, backup and encryption key store layer
//! over a [`stratum_storage::KvEngine`].
//!
//! This crate provides:
//! - [`TimestampController`]: stable, oldest, initial-data and recovery
//!   timestamps plus named pins on history
//! - [`CheckpointCoordinator`]: stable and unstable checkpoints,
//!   rollback to stable, and the oplog floors they imply
//! - [`BackupCoordinator`]: full, incremental and hot backups
//! - [`EncryptionKeyStore`]: per-namespace data keys, master key bootstrap
//!   and rotation, and GCM nonces that survive restarts
//! - [`StorageEngine`]: opens all of the above in order and shuts them down
//!
//! ## Example
//!
//! ```rust
//! use stratum_core::{EngineConfig, EngineServices, StorageEngine};
//! use stratum_storage::MemoryEngine;
//!
//! let engine = StorageEngine::open_memory(
//!     EngineConfig::default(),
//!     &EngineServices::new(),
//!     MemoryEngine::new(),
//! )
//! .unwrap()
//! .ready()
//! .unwrap();
//! engine.shutdown().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backup;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod fatal;
pub mod fs_util;
pub mod keystore;
pub mod repair;
pub mod size_storer;
pub mod timestamp;
mod types;
mod write_unit;

pub use backup::{BackupBlock, BackupCoordinator, BackupOptions, HotBackup, StreamingCursor};
pub use checkpoint::{CheckpointCoordinator, CheckpointOutcome, OldestActiveTransactionCallback};
pub use config::{EncryptionConfig, EngineConfig, DEFAULT_HISTORY_WINDOW_SECS};
pub use engine::{engine_config_string, has_key_store, EngineServices, OpenOutcome, StorageEngine};
pub use error::{CoreError, CoreResult};
pub use keystore::{
    DirectorySecretService, EncryptionHooks, EncryptionKeyStore, KeyProvider, KeyStoreContext,
    KeyStoreRegistry, KeyStoreRole, MemorySecretService, RotationOutcome, SecretService,
};
pub use repair::{DropQueue, RepairManager, RepairOutcome};
pub use size_storer::{SizeInfo, SizeStorer};
pub use timestamp::{TimestampController, STARTUP_PIN};
pub use types::Timestamp;
pub use write_unit::{UnitState, WriteUnitOfWork};
