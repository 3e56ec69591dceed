//! # Stratum Storage
//!
//! The key-value engine contract consumed by the Stratum consistency layer,
//! plus two engines that implement it.
//!
//! The consistency layer never reaches into page formats or transaction
//! internals. It opens sessions, publishes and queries timestamps, takes
//! checkpoints, and walks backup cursors, all through [`KvEngine`] and
//! [`KvSession`]. Raw engine return codes stop at [`StorageError::from_code`].
//!
//! ## Available Engines
//!
//! - [`MemoryEngine`] - timestamp-aware, in memory, with fault injection
//! - [`LogEngine`] - durable record log plus snapshot, optionally sealed
//!   with AES-256-GCM
//!
//! ## Example
//!
//! ```rust
//! use stratum_storage::{KvEngine, KvSession, MemoryEngine};
//!
//! let engine = MemoryEngine::new();
//! let mut session = engine.open_session().unwrap();
//! session.create("table:key", "key_format=S,value_format=u").unwrap();
//! session.insert("table:key", "db1", &[0u8; 32]).unwrap();
//! assert!(session.search("table:key", "db1").unwrap().is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cipher;
mod config;
mod engine;
mod error;
mod log;
mod memory;
mod record;

pub use cipher::{EncryptionKey, RecordCipher, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use config::ConfigString;
pub use engine::{
    decode_be, encode_be_minimal, is_log_file, BackupCursor, BackupFile, BlockCursor, BlockRange,
    KvEngine, KvSession, Row, TableScan, LOG_DIR, LOG_FILE_PREFIX,
};
pub use error::{codes, StorageError, StorageResult};
pub use log::{log_file_name, LogEngine, LogEngineOptions, LOCK_FILE, SNAPSHOT_FILE};
pub use memory::{CheckpointRecord, Fault, FaultPoint, MemoryEngine};
pub use record::{compute_crc32, decode_all, LogRecord};
