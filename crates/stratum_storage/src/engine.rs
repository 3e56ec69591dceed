//! Key-value engine contract.
//!
//! The consistency layer treats the engine as an opaque capability: it opens
//! sessions, publishes and queries timestamps, takes checkpoints and opens
//! backup cursors. Cursors are finite iterators that release their engine
//! resources when dropped, whichever way the caller leaves the loop.

use crate::error::StorageResult;
use std::path::Path;

/// A table row as returned by a scan.
pub type Row = (String, Vec<u8>);

/// A scoped, non-restartable scan over a table.
pub type TableScan<'a> = Box<dyn Iterator<Item = StorageResult<Row>> + Send + 'a>;

/// A file listed by a backup cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    /// File name relative to the engine home (log files live under `journal/`).
    pub name: String,
    /// File size in bytes when the cursor was opened.
    pub size: u64,
}

impl BackupFile {
    /// Creates a backup file entry.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// A changed byte range reported by an incremental backup cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    /// Offset of the range in the file.
    pub offset: u64,
    /// Length of the range in bytes.
    pub length: u64,
}

/// An open backup cursor.
///
/// Iterating yields every file that must be copied. While the cursor is
/// alive the engine keeps those files immutable.
pub trait BackupCursor: Iterator<Item = StorageResult<BackupFile>> + Send {
    /// Opens a duplicate cursor listing the changed ranges of one file,
    /// configured with `incremental=(file=NAME)`.
    fn open_incremental(&mut self, config: &str) -> StorageResult<Box<dyn BlockCursor>>;

    /// Opens a duplicate cursor over the log files written since the backup
    /// began, configured with `target=("log:")`.
    fn open_log_target(&mut self, config: &str) -> StorageResult<Box<dyn BackupCursor>>;
}

/// A duplicate cursor over the changed ranges of one file.
pub trait BlockCursor: Iterator<Item = StorageResult<BlockRange>> + Send {}

impl<T> BlockCursor for T where T: Iterator<Item = StorageResult<BlockRange>> + Send {}

/// A session against an engine.
///
/// Sessions are single-threaded; callers that share one wrap it in a mutex.
pub trait KvSession: Send {
    /// Creates a table. Creating an existing table is not an error.
    fn create(&mut self, uri: &str, config: &str) -> StorageResult<()>;

    /// Drops a table.
    fn drop_table(&mut self, uri: &str, config: &str) -> StorageResult<()>;

    /// Verifies the on-disk structure of a table.
    fn verify(&mut self, uri: &str) -> StorageResult<()>;

    /// Salvages a damaged table, discarding unreadable data.
    fn salvage(&mut self, uri: &str) -> StorageResult<()>;

    /// Returns the configuration the table was created with.
    fn table_metadata(&mut self, uri: &str) -> StorageResult<String>;

    /// Looks up a key.
    fn search(&mut self, uri: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Inserts or overwrites a key.
    fn insert(&mut self, uri: &str, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes a key. Fails with `NotFound` if the key is absent.
    fn remove(&mut self, uri: &str, key: &str) -> StorageResult<()>;

    /// Scans every row of a table in key order.
    fn scan(&mut self, uri: &str) -> StorageResult<TableScan<'_>>;

    /// Takes a checkpoint (`use_timestamp=true|false`).
    fn checkpoint(&mut self, config: &str) -> StorageResult<()>;

    /// Flushes the log (`sync=on` forces it to disk).
    fn log_flush(&mut self, config: &str) -> StorageResult<()>;

    /// Opens a backup cursor (`backup:`), optionally configured for
    /// incremental backup.
    fn open_backup_cursor(&mut self, config: &str) -> StorageResult<Box<dyn BackupCursor>>;

    /// Closes the session explicitly.
    fn close(&mut self) -> StorageResult<()>;
}

/// An engine instance.
pub trait KvEngine: Send + Sync {
    /// Opens a new session.
    fn open_session(&self) -> StorageResult<Box<dyn KvSession>>;

    /// Publishes timestamps, e.g. `stable_timestamp=1f4` or
    /// `force=true,oldest_timestamp=..,commit_timestamp=..`.
    fn set_timestamp(&self, config: &str) -> StorageResult<()>;

    /// Queries a timestamp (`get=all_durable|recovery|oldest|stable|last_checkpoint`),
    /// returned as lowercase hex.
    fn query_timestamp(&self, config: &str) -> StorageResult<String>;

    /// Discards all updates newer than the stable timestamp.
    fn rollback_to_stable(&self) -> StorageResult<()>;

    /// Applies runtime configuration.
    fn reconfigure(&self, config: &str) -> StorageResult<()>;

    /// Directory holding the engine's files.
    fn home(&self) -> &Path;

    /// Returns true once shutdown has begun.
    fn is_shutting_down(&self) -> bool;

    /// Closes the engine. Subsequent calls fail with `Closed`.
    fn close(&self) -> StorageResult<()>;
}

/// Prefix of engine log file names.
pub const LOG_FILE_PREFIX: &str = "WiredTigerLog";

/// Directory (under the engine home) holding log files.
pub const LOG_DIR: &str = "journal";

/// Returns true if `name` is an engine log file.
#[must_use]
pub fn is_log_file(name: &str) -> bool {
    name.starts_with(LOG_FILE_PREFIX)
}

/// Minimal big-endian encoding of an unsigned integer (at least one byte).
#[must_use]
pub fn encode_be_minimal(value: u128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}

/// Decodes a big-endian unsigned integer of up to 16 bytes.
pub fn decode_be(bytes: &[u8]) -> StorageResult<u128> {
    if bytes.len() > 16 {
        return Err(crate::StorageError::corrupted(format!(
            "integer value is {} bytes, at most 16 supported",
            bytes.len()
        )));
    }
    Ok(bytes
        .iter()
        .fold(0u128, |acc, b| (acc << 8) | u128::from(*b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_detection() {
        assert!(is_log_file("WiredTigerLog.0000000003"));
        assert!(!is_log_file("collection-7.wt"));
    }

    #[test]
    fn big_endian_minimal_encoding() {
        assert_eq!(encode_be_minimal(0), vec![0]);
        assert_eq!(encode_be_minimal(4096), vec![0x10, 0x00]);
        assert_eq!(decode_be(&[0x10, 0x00]).unwrap(), 4096);
        assert_eq!(decode_be(&[]).unwrap(), 0);
        assert!(decode_be(&[1u8; 17]).is_err());
    }
}
