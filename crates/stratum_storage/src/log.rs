//! Durable, file-backed table engine.
//!
//! Every mutation is appended to a single record log (`WiredTigerLog.0000000001`)
//! and applied to an in-memory table map. A checkpoint folds the map into
//! `stratum.snapshot` with write-then-rename and empties the log. The engine
//! keeps no timestamp history; it backs stores that only need durability,
//! such as the encryption key store.
//!
//! ## Directory layout
//!
//! ```text
//! home/
//! ├── LOCK                       # advisory lock, one process at a time
//! ├── stratum.snapshot           # last checkpoint
//! ├── WiredTigerLog.0000000001   # records since the last checkpoint
//! └── incremental.ids            # known incremental backup identifiers
//! ```

use crate::cipher::{EncryptionKey, RecordCipher};
use crate::config::ConfigString;
use crate::engine::{
    BackupCursor, BackupFile, BlockCursor, BlockRange, KvEngine, KvSession, TableScan,
    LOG_FILE_PREFIX,
};
use crate::error::{StorageError, StorageResult};
use crate::record::{decode_all, LogRecord};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Lock file name.
pub const LOCK_FILE: &str = "LOCK";
/// Snapshot file name.
pub const SNAPSHOT_FILE: &str = "stratum.snapshot";
const SNAPSHOT_TEMP: &str = "stratum.snapshot.tmp";
const BACKUP_IDS_FILE: &str = "incremental.ids";

/// Name of the record log file.
#[must_use]
pub fn log_file_name() -> String {
    format!("{LOG_FILE_PREFIX}.0000000001")
}

/// Options for opening a [`LogEngine`].
#[derive(Debug, Clone)]
pub struct LogEngineOptions {
    /// Create the directory if it does not exist.
    pub create: bool,
    /// Sync the log after every write.
    pub sync_on_write: bool,
    /// Key used to seal every record at rest.
    pub encryption_key: Option<EncryptionKey>,
}

impl Default for LogEngineOptions {
    fn default() -> Self {
        Self {
            create: true,
            sync_on_write: true,
            encryption_key: None,
        }
    }
}

impl LogEngineOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create a missing directory.
    #[must_use]
    pub fn create(mut self, value: bool) -> Self {
        self.create = value;
        self
    }

    /// Sets whether to sync after every write.
    #[must_use]
    pub fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Seals records with `key`.
    #[must_use]
    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Builds options from an engine configuration string
    /// (`create`, `transaction_sync=(enabled=..)`).
    pub fn from_config(config: &str) -> StorageResult<Self> {
        let parsed = ConfigString::parse(config)?;
        if parsed.get_bool("in_memory")?.unwrap_or(false) {
            return Err(StorageError::invalid_argument(
                "log engine cannot run in memory",
            ));
        }
        let mut options = Self::new().create(parsed.get_bool("create")?.unwrap_or(false));
        if let Some(sync) = parsed.nested("transaction_sync")? {
            options.sync_on_write = sync.get_bool("enabled")?.unwrap_or(true);
        }
        Ok(options)
    }
}

#[derive(Debug, Clone, Default)]
struct Table {
    config: String,
    rows: BTreeMap<String, Vec<u8>>,
}

struct LogState {
    tables: BTreeMap<String, Table>,
    log: File,
    backup_ids: BTreeSet<String>,
}

struct Inner {
    home: PathBuf,
    state: Mutex<LogState>,
    cipher: Option<RecordCipher>,
    sync_on_write: AtomicBool,
    lock_file: Mutex<Option<File>>,
    backup_open: AtomicBool,
    closed: AtomicBool,
    stable: AtomicU64,
    oldest: AtomicU64,
}

/// A durable table engine backed by a record log and a snapshot.
#[derive(Clone)]
pub struct LogEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LogEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEngine")
            .field("home", &self.inner.home)
            .field("encrypted", &self.inner.cipher.is_some())
            .finish()
    }
}

impl LogEngine {
    /// Opens (or creates) an engine in `home`.
    ///
    /// Replays the snapshot and the log, then checkpoints so the log starts
    /// empty and any torn tail is discarded.
    ///
    /// # Errors
    ///
    /// - `NoEntry` if the directory is missing and `create` is false
    /// - `Locked` if another handle holds the directory
    /// - `Corrupted` or `Encryption` if stored records cannot be read
    pub fn open(home: impl AsRef<Path>, options: LogEngineOptions) -> StorageResult<Self> {
        let home = home.as_ref().to_path_buf();
        if !home.exists() {
            if !options.create {
                return Err(StorageError::NoEntry);
            }
            fs::create_dir_all(&home)?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(home.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        let cipher = options.encryption_key.as_ref().map(RecordCipher::new);
        let mut tables = BTreeMap::new();
        for path in [home.join(SNAPSHOT_FILE), home.join(log_file_name())] {
            if path.exists() {
                let data = fs::read(&path)?;
                for record in decode_all(&data, cipher.as_ref())? {
                    apply(&mut tables, record)?;
                }
            }
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(home.join(log_file_name()))?;
        let backup_ids = read_backup_ids(&home)?;

        let engine = Self {
            inner: Arc::new(Inner {
                home,
                state: Mutex::new(LogState {
                    tables,
                    log,
                    backup_ids,
                }),
                cipher,
                sync_on_write: AtomicBool::new(options.sync_on_write),
                lock_file: Mutex::new(Some(lock_file)),
                backup_open: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                stable: AtomicU64::new(0),
                oldest: AtomicU64::new(0),
            }),
        };
        engine.inner.compact()?;
        info!(home = %engine.inner.home.display(), "log engine opened");
        Ok(engine)
    }

    /// Opens an engine from a configuration string.
    pub fn open_with_config(home: impl AsRef<Path>, config: &str) -> StorageResult<Self> {
        Self::open(home, LogEngineOptions::from_config(config)?)
    }

    /// Returns true if records are sealed at rest.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.inner.cipher.is_some()
    }
}

fn apply(tables: &mut BTreeMap<String, Table>, record: LogRecord) -> StorageResult<()> {
    match record {
        LogRecord::CreateTable { uri, config } => {
            tables.entry(uri).or_insert_with(|| Table {
                config,
                rows: BTreeMap::new(),
            });
        }
        LogRecord::DropTable { uri } => {
            tables.remove(&uri);
        }
        LogRecord::Put { uri, key, value } => {
            let table = tables
                .get_mut(&uri)
                .ok_or_else(|| StorageError::corrupted(format!("write to unknown table {uri}")))?;
            table.rows.insert(key, value);
        }
        LogRecord::Remove { uri, key } => {
            if let Some(table) = tables.get_mut(&uri) {
                table.rows.remove(&key);
            }
        }
    }
    Ok(())
}

fn read_backup_ids(home: &Path) -> StorageResult<BTreeSet<String>> {
    let path = home.join(BACKUP_IDS_FILE);
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Writes `data` to `path` through a temporary file and an atomic rename.
fn write_atomically(dir: &Path, temp: &str, path: &Path, data: &[u8]) -> StorageResult<()> {
    let temp_path = dir.join(temp);
    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp_path, path)?;
    sync_directory(dir)
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> StorageResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> StorageResult<()> {
    Ok(())
}

impl Inner {
    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn append(&self, state: &mut LogState, record: LogRecord) -> StorageResult<()> {
        let data = record.encode(self.cipher.as_ref())?;
        state.log.write_all(&data)?;
        if self.sync_on_write.load(Ordering::SeqCst) {
            state.log.sync_data()?;
        }
        apply(&mut state.tables, record)
    }

    /// Folds the log into a fresh snapshot. Skipped while a backup cursor
    /// pins the current files.
    fn compact(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        if self.backup_open.load(Ordering::SeqCst) {
            state.log.sync_data()?;
            debug!("backup cursor open; checkpoint only synced the log");
            return Ok(());
        }

        let mut snapshot = Vec::new();
        for (uri, table) in &state.tables {
            snapshot.extend(
                LogRecord::CreateTable {
                    uri: uri.clone(),
                    config: table.config.clone(),
                }
                .encode(self.cipher.as_ref())?,
            );
            for (key, value) in &table.rows {
                snapshot.extend(
                    LogRecord::Put {
                        uri: uri.clone(),
                        key: key.clone(),
                        value: value.clone(),
                    }
                    .encode(self.cipher.as_ref())?,
                );
            }
        }
        write_atomically(&self.home, SNAPSHOT_TEMP, &self.home.join(SNAPSHOT_FILE), &snapshot)?;
        state.log.set_len(0)?;
        state.log.sync_all()?;
        Ok(())
    }

    fn file_size(&self, name: &str) -> StorageResult<u64> {
        Ok(fs::metadata(self.home.join(name))?.len())
    }
}

impl KvEngine for LogEngine {
    fn open_session(&self) -> StorageResult<Box<dyn KvSession>> {
        self.inner.check_open()?;
        Ok(Box::new(LogSession {
            inner: Arc::clone(&self.inner),
            closed: false,
        }))
    }

    fn set_timestamp(&self, config: &str) -> StorageResult<()> {
        self.inner.check_open()?;
        let parsed = ConfigString::parse(config)?;
        let force = parsed.get_bool("force")?.unwrap_or(false);
        for (key, slot) in [
            ("stable_timestamp", &self.inner.stable),
            ("oldest_timestamp", &self.inner.oldest),
        ] {
            if let Some(ts) = parsed.get_hex(key)? {
                if force {
                    slot.store(ts, Ordering::SeqCst);
                } else {
                    slot.fetch_max(ts, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    fn query_timestamp(&self, config: &str) -> StorageResult<String> {
        self.inner.check_open()?;
        let parsed = ConfigString::parse(config)?;
        let value = match parsed.get("get") {
            Some("recovery" | "last_checkpoint") => 0,
            Some("stable") => self.inner.stable.load(Ordering::SeqCst),
            Some("oldest") => published(&self.inner.oldest)?,
            // Every write is durable once logged.
            Some("all_durable") => published(&self.inner.stable)?,
            other => {
                return Err(StorageError::invalid_argument(format!(
                    "unknown timestamp query {other:?}"
                )))
            }
        };
        Ok(format!("{value:x}"))
    }

    fn rollback_to_stable(&self) -> StorageResult<()> {
        Err(StorageError::invalid_argument(
            "log engine keeps no timestamp history",
        ))
    }

    fn reconfigure(&self, config: &str) -> StorageResult<()> {
        self.inner.check_open()?;
        let parsed = ConfigString::parse(config)?;
        if let Some(sync) = parsed.nested("transaction_sync")? {
            let enabled = sync.get_bool("enabled")?.unwrap_or(true);
            self.inner.sync_on_write.store(enabled, Ordering::SeqCst);
        }
        Ok(())
    }

    fn home(&self) -> &Path {
        &self.inner.home
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> StorageResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.state.lock().log.sync_all()?;
        // Dropping the handle releases the advisory lock.
        self.inner.lock_file.lock().take();
        info!(home = %self.inner.home.display(), "log engine closed");
        Ok(())
    }
}

struct LogSession {
    inner: Arc<Inner>,
    closed: bool,
}

impl LogSession {
    fn check_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        self.inner.check_open()
    }
}

impl KvSession for LogSession {
    fn create(&mut self, uri: &str, config: &str) -> StorageResult<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock();
        if state.tables.contains_key(uri) {
            return Ok(());
        }
        self.inner.append(
            &mut state,
            LogRecord::CreateTable {
                uri: uri.to_string(),
                config: config.to_string(),
            },
        )
    }

    fn drop_table(&mut self, uri: &str, _config: &str) -> StorageResult<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock();
        if !state.tables.contains_key(uri) {
            return Err(StorageError::NoEntry);
        }
        self.inner.append(
            &mut state,
            LogRecord::DropTable {
                uri: uri.to_string(),
            },
        )
    }

    fn verify(&mut self, uri: &str) -> StorageResult<()> {
        self.check_open()?;
        if self.inner.state.lock().tables.contains_key(uri) {
            Ok(())
        } else {
            Err(StorageError::NoEntry)
        }
    }

    fn salvage(&mut self, uri: &str) -> StorageResult<()> {
        // Replay already dropped anything unreadable.
        self.verify(uri)
    }

    fn table_metadata(&mut self, uri: &str) -> StorageResult<String> {
        self.check_open()?;
        self.inner
            .state
            .lock()
            .tables
            .get(uri)
            .map(|t| t.config.clone())
            .ok_or(StorageError::NoEntry)
    }

    fn search(&mut self, uri: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.check_open()?;
        let state = self.inner.state.lock();
        let table = state.tables.get(uri).ok_or(StorageError::NoEntry)?;
        Ok(table.rows.get(key).cloned())
    }

    fn insert(&mut self, uri: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock();
        if !state.tables.contains_key(uri) {
            return Err(StorageError::NoEntry);
        }
        self.inner.append(
            &mut state,
            LogRecord::Put {
                uri: uri.to_string(),
                key: key.to_string(),
                value: value.to_vec(),
            },
        )
    }

    fn remove(&mut self, uri: &str, key: &str) -> StorageResult<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock();
        let table = state.tables.get(uri).ok_or(StorageError::NoEntry)?;
        if !table.rows.contains_key(key) {
            return Err(StorageError::NotFound);
        }
        self.inner.append(
            &mut state,
            LogRecord::Remove {
                uri: uri.to_string(),
                key: key.to_string(),
            },
        )
    }

    fn scan(&mut self, uri: &str) -> StorageResult<TableScan<'_>> {
        self.check_open()?;
        let state = self.inner.state.lock();
        let table = state.tables.get(uri).ok_or(StorageError::NoEntry)?;
        let rows: Vec<_> = table
            .rows
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn checkpoint(&mut self, config: &str) -> StorageResult<()> {
        self.check_open()?;
        ConfigString::parse(config)?;
        self.inner.compact()
    }

    fn log_flush(&mut self, config: &str) -> StorageResult<()> {
        self.check_open()?;
        ConfigString::parse(config)?;
        self.inner.state.lock().log.sync_data()?;
        Ok(())
    }

    fn open_backup_cursor(&mut self, config: &str) -> StorageResult<Box<dyn BackupCursor>> {
        self.check_open()?;
        let parsed = ConfigString::parse(config)?;
        if self
            .inner
            .backup_open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StorageError::Busy);
        }
        // From here on the cursor's drop clears the backup flag.
        let mut cursor = LogBackupCursor {
            inner: Arc::clone(&self.inner),
            files: VecDeque::new(),
            primary: true,
        };

        if let Some(inc) = parsed.nested("incremental")? {
            let mut state = self.inner.state.lock();
            if inc.get_bool("force_stop")?.unwrap_or(false) {
                state.backup_ids.clear();
                persist_backup_ids(&self.inner.home, &state.backup_ids)?;
                return Ok(Box::new(cursor));
            }
            if let Some(src) = inc.get_str("src_id") {
                if !state.backup_ids.contains(src) {
                    return Err(StorageError::invalid_argument(format!(
                        "incremental source identifier {src:?} is unknown"
                    )));
                }
            }
            if let Some(this) = inc.get_str("this_id") {
                state.backup_ids.insert(this.to_string());
                persist_backup_ids(&self.inner.home, &state.backup_ids)?;
            }
        }

        self.inner.state.lock().log.sync_data()?;
        for name in [SNAPSHOT_FILE.to_string(), log_file_name()] {
            if self.inner.home.join(&name).exists() {
                let size = self.inner.file_size(&name)?;
                cursor.files.push_back(BackupFile::new(name, size));
            }
        }
        Ok(Box::new(cursor))
    }

    fn close(&mut self) -> StorageResult<()> {
        self.check_open()?;
        self.closed = true;
        Ok(())
    }
}

fn published(slot: &AtomicU64) -> StorageResult<u64> {
    match slot.load(Ordering::SeqCst) {
        0 => Err(StorageError::NotFound),
        ts => Ok(ts),
    }
}

fn persist_backup_ids(home: &Path, ids: &BTreeSet<String>) -> StorageResult<()> {
    let mut contents = String::new();
    for id in ids {
        contents.push_str(id);
        contents.push('\n');
    }
    write_atomically(
        home,
        "incremental.ids.tmp",
        &home.join(BACKUP_IDS_FILE),
        contents.as_bytes(),
    )
}

struct LogBackupCursor {
    inner: Arc<Inner>,
    files: VecDeque<BackupFile>,
    primary: bool,
}

impl Iterator for LogBackupCursor {
    type Item = StorageResult<BackupFile>;

    fn next(&mut self) -> Option<Self::Item> {
        self.files.pop_front().map(Ok)
    }
}

impl BackupCursor for LogBackupCursor {
    fn open_incremental(&mut self, config: &str) -> StorageResult<Box<dyn BlockCursor>> {
        let parsed = ConfigString::parse(config)?;
        let file = parsed
            .nested("incremental")?
            .and_then(|inc| inc.get_str("file").map(str::to_string))
            .ok_or_else(|| StorageError::invalid_argument("incremental=(file=..) required"))?;
        // No block tracking: a non-empty file is reported as changed in full.
        let size = self.inner.file_size(&file)?;
        let ranges = if size == 0 {
            Vec::new()
        } else {
            vec![BlockRange {
                offset: 0,
                length: size,
            }]
        };
        Ok(Box::new(ranges.into_iter().map(Ok)))
    }

    fn open_log_target(&mut self, config: &str) -> StorageResult<Box<dyn BackupCursor>> {
        let parsed = ConfigString::parse(config)?;
        if parsed.get("target").is_none() {
            return Err(StorageError::invalid_argument("target=(\"log:\") required"));
        }
        let name = log_file_name();
        let size = self.inner.file_size(&name)?;
        Ok(Box::new(LogBackupCursor {
            inner: Arc::clone(&self.inner),
            files: VecDeque::from([BackupFile::new(name, size)]),
            primary: false,
        }))
    }
}

impl Drop for LogBackupCursor {
    fn drop(&mut self) {
        if self.primary {
            self.inner.backup_open.store(false, Ordering::SeqCst);
        }
    }
}
