//! In-memory engine for tests and ephemeral deployments.
//!
//! `MemoryEngine` models the parts of a timestamp-aware engine the
//! consistency layer depends on: timestamp publication and queries, tables,
//! checkpoints, rollback to the last stable checkpoint, and backup cursors
//! over a scripted set of files. Faults are injected as raw engine return
//! codes so callers exercise the same translation path as a real engine.

use crate::config::ConfigString;
use crate::engine::{BackupCursor, BackupFile, BlockCursor, BlockRange, KvEngine, KvSession, TableScan};
use crate::error::{codes, StorageError, StorageResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Operation at which a fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `KvSession::create`.
    Create,
    /// `KvSession::drop_table`.
    Drop,
    /// `KvSession::verify`.
    Verify,
    /// `KvSession::salvage`.
    Salvage,
    /// `KvSession::checkpoint`.
    Checkpoint,
    /// `KvSession::open_backup_cursor`.
    OpenBackupCursor,
    /// `KvEngine::set_timestamp`.
    SetTimestamp,
    /// `KvEngine::rollback_to_stable`.
    RollbackToStable,
}

/// An injected failure.
#[derive(Debug, Clone)]
pub struct Fault {
    point: FaultPoint,
    uri: Option<String>,
    code: i32,
    remaining: Option<usize>,
}

impl Fault {
    /// Fails every call at `point` with `code` until cleared.
    #[must_use]
    pub fn always(point: FaultPoint, code: i32) -> Self {
        Self {
            point,
            uri: None,
            code,
            remaining: None,
        }
    }

    /// Fails the next call at `point` with `code`.
    #[must_use]
    pub fn once(point: FaultPoint, code: i32) -> Self {
        Self::always(point, code).times(1)
    }

    /// Restricts the fault to one table.
    #[must_use]
    pub fn for_uri(mut self, uri: &str) -> Self {
        self.uri = Some(uri.to_string());
        self
    }

    /// Limits the fault to `n` occurrences.
    #[must_use]
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }
}

/// A checkpoint recorded by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Whether the checkpoint honored the stable timestamp.
    pub use_timestamp: bool,
    /// Stable timestamp at the time of the checkpoint.
    pub stable: u64,
}

#[derive(Debug, Clone, Default)]
struct Table {
    config: String,
    rows: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
    stable: u64,
    oldest: u64,
    all_durable: Option<u64>,
    recovery: u64,
    last_checkpoint: u64,
    tables: BTreeMap<String, Table>,
    stable_image: Option<BTreeMap<String, Table>>,
    checkpoints: Vec<CheckpointRecord>,
    rollbacks: usize,
    timestamp_log: Vec<String>,
    data_files: Vec<BackupFile>,
    log_files: Vec<BackupFile>,
    changed_ranges: HashMap<String, Vec<BlockRange>>,
    backup_ids: HashSet<String>,
    backup_open: bool,
    backup_configs: Vec<String>,
    log_flushes: usize,
    reconfigurations: Vec<String>,
    faults: Vec<Fault>,
    shutting_down: bool,
    closed: bool,
}

impl State {
    fn take_fault(&mut self, point: FaultPoint, uri: Option<&str>) -> StorageResult<()> {
        let position = self.faults.iter().position(|f| {
            f.point == point && (f.uri.is_none() || f.uri.as_deref() == uri)
        });
        let Some(index) = position else {
            return Ok(());
        };
        let code = self.faults[index].code;
        if let Some(remaining) = self.faults[index].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.faults.remove(index);
            }
        }
        StorageError::check(code)
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn table(&mut self, uri: &str) -> StorageResult<&mut Table> {
        self.tables.get_mut(uri).ok_or(StorageError::NoEntry)
    }
}

/// An in-memory, timestamp-aware engine.
///
/// # Example
///
/// ```rust
/// use stratum_storage::{KvEngine, MemoryEngine};
///
/// let engine = MemoryEngine::new();
/// engine.set_timestamp("stable_timestamp=64").unwrap();
/// assert_eq!(engine.query_timestamp("get=stable").unwrap(), "64");
/// ```
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    home: PathBuf,
    state: Arc<Mutex<State>>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Creates an empty engine with no durable history.
    #[must_use]
    pub fn new() -> Self {
        Self::with_home(PathBuf::new())
    }

    /// Creates an engine whose backup files resolve under `home`.
    #[must_use]
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Simulates a restart from a checkpoint taken at `recovery`, with the
    /// given persisted oldest timestamp.
    #[must_use]
    pub fn with_recovery(self, recovery: u64, oldest: u64) -> Self {
        {
            let mut state = self.state.lock();
            state.recovery = recovery;
            state.last_checkpoint = recovery;
            state.oldest = oldest;
        }
        self
    }

    /// Sets the value reported for `get=all_durable`.
    pub fn set_all_durable(&self, ts: u64) {
        self.state.lock().all_durable = Some(ts);
    }

    /// Adds a data file to the backup file list.
    pub fn add_data_file(&self, name: &str, size: u64) {
        self.state.lock().data_files.push(BackupFile::new(name, size));
    }

    /// Adds a log file. Log files appear in the backup list and in log-target
    /// duplicate cursors opened afterwards.
    pub fn add_log_file(&self, name: &str, size: u64) {
        self.state.lock().log_files.push(BackupFile::new(name, size));
    }

    /// Sets the ranges an incremental cursor reports for `name`. Files with
    /// no ranges are reported as unchanged.
    pub fn set_changed_ranges(&self, name: &str, ranges: Vec<BlockRange>) {
        self.state
            .lock()
            .changed_ranges
            .insert(name.to_string(), ranges);
    }

    /// Injects a fault.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    /// Removes all injected faults.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Marks the engine as shutting down.
    pub fn begin_shutdown(&self) {
        self.state.lock().shutting_down = true;
    }

    /// Every configuration passed to `set_timestamp`, oldest first.
    #[must_use]
    pub fn timestamp_log(&self) -> Vec<String> {
        self.state.lock().timestamp_log.clone()
    }

    /// Checkpoints taken so far.
    #[must_use]
    pub fn checkpoints(&self) -> Vec<CheckpointRecord> {
        self.state.lock().checkpoints.clone()
    }

    /// Number of completed rollbacks.
    #[must_use]
    pub fn rollback_count(&self) -> usize {
        self.state.lock().rollbacks
    }

    /// Number of log flushes.
    #[must_use]
    pub fn log_flush_count(&self) -> usize {
        self.state.lock().log_flushes
    }

    /// Configurations used to open backup cursors.
    #[must_use]
    pub fn backup_configs(&self) -> Vec<String> {
        self.state.lock().backup_configs.clone()
    }

    /// Configurations passed to `reconfigure`.
    #[must_use]
    pub fn reconfigurations(&self) -> Vec<String> {
        self.state.lock().reconfigurations.clone()
    }

    /// Returns true while a primary backup cursor is open.
    #[must_use]
    pub fn backup_cursor_open(&self) -> bool {
        self.state.lock().backup_open
    }

    /// Returns true if the table exists.
    #[must_use]
    pub fn has_table(&self, uri: &str) -> bool {
        self.state.lock().tables.contains_key(uri)
    }
}

impl KvEngine for MemoryEngine {
    fn open_session(&self) -> StorageResult<Box<dyn KvSession>> {
        self.state.lock().check_open()?;
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }

    fn set_timestamp(&self, config: &str) -> StorageResult<()> {
        let parsed = ConfigString::parse(config)?;
        let mut state = self.state.lock();
        state.check_open()?;
        state.take_fault(FaultPoint::SetTimestamp, None)?;

        let force = parsed.get_bool("force")?.unwrap_or(false);
        let stable = parsed.get_hex("stable_timestamp")?;
        let oldest = parsed.get_hex("oldest_timestamp")?;

        if force {
            if let Some(ts) = stable {
                state.stable = ts;
            }
            if let Some(ts) = oldest {
                state.oldest = ts;
            }
        } else {
            if let Some(ts) = stable {
                state.stable = state.stable.max(ts);
            }
            if let Some(ts) = oldest {
                if state.stable != 0 && ts > state.stable {
                    return Err(StorageError::invalid_argument(format!(
                        "oldest timestamp {ts:x} must not be later than stable timestamp {:x}",
                        state.stable
                    )));
                }
                state.oldest = state.oldest.max(ts);
            }
        }
        state.timestamp_log.push(config.to_string());
        Ok(())
    }

    fn query_timestamp(&self, config: &str) -> StorageResult<String> {
        let parsed = ConfigString::parse(config)?;
        let state = self.state.lock();
        state.check_open()?;
        let value = match parsed.get("get") {
            Some("all_durable") => state.all_durable.ok_or(StorageError::NotFound)?,
            Some("recovery") => state.recovery,
            Some("oldest") if state.oldest == 0 => return Err(StorageError::NotFound),
            Some("oldest") => state.oldest,
            Some("stable") => state.stable,
            Some("last_checkpoint") => state.last_checkpoint,
            other => {
                return Err(StorageError::invalid_argument(format!(
                    "unknown timestamp query {other:?}"
                )))
            }
        };
        Ok(format!("{value:x}"))
    }

    fn rollback_to_stable(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        state.take_fault(FaultPoint::RollbackToStable, None)?;
        if state.stable == 0 {
            return Err(StorageError::from_code(codes::EINVAL));
        }
        if let Some(image) = state.stable_image.clone() {
            state.tables = image;
        }
        state.rollbacks += 1;
        Ok(())
    }

    fn reconfigure(&self, config: &str) -> StorageResult<()> {
        ConfigString::parse(config)?;
        let mut state = self.state.lock();
        state.check_open()?;
        state.reconfigurations.push(config.to_string());
        Ok(())
    }

    fn home(&self) -> &Path {
        &self.home
    }

    fn is_shutting_down(&self) -> bool {
        let state = self.state.lock();
        state.shutting_down || state.closed
    }

    fn close(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.shutting_down = true;
        state.closed = true;
        Ok(())
    }
}

struct MemorySession {
    state: Arc<Mutex<State>>,
    closed: bool,
}

impl MemorySession {
    fn lock(&self) -> StorageResult<parking_lot::MutexGuard<'_, State>> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        let state = self.state.lock();
        state.check_open()?;
        Ok(state)
    }
}

impl KvSession for MemorySession {
    fn create(&mut self, uri: &str, config: &str) -> StorageResult<()> {
        let mut state = self.lock()?;
        state.take_fault(FaultPoint::Create, Some(uri))?;
        state.tables.entry(uri.to_string()).or_insert_with(|| Table {
            config: config.to_string(),
            rows: BTreeMap::new(),
        });
        Ok(())
    }

    fn drop_table(&mut self, uri: &str, _config: &str) -> StorageResult<()> {
        let mut state = self.lock()?;
        state.take_fault(FaultPoint::Drop, Some(uri))?;
        state
            .tables
            .remove(uri)
            .map(|_| ())
            .ok_or(StorageError::NoEntry)
    }

    fn verify(&mut self, uri: &str) -> StorageResult<()> {
        let mut state = self.lock()?;
        state.take_fault(FaultPoint::Verify, Some(uri))?;
        state.table(uri).map(|_| ())
    }

    fn salvage(&mut self, uri: &str) -> StorageResult<()> {
        let mut state = self.lock()?;
        state.take_fault(FaultPoint::Salvage, Some(uri))?;
        state.table(uri).map(|_| ())
    }

    fn table_metadata(&mut self, uri: &str) -> StorageResult<String> {
        let mut state = self.lock()?;
        state.table(uri).map(|t| t.config.clone())
    }

    fn search(&mut self, uri: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let mut state = self.lock()?;
        Ok(state.table(uri)?.rows.get(key).cloned())
    }

    fn insert(&mut self, uri: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        let mut state = self.lock()?;
        state
            .table(uri)?
            .rows
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, uri: &str, key: &str) -> StorageResult<()> {
        let mut state = self.lock()?;
        state
            .table(uri)?
            .rows
            .remove(key)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    fn scan(&mut self, uri: &str) -> StorageResult<TableScan<'_>> {
        let mut state = self.lock()?;
        let rows: Vec<_> = state
            .table(uri)?
            .rows
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn checkpoint(&mut self, config: &str) -> StorageResult<()> {
        let parsed = ConfigString::parse(config)?;
        let use_timestamp = parsed.get_bool("use_timestamp")?.unwrap_or(true);
        let mut state = self.lock()?;
        state.take_fault(FaultPoint::Checkpoint, None)?;
        let stable = state.stable;
        if use_timestamp {
            state.last_checkpoint = stable;
            state.stable_image = Some(state.tables.clone());
        }
        state.checkpoints.push(CheckpointRecord {
            use_timestamp,
            stable,
        });
        Ok(())
    }

    fn log_flush(&mut self, config: &str) -> StorageResult<()> {
        ConfigString::parse(config)?;
        self.lock()?.log_flushes += 1;
        Ok(())
    }

    fn open_backup_cursor(&mut self, config: &str) -> StorageResult<Box<dyn BackupCursor>> {
        let parsed = ConfigString::parse(config)?;
        let mut state = self.lock()?;
        state.take_fault(FaultPoint::OpenBackupCursor, None)?;
        if state.backup_open {
            return Err(StorageError::from_code(codes::EBUSY));
        }

        let mut files = VecDeque::new();
        match parsed.nested("incremental")? {
            Some(inc) if inc.get_bool("force_stop")?.unwrap_or(false) => {
                state.backup_ids.clear();
            }
            Some(inc) => {
                if let Some(src) = inc.get_str("src_id") {
                    if !state.backup_ids.contains(src) {
                        return Err(StorageError::invalid_argument(format!(
                            "incremental source identifier {src:?} is unknown"
                        )));
                    }
                }
                if let Some(this) = inc.get_str("this_id") {
                    state.backup_ids.insert(this.to_string());
                }
                files.extend(state.data_files.iter().cloned());
                files.extend(state.log_files.iter().cloned());
            }
            None => {
                files.extend(state.data_files.iter().cloned());
                files.extend(state.log_files.iter().cloned());
            }
        }

        state.backup_open = true;
        state.backup_configs.push(config.to_string());
        Ok(Box::new(MemoryBackupCursor {
            state: Arc::clone(&self.state),
            files,
            primary: true,
        }))
    }

    fn close(&mut self) -> StorageResult<()> {
        self.lock()?;
        self.closed = true;
        Ok(())
    }
}

struct MemoryBackupCursor {
    state: Arc<Mutex<State>>,
    files: VecDeque<BackupFile>,
    primary: bool,
}

impl Iterator for MemoryBackupCursor {
    type Item = StorageResult<BackupFile>;

    fn next(&mut self) -> Option<Self::Item> {
        self.files.pop_front().map(Ok)
    }
}

impl BackupCursor for MemoryBackupCursor {
    fn open_incremental(&mut self, config: &str) -> StorageResult<Box<dyn BlockCursor>> {
        let parsed = ConfigString::parse(config)?;
        let file = parsed
            .nested("incremental")?
            .and_then(|inc| inc.get_str("file").map(str::to_string))
            .ok_or_else(|| StorageError::invalid_argument("incremental=(file=..) required"))?;
        let ranges = self
            .state
            .lock()
            .changed_ranges
            .get(&file)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(ranges.into_iter().map(Ok)))
    }

    fn open_log_target(&mut self, config: &str) -> StorageResult<Box<dyn BackupCursor>> {
        let parsed = ConfigString::parse(config)?;
        if parsed.get("target").is_none() {
            return Err(StorageError::invalid_argument("target=(\"log:\") required"));
        }
        let files = self.state.lock().log_files.iter().cloned().collect();
        Ok(Box::new(MemoryBackupCursor {
            state: Arc::clone(&self.state),
            files,
            primary: false,
        }))
    }
}

impl Drop for MemoryBackupCursor {
    fn drop(&mut self) {
        if self.primary {
            self.state.lock().backup_open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_table() -> (MemoryEngine, Box<dyn KvSession>) {
        let engine = MemoryEngine::new();
        let mut session = engine.open_session().unwrap();
        session
            .create("table:t", "key_format=S,value_format=u")
            .unwrap();
        (engine, session)
    }

    #[test]
    fn unforced_timestamps_never_move_backward() {
        let engine = MemoryEngine::new();
        engine.set_timestamp("stable_timestamp=64").unwrap();
        engine.set_timestamp("stable_timestamp=32").unwrap();
        assert_eq!(engine.query_timestamp("get=stable").unwrap(), "64");

        engine
            .set_timestamp("force=true,oldest_timestamp=10,commit_timestamp=10,stable_timestamp=10")
            .unwrap();
        assert_eq!(engine.query_timestamp("get=stable").unwrap(), "10");
        assert_eq!(engine.query_timestamp("get=oldest").unwrap(), "10");
    }

    #[test]
    fn oldest_ahead_of_stable_is_rejected() {
        let engine = MemoryEngine::new();
        engine.set_timestamp("stable_timestamp=10").unwrap();
        assert!(matches!(
            engine.set_timestamp("oldest_timestamp=20"),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn unset_timestamps_report_not_found() {
        let engine = MemoryEngine::new();
        assert!(matches!(
            engine.query_timestamp("get=all_durable"),
            Err(StorageError::NotFound)
        ));
        assert!(matches!(
            engine.query_timestamp("get=oldest"),
            Err(StorageError::NotFound)
        ));
        assert_eq!(engine.query_timestamp("get=recovery").unwrap(), "0");
    }

    #[test]
    fn rollback_restores_last_stable_checkpoint() {
        let (engine, mut session) = engine_with_table();
        engine.set_timestamp("stable_timestamp=5").unwrap();
        session.insert("table:t", "a", b"1").unwrap();
        session.checkpoint("use_timestamp=true").unwrap();
        session.insert("table:t", "b", b"2").unwrap();

        engine.rollback_to_stable().unwrap();
        assert_eq!(session.search("table:t", "a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(session.search("table:t", "b").unwrap(), None);
        assert_eq!(engine.rollback_count(), 1);
    }

    #[test]
    fn injected_fault_translates_code() {
        let (engine, mut session) = engine_with_table();
        engine.inject(Fault::once(FaultPoint::Verify, codes::EBUSY).for_uri("table:t"));
        assert!(matches!(session.verify("table:t"), Err(StorageError::Busy)));
        assert!(session.verify("table:t").is_ok());
    }

    #[test]
    fn remove_missing_key_is_not_found() {
        let (_engine, mut session) = engine_with_table();
        assert!(matches!(
            session.remove("table:t", "nope"),
            Err(StorageError::NotFound)
        ));
        assert!(matches!(
            session.search("table:missing", "k"),
            Err(StorageError::NoEntry)
        ));
    }

    #[test]
    fn only_one_backup_cursor_at_a_time() {
        let engine = MemoryEngine::new();
        engine.add_data_file("a.wt", 10);
        let mut session = engine.open_session().unwrap();
        let cursor = session.open_backup_cursor("").unwrap();
        assert!(engine.backup_cursor_open());
        assert!(matches!(
            session.open_backup_cursor(""),
            Err(StorageError::Busy)
        ));
        drop(cursor);
        assert!(!engine.backup_cursor_open());
    }

    #[test]
    fn incremental_source_must_be_known() {
        let engine = MemoryEngine::new();
        let mut session = engine.open_session().unwrap();
        let err = session
            .open_backup_cursor("incremental=(enabled=true,src_id=\"nope\",this_id=\"b2\")")
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::InvalidArgument(_)));

        drop(session.open_backup_cursor("incremental=(enabled=true,this_id=\"b1\")").unwrap());
        drop(
            session
                .open_backup_cursor("incremental=(enabled=true,src_id=\"b1\",this_id=\"b2\")")
                .unwrap(),
        );

        drop(session.open_backup_cursor("incremental=(force_stop=true)").unwrap());
        assert!(session
            .open_backup_cursor("incremental=(enabled=true,src_id=\"b2\",this_id=\"b3\")")
            .is_err());
    }

    #[test]
    fn duplicate_cursors_list_ranges_and_logs() {
        let engine = MemoryEngine::new();
        engine.add_data_file("a.wt", 100);
        engine.set_changed_ranges(
            "a.wt",
            vec![BlockRange { offset: 0, length: 10 }, BlockRange { offset: 50, length: 10 }],
        );
        let mut session = engine.open_session().unwrap();
        let mut cursor = session.open_backup_cursor("").unwrap();
        let ranges: Vec<_> = cursor
            .open_incremental("incremental=(file=a.wt)")
            .unwrap()
            .collect::<StorageResult<_>>()
            .unwrap();
        assert_eq!(ranges.len(), 2);

        engine.add_log_file("WiredTigerLog.0000000002", 4);
        let logs: Vec<_> = cursor
            .open_log_target("target=(\"log:\")")
            .unwrap()
            .collect::<StorageResult<_>>()
            .unwrap();
        assert_eq!(logs, vec![BackupFile::new("WiredTigerLog.0000000002", 4)]);
    }

    #[test]
    fn closed_engine_rejects_sessions() {
        let engine = MemoryEngine::new();
        engine.close().unwrap();
        assert!(engine.is_shutting_down());
        assert!(matches!(engine.open_session(), Err(StorageError::Closed)));
    }
}
