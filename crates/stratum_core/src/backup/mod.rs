//! Backup cursor lifecycle.
//!
//! A non-blocking backup keeps one engine backup cursor open while the
//! caller copies files. Blocks are handed out in batches by
//! [`StreamingCursor::get_next_batch`]; for incremental backups each file is
//! expanded into its changed ranges through a duplicate cursor. While the
//! backup is open, [`BackupCoordinator::extend_backup_cursor`] lists log
//! files written since it began.
//!
//! Locking: `batch_lock` is held for a whole batch, `cursor` for one step of
//! it. Extension only takes `cursor`, waiting on `duplicate_closed` until no
//! duplicate cursor is open, so it can interleave with a long batch.

mod hot;

pub use hot::{HotBackup, STORAGE_METADATA_FILE};

use crate::checkpoint::CheckpointCoordinator;
use crate::error::{CoreError, CoreResult};
use crate::keystore::EncryptionKeyStore;
use crate::size_storer::SizeStorer;
use crate::types::Timestamp;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratum_storage::{
    is_log_file, BackupCursor, BlockCursor, KvEngine, KvSession, StorageError, LOG_DIR,
};
use tracing::{debug, info, warn};

/// Default incremental granularity in megabytes.
pub const DEFAULT_BLOCK_SIZE_MB: u64 = 16;

/// A byte range to copy.
///
/// `offset == 0 && length == 0` on an incremental backup means the file is
/// unchanged since the source backup. Full backups report `length == 0` and
/// copy `file_size` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupBlock {
    /// Absolute path of the file.
    pub file_path: PathBuf,
    /// Offset of the range.
    pub offset: u64,
    /// Length of the range.
    pub length: u64,
    /// Size of the file when the backup began.
    pub file_size: u64,
}

impl BackupBlock {
    /// Creates a block.
    pub fn new(file_path: impl Into<PathBuf>, offset: u64, length: u64, file_size: u64) -> Self {
        Self {
            file_path: file_path.into(),
            offset,
            length,
            file_size,
        }
    }

    /// Returns true for an unchanged-file marker.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.offset == 0 && self.length == 0
    }
}

/// Options for a non-blocking backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOptions {
    /// Report changed ranges instead of whole files.
    pub incremental: bool,
    /// Identifier recorded for this backup.
    pub this_backup_name: Option<String>,
    /// Identifier of the backup this one builds on.
    pub src_backup_name: Option<String>,
    /// Granularity of changed ranges in megabytes.
    pub block_size_mb: u64,
    /// Discard incremental tracking instead of taking a backup.
    pub disable_incremental: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            incremental: false,
            this_backup_name: None,
            src_backup_name: None,
            block_size_mb: DEFAULT_BLOCK_SIZE_MB,
            disable_incremental: false,
        }
    }
}

impl BackupOptions {
    /// Options for a full backup.
    #[must_use]
    pub fn full() -> Self {
        Self::default()
    }

    /// Options for an incremental backup named `this_backup_name`.
    #[must_use]
    pub fn incremental(this_backup_name: impl Into<String>) -> Self {
        Self {
            incremental: true,
            this_backup_name: Some(this_backup_name.into()),
            ..Self::default()
        }
    }

    /// Options that stop incremental tracking.
    #[must_use]
    pub fn disable_incremental() -> Self {
        Self {
            disable_incremental: true,
            ..Self::default()
        }
    }

    /// Sets the source backup.
    #[must_use]
    pub fn src_backup_name(mut self, name: impl Into<String>) -> Self {
        self.src_backup_name = Some(name.into());
        self
    }

    /// Sets the granularity.
    #[must_use]
    pub const fn block_size_mb(mut self, mb: u64) -> Self {
        self.block_size_mb = mb;
        self
    }

    /// Backup cursor configuration for these options.
    #[must_use]
    pub fn cursor_config(&self) -> String {
        if self.disable_incremental {
            return String::from("incremental=(force_stop=true)");
        }
        if !self.incremental {
            return String::new();
        }
        let mut config = format!(
            "incremental=(enabled=true,force_stop=false,granularity={}MB,",
            self.block_size_mb
        );
        if let Some(this) = &self.this_backup_name {
            config.push_str(&format!("this_id=\"{this}\","));
        }
        if let Some(src) = &self.src_backup_name {
            config.push_str(&format!("src_id=\"{src}\","));
        }
        config.push(')');
        config
    }

    /// Rejects options that ask for an incremental backup and for
    /// incremental tracking to stop at once.
    pub fn validate(&self) -> CoreResult<()> {
        if self.incremental && self.disable_incremental {
            return Err(CoreError::invalid_argument(
                "incremental backup and disabling incremental backup are mutually exclusive",
            ));
        }
        Ok(())
    }

    fn is_first_incremental(&self) -> bool {
        self.incremental && self.src_backup_name.is_none()
    }
}

/// Resolves a backup file name against `home`. Log files missing from the
/// home directory are looked up under `journal/`.
#[must_use]
pub fn resolve_backup_file(home: &Path, name: &str) -> PathBuf {
    let direct = home.join(name);
    if is_log_file(name) && !direct.exists() {
        home.join(LOG_DIR).join(name)
    } else {
        direct
    }
}

fn open_backup_cursor(
    session: &mut dyn KvSession,
    config: &str,
) -> CoreResult<Box<dyn BackupCursor>> {
    session.open_backup_cursor(config).map_err(|e| match e {
        StorageError::Busy => CoreError::BackupInProgress,
        other => other.into(),
    })
}

struct CurrentFile {
    name: String,
    path: PathBuf,
    size: u64,
    emitted: bool,
}

#[derive(Default)]
struct CursorState {
    duplicate: Option<Box<dyn BlockCursor>>,
    primary: Option<Box<dyn BackupCursor>>,
    session: Option<Box<dyn KvSession>>,
    current: Option<CurrentFile>,
    options: Option<BackupOptions>,
    seen_by_batch: HashSet<PathBuf>,
    seen_by_extend: HashSet<PathBuf>,
}

/// One engine's backup cursor and the bookkeeping around it.
pub(crate) struct BackupState {
    home: PathBuf,
    batch_lock: Mutex<()>,
    cursor: Mutex<CursorState>,
    duplicate_closed: Condvar,
}

impl BackupState {
    pub(crate) fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            batch_lock: Mutex::new(()),
            cursor: Mutex::new(CursorState::default()),
            duplicate_closed: Condvar::new(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.cursor.lock().primary.is_some()
    }

    /// Opens the primary cursor.
    pub(crate) fn open(&self, engine: &dyn KvEngine, options: &BackupOptions) -> CoreResult<()> {
        let _batch = self.batch_lock.lock();
        let mut state = self.cursor.lock();
        if state.primary.is_some() {
            return Err(CoreError::BackupInProgress);
        }

        let mut session = engine.open_session()?;
        let cursor = open_backup_cursor(session.as_mut(), &options.cursor_config())?;

        state.primary = Some(cursor);
        state.session = Some(session);
        state.options = Some(options.clone());
        state.current = None;
        state.seen_by_batch.clear();
        state.seen_by_extend.clear();
        Ok(())
    }

    /// Opens a force-stop cursor and closes it again, discarding incremental
    /// tracking. Fails while a backup is open.
    pub(crate) fn force_stop(&self, engine: &dyn KvEngine) -> CoreResult<()> {
        let _batch = self.batch_lock.lock();
        let state = self.cursor.lock();
        if state.primary.is_some() {
            return Err(CoreError::BackupInProgress);
        }

        let mut session = engine.open_session()?;
        let config = BackupOptions::disable_incremental().cursor_config();
        drop(open_backup_cursor(session.as_mut(), &config)?);
        session.close()?;
        Ok(())
    }

    /// Returns up to `batch_size` blocks; an empty batch ends the stream.
    pub(crate) fn next_batch(&self, batch_size: usize) -> CoreResult<Vec<BackupBlock>> {
        if batch_size == 0 {
            return Err(CoreError::invalid_argument("batch size must be positive"));
        }
        let _batch = self.batch_lock.lock();
        let mut blocks = Vec::new();

        while blocks.len() < batch_size {
            let mut guard = self.cursor.lock();
            let state = &mut *guard;
            let Some(primary) = state.primary.as_mut() else {
                return Err(CoreError::BackupNotOpen);
            };
            let options = state.options.clone().unwrap_or_default();

            if state.duplicate.is_none() {
                let file = match primary.next() {
                    None => break,
                    Some(file) => file?,
                };
                let path = resolve_backup_file(&self.home, &file.name);

                if is_log_file(&file.name) {
                    if state.seen_by_extend.contains(&path) {
                        continue;
                    }
                    state.seen_by_batch.insert(path.clone());
                }

                if !options.incremental {
                    blocks.push(BackupBlock::new(path, 0, 0, file.size));
                    continue;
                }
                if options.is_first_incremental() {
                    blocks.push(BackupBlock::new(path, 0, file.size, file.size));
                    continue;
                }

                let config = format!("incremental=(file={})", file.name);
                state.duplicate = Some(primary.open_incremental(&config)?);
                state.current = Some(CurrentFile {
                    name: file.name,
                    path,
                    size: file.size,
                    emitted: false,
                });
            }

            let (Some(duplicate), Some(current)) = (state.duplicate.as_mut(), state.current.as_mut())
            else {
                continue;
            };
            let mut exhausted = false;
            while blocks.len() < batch_size {
                match duplicate.next() {
                    Some(range) => {
                        let range = range?;
                        current.emitted = true;
                        blocks.push(BackupBlock::new(
                            current.path.clone(),
                            range.offset,
                            range.length,
                            current.size,
                        ));
                    }
                    None => {
                        if !current.emitted {
                            blocks.push(BackupBlock::new(current.path.clone(), 0, 0, current.size));
                        }
                        exhausted = true;
                        break;
                    }
                }
            }
            if exhausted {
                debug!(file = %current.name, "finished changed ranges");
                state.duplicate = None;
                state.current = None;
                self.duplicate_closed.notify_all();
            }
        }
        Ok(blocks)
    }

    /// Lists log files written since the backup began. `before_open` runs
    /// once no duplicate cursor is open.
    pub(crate) fn extend(
        &self,
        before_open: impl FnOnce() -> CoreResult<()>,
    ) -> CoreResult<Vec<PathBuf>> {
        let mut guard = self.cursor.lock();
        while guard.duplicate.is_some() {
            self.duplicate_closed.wait(&mut guard);
        }
        let state = &mut *guard;
        let Some(primary) = state.primary.as_mut() else {
            return Err(CoreError::BackupNotOpen);
        };
        before_open()?;

        let logs = primary.open_log_target("target=(\"log:\")")?;
        let mut fresh = Vec::new();
        for file in logs {
            let file = file?;
            let path = resolve_backup_file(&self.home, &file.name);
            state.seen_by_extend.insert(path.clone());
            if !state.seen_by_batch.contains(&path) {
                fresh.push(path);
            }
        }
        Ok(fresh)
    }

    /// Releases every cursor. During shutdown the session is dropped
    /// without closing it.
    pub(crate) fn release(&self, shutting_down: bool) {
        let _batch = self.batch_lock.lock();
        let mut state = self.cursor.lock();
        state.duplicate = None;
        state.current = None;
        state.primary = None;
        if let Some(mut session) = state.session.take() {
            if !shutting_down {
                if let Err(e) = session.close() {
                    warn!(error = %e, "failed to close backup session");
                }
            }
        }
        state.options = None;
        state.seen_by_batch.clear();
        state.seen_by_extend.clear();
        self.duplicate_closed.notify_all();
    }
}

/// Hands out blocks of an open non-blocking backup.
pub struct StreamingCursor {
    state: Arc<BackupState>,
    options: BackupOptions,
}

impl StreamingCursor {
    /// Options the backup was opened with.
    #[must_use]
    pub fn options(&self) -> &BackupOptions {
        &self.options
    }

    /// Returns the next batch of at most `batch_size` blocks. An empty batch
    /// means every file has been listed.
    pub fn get_next_batch(&self, batch_size: usize) -> CoreResult<Vec<BackupBlock>> {
        self.state.next_batch(batch_size)
    }
}

impl std::fmt::Debug for StreamingCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingCursor")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Opens, extends and ends backups of the data engine.
pub struct BackupCoordinator {
    engine: Arc<dyn KvEngine>,
    checkpoints: Arc<CheckpointCoordinator>,
    size_storer: Arc<SizeStorer>,
    key_store: Option<Arc<EncryptionKeyStore>>,
    state: Arc<BackupState>,
    ephemeral: bool,
}

impl BackupCoordinator {
    /// Creates a coordinator.
    pub fn new(
        engine: Arc<dyn KvEngine>,
        checkpoints: Arc<CheckpointCoordinator>,
        size_storer: Arc<SizeStorer>,
        key_store: Option<Arc<EncryptionKeyStore>>,
    ) -> Self {
        let state = Arc::new(BackupState::new(engine.home()));
        let ephemeral = checkpoints.timestamps().is_ephemeral();
        Self {
            engine,
            checkpoints,
            size_storer,
            key_store,
            state,
            ephemeral,
        }
    }

    fn check_durable(&self) -> CoreResult<()> {
        if self.ephemeral {
            return Err(CoreError::invalid_operation(
                "Cannot open backup cursor with in-memory mode",
            ));
        }
        Ok(())
    }

    /// Returns true while a backup cursor is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// Opens a non-blocking backup.
    ///
    /// With `disable_incremental`, incremental tracking is discarded through
    /// [`Self::disable_incremental_backup`] and no cursor is returned.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` on an ephemeral engine, `InvalidArgument` when the
    /// options ask for both an incremental backup and its disabling.
    pub fn begin_non_blocking_backup(
        &self,
        options: BackupOptions,
    ) -> CoreResult<Option<StreamingCursor>> {
        self.check_durable()?;
        options.validate()?;
        if options.disable_incremental {
            self.disable_incremental_backup()?;
            return Ok(None);
        }

        if self.state.is_open() {
            return Err(CoreError::BackupInProgress);
        }
        let pinned = self.checkpoints.pin_oplog_for_backup();
        let opened = self
            .size_storer
            .flush(true)
            .and_then(|()| self.state.open(self.engine.as_ref(), &options));
        if let Err(e) = opened {
            if !matches!(e, CoreError::BackupInProgress) {
                self.checkpoints.clear_backup_pin();
            }
            return Err(e);
        }

        info!(
            incremental = options.incremental,
            this_id = ?options.this_backup_name,
            src_id = ?options.src_backup_name,
            oplog_pin = ?pinned.map(Timestamp::as_u64),
            "opened backup cursor"
        );
        Ok(Some(StreamingCursor {
            state: Arc::clone(&self.state),
            options,
        }))
    }

    /// Lists log files written since the backup began, skipping those the
    /// batches already returned.
    pub fn extend_backup_cursor(&self) -> CoreResult<Vec<PathBuf>> {
        self.check_durable()?;
        self.state.extend(|| self.size_storer.flush(true))
    }

    /// Stops incremental tracking. The force-stop cursor is closed before
    /// returning, so a new backup can begin right away.
    pub fn disable_incremental_backup(&self) -> CoreResult<()> {
        self.check_durable()?;
        self.state.force_stop(self.engine.as_ref())?;
        info!("incremental backup tracking disabled");
        Ok(())
    }

    /// Closes the backup and releases the oplog pin.
    pub fn end_non_blocking_backup(&self) {
        self.state.release(self.engine.is_shutting_down());
        self.checkpoints.clear_backup_pin();
        debug!("closed backup cursor");
    }

    /// Opens a plain backup session, holding the engine files immutable
    /// until [`Self::end_backup`].
    pub fn begin_backup(&self) -> CoreResult<()> {
        self.check_durable()?;
        self.state.open(self.engine.as_ref(), &BackupOptions::full())
    }

    /// Ends a plain backup session.
    pub fn end_backup(&self) {
        self.state.release(self.engine.is_shutting_down());
    }

    /// Copies every file of the data engine and the key store into `dest`.
    /// `interrupted` is polled while copying.
    pub fn hot_backup(&self, dest: &Path, interrupted: impl Fn() -> bool) -> CoreResult<()> {
        self.check_durable()?;
        if self.engine.is_shutting_down() {
            return Err(StorageError::ShuttingDown.into());
        }
        let mut backup = HotBackup::new(dest);
        backup.add_engine(self.engine.as_ref(), self.engine.home(), dest)?;
        if let Some(key_store) = &self.key_store {
            key_store.add_to_hot_backup(&mut backup, dest)?;
        }
        backup.add_metadata(self.engine.home(), dest)?;
        backup.copy(interrupted)
    }
}

impl std::fmt::Debug for BackupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupCoordinator")
            .field("home", &self.engine.home())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
