//! Engine open with metadata salvage, table repair, and the drop queue.

use crate::error::{CoreError, CoreResult};
use crate::fatal::invariant;
use crate::fs_util::fsync_rename;
use crate::size_storer::SizeStorer;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratum_storage::{KvEngine, KvSession, StorageError, StorageResult};
use tracing::{debug, error, info, warn};

const TABLE_URI_PREFIX: &str = "table:";
const DROP_CONFIG: &str = "force,checkpoint_wait=false";
const DROPS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Logged when metadata is damaged and repair mode is off.
pub const REPAIR_HINT: &str = "Please read the documentation for starting the server with \
    --repair: metadata corruption was detected and the engine cannot start without salvage";

/// An engine returned by [`open_with_repair`].
pub struct OpenedEngine {
    /// The opened engine.
    pub engine: Arc<dyn KvEngine>,
    /// Whether the engine only opened after salvaging its metadata.
    pub modified_by_repair: bool,
}

impl std::fmt::Debug for OpenedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedEngine")
            .field("home", &self.engine.home())
            .field("modified_by_repair", &self.modified_by_repair)
            .finish()
    }
}

/// Opens an engine with `open`, retrying with `salvage=true` in repair mode.
///
/// # Errors
///
/// [`CoreError::EngineOpen`] when the engine cannot be opened, or when
/// salvage also fails.
pub fn open_with_repair<F>(config: &str, repair: bool, mut open: F) -> CoreResult<OpenedEngine>
where
    F: FnMut(&str) -> StorageResult<Arc<dyn KvEngine>>,
{
    let err = match open(config) {
        Ok(engine) => {
            return Ok(OpenedEngine {
                engine,
                modified_by_repair: false,
            })
        }
        Err(e) => e,
    };

    warn!(error = %err, "failed to start up the storage engine");
    if matches!(err, StorageError::TrySalvage) {
        warn!("engine metadata corruption detected");
        if !repair {
            error!("{REPAIR_HINT}");
            return Err(CoreError::engine_open(REPAIR_HINT));
        }
    }
    if !repair {
        return Err(CoreError::engine_open(format!("Terminating. {err}")));
    }

    warn!("attempting to salvage engine metadata");
    let salvage_config = if config.is_empty() {
        String::from("salvage=true")
    } else {
        format!("{config},salvage=true")
    };
    match open(&salvage_config) {
        Ok(engine) => {
            info!("engine metadata salvaged");
            Ok(OpenedEngine {
                engine,
                modified_by_repair: true,
            })
        }
        Err(e) => Err(CoreError::engine_open(format!(
            "Failed to salvage engine metadata: {e}"
        ))),
    }
}

/// Result of checking a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The table verified cleanly, or could not be verified because it was
    /// in use.
    Verified,
    /// The table was salvaged; some data may have been lost.
    Salvaged,
    /// The table was recreated empty.
    Rebuilt,
}

impl RepairOutcome {
    /// Whether repair changed user data.
    #[must_use]
    pub fn modified_data(self) -> bool {
        !matches!(self, Self::Verified)
    }
}

/// Verifies, salvages and rebuilds tables.
pub struct RepairManager {
    engine: Arc<dyn KvEngine>,
    repair_mode: bool,
    ephemeral: bool,
}

impl RepairManager {
    /// Creates a repair manager.
    pub fn new(engine: Arc<dyn KvEngine>, repair_mode: bool, ephemeral: bool) -> Self {
        Self {
            engine,
            repair_mode,
            ephemeral,
        }
    }

    /// Repairs the table backing `ident`.
    pub fn repair_ident(&self, ident: &str) -> CoreResult<RepairOutcome> {
        if self.ephemeral {
            return Ok(RepairOutcome::Verified);
        }
        self.salvage_if_needed(&format!("{TABLE_URI_PREFIX}{ident}"))
    }

    /// Verifies `uri`, salvaging or rebuilding it when verification fails.
    pub fn salvage_if_needed(&self, uri: &str) -> CoreResult<RepairOutcome> {
        let mut session = self.engine.open_session()?;

        match session.verify(uri) {
            Ok(()) => {
                info!(uri, "verify succeeded, not salvaging");
                return Ok(RepairOutcome::Verified);
            }
            Err(StorageError::Busy) => {
                error!(
                    uri,
                    "verify failed with EBUSY; the table was in use and no repair is \
                     necessary unless other errors are reported"
                );
                return Ok(RepairOutcome::Verified);
            }
            Err(StorageError::NoEntry) => {
                warn!(uri, "data file is missing, dropping and recreating the table");
                return self.rebuild(session.as_mut(), uri);
            }
            Err(e) => info!(uri, error = %e, "verify failed, running a salvage operation"),
        }

        match session.salvage(uri) {
            Ok(()) => {
                warn!(uri, "salvaged data");
                Ok(RepairOutcome::Salvaged)
            }
            Err(e) => {
                warn!(
                    uri,
                    error = %e,
                    "salvage failed, moving the file aside and creating a new table"
                );
                self.rebuild(session.as_mut(), uri)
            }
        }
    }

    fn rebuild(&self, session: &mut dyn KvSession, uri: &str) -> CoreResult<RepairOutcome> {
        invariant(self.repair_mode, 22360, || {
            format!("rebuilding {uri} requires repair mode")
        });
        let Some(ident) = uri.strip_prefix(TABLE_URI_PREFIX) else {
            return Err(CoreError::invalid_argument(format!(
                "cannot rebuild {uri}: not a table"
            )));
        };

        let file = self.engine.home().join(format!("{ident}.wt"));
        if file.exists() {
            let corrupt = self.engine.home().join(format!("{ident}.wt.corrupt"));
            warn!(file = %file.display(), backup = %corrupt.display(), "moving data file to backup");
            fsync_rename(&file, &corrupt)?;
        }

        warn!(ident, "rebuilding ident");
        let metadata = session.table_metadata(uri).map_err(|e| {
            error!(uri, error = %e, "rebuilding ident failed: failed to get metadata");
            e
        })?;
        session.drop_table(uri, "").map_err(|e| {
            error!(uri, error = %e, "rebuilding ident failed: failed to drop");
            e
        })?;
        session.create(uri, &metadata).map_err(|e| {
            error!(uri, config = %metadata, error = %e, "rebuilding ident failed: failed to create");
            e
        })?;
        Ok(RepairOutcome::Rebuilt)
    }
}

impl std::fmt::Debug for RepairManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairManager")
            .field("home", &self.engine.home())
            .field("repair_mode", &self.repair_mode)
            .finish_non_exhaustive()
    }
}

/// Runs once a queued table is gone.
pub type DropCallback = Box<dyn FnOnce() + Send>;

struct QueuedDrop {
    uri: String,
    on_drop: Option<DropCallback>,
}

/// Table drops that were refused with EBUSY and are retried later.
pub struct DropQueue {
    engine: Arc<dyn KvEngine>,
    size_storer: Option<Arc<SizeStorer>>,
    queue: Mutex<VecDeque<QueuedDrop>>,
    last_checked: Mutex<Option<Instant>>,
}

impl DropQueue {
    /// Creates an empty queue.
    pub fn new(engine: Arc<dyn KvEngine>, size_storer: Option<Arc<SizeStorer>>) -> Self {
        Self {
            engine,
            size_storer,
            queue: Mutex::new(VecDeque::new()),
            last_checked: Mutex::new(None),
        }
    }

    /// Drops `uri` now, or queues it if the table is busy. A table that is
    /// already gone counts as dropped.
    pub fn drop_ident(&self, uri: &str, on_drop: Option<DropCallback>) -> CoreResult<()> {
        let mut session = self.engine.open_session()?;
        let result = session.drop_table(uri, DROP_CONFIG);
        debug!(uri, ok = result.is_ok(), "drop");

        match result {
            Err(StorageError::Busy) => {
                self.queue.lock().push_front(QueuedDrop {
                    uri: uri.to_string(),
                    on_drop,
                });
                Ok(())
            }
            Ok(()) | Err(StorageError::NoEntry) => self.finish(uri, on_drop),
            Err(e) => Err(e.into()),
        }
    }

    /// Retries up to `max(10, len / 10)` queued drops. Tables still busy go
    /// to the back of the queue. Returns how many were dropped.
    pub fn drop_some_queued(&self) -> CoreResult<usize> {
        let in_queue = self.queue.lock().len();
        let to_delete = (in_queue / 10).max(10);
        debug!(in_queue, to_delete, "attempting to drop queued tables");

        let mut session = self.engine.open_session()?;
        let mut dropped = 0;
        for _ in 0..to_delete {
            let Some(queued) = self.queue.lock().pop_front() else {
                break;
            };
            match session.drop_table(&queued.uri, DROP_CONFIG) {
                Err(StorageError::Busy) => self.queue.lock().push_back(queued),
                Ok(()) | Err(StorageError::NoEntry) => {
                    self.finish(&queued.uri, queued.on_drop)?;
                    dropped += 1;
                }
                Err(e) => {
                    self.queue.lock().push_back(queued);
                    return Err(e.into());
                }
            }
        }
        Ok(dropped)
    }

    /// Whether drops are queued. Checks at most once per second and reports
    /// `false` in between, or when the queue is contended.
    #[must_use]
    pub fn have_drops_queued(&self) -> bool {
        let now = Instant::now();
        {
            let mut last = self.last_checked.lock();
            if last.is_some_and(|at| now.duration_since(at) < DROPS_CHECK_INTERVAL) {
                return false;
            }
            *last = Some(now);
        }
        self.queue.try_lock().is_some_and(|queue| !queue.is_empty())
    }

    /// Number of queued drops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn finish(&self, uri: &str, on_drop: Option<DropCallback>) -> CoreResult<()> {
        if let Some(sizes) = &self.size_storer {
            sizes.remove(uri)?;
        }
        if let Some(callback) = on_drop {
            callback();
        }
        Ok(())
    }
}

impl std::fmt::Debug for DropQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropQueue")
            .field("queued", &self.len())
            .finish_non_exhaustive()
    }
}
