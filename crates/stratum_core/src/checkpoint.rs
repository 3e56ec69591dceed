//! Checkpoints, rollback to stable, and the oplog floors derived from them.

use crate::error::{CoreError, CoreResult};
use crate::fatal::{fatal, invariant};
use crate::keystore::EncryptionKeyStore;
use crate::size_storer::SizeStorer;
use crate::timestamp::TimestampController;
use crate::types::Timestamp;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stratum_storage::KvSession;
use tracing::{debug, info, warn};

/// Reports the start timestamp of the oldest transaction still active at
/// the given stable timestamp, or `None` if there is none.
pub type OldestActiveTransactionCallback =
    Box<dyn Fn(Timestamp) -> CoreResult<Option<Timestamp>> + Send + Sync>;

/// What a call to [`CheckpointCoordinator::checkpoint`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// No consistent data yet; checkpointed without timestamps.
    Unstable,
    /// Stable is behind initial data; nothing was checkpointed.
    Skipped,
    /// Stable checkpoint taken. `published` is the new crash-recovery
    /// floor, if one could be computed.
    Stable {
        /// Published crash-recovery floor.
        published: Option<Timestamp>,
    },
    /// A write conflict interrupted the checkpoint; the next cycle retries.
    Conflicted,
    /// Shutdown began while checkpointing.
    Abandoned,
}

/// Takes checkpoints and tracks how much oplog they still need.
pub struct CheckpointCoordinator {
    timestamps: Arc<TimestampController>,
    size_storer: Arc<SizeStorer>,
    session: Mutex<Box<dyn KvSession>>,
    key_store: RwLock<Option<Arc<EncryptionKeyStore>>>,
    oldest_active_callback: Mutex<Option<OldestActiveTransactionCallback>>,
    oplog_needed_for_crash_recovery: AtomicU64,
    pinned_oplog_timestamp: AtomicU64,
    oplog_pinned_by_backup: Mutex<Option<Timestamp>>,
}

impl CheckpointCoordinator {
    /// Creates a coordinator over the controller's engine.
    pub fn new(timestamps: Arc<TimestampController>, size_storer: Arc<SizeStorer>) -> CoreResult<Self> {
        let session = timestamps.engine().open_session()?;
        Ok(Self {
            timestamps,
            size_storer,
            session: Mutex::new(session),
            key_store: RwLock::new(None),
            oldest_active_callback: Mutex::new(None),
            oplog_needed_for_crash_recovery: AtomicU64::new(0),
            pinned_oplog_timestamp: AtomicU64::new(u64::MAX),
            oplog_pinned_by_backup: Mutex::new(None),
        })
    }

    /// Timestamp controller the checkpoints follow.
    #[must_use]
    pub fn timestamps(&self) -> &Arc<TimestampController> {
        &self.timestamps
    }

    /// Checkpoints `key_store` together with the data engine.
    pub fn attach_key_store(&self, key_store: Arc<EncryptionKeyStore>) {
        *self.key_store.write() = Some(key_store);
    }

    /// Stops checkpointing the key store.
    pub fn detach_key_store(&self) -> Option<Arc<EncryptionKeyStore>> {
        self.key_store.write().take()
    }

    /// Installs the oldest-active-transaction callback.
    pub fn set_oldest_active_transaction_callback(&self, callback: OldestActiveTransactionCallback) {
        *self.oldest_active_callback.lock() = Some(callback);
    }

    /// Takes a checkpoint of the data engine and the key store.
    ///
    /// # Panics
    ///
    /// Panics on any failure other than a write conflict or shutdown.
    pub fn checkpoint(&self) -> CheckpointOutcome {
        match self.try_checkpoint() {
            Ok(outcome) => outcome,
            Err(e) if e.is_write_conflict() => {
                warn!("checkpoint encountered a write conflict");
                CheckpointOutcome::Conflicted
            }
            Err(e) if e.is_shutdown() || self.timestamps.engine().is_shutting_down() => {
                debug!(error = %e, "checkpoint abandoned during shutdown");
                CheckpointOutcome::Abandoned
            }
            Err(e) => fatal(22347, format!("checkpoint failed: {e}")),
        }
    }

    fn try_checkpoint(&self) -> CoreResult<CheckpointOutcome> {
        let stable = self.timestamps.stable();
        let initial = self.timestamps.initial_data();

        let outcome = if initial <= Timestamp::ALLOW_UNSTABLE_CHECKPOINTS {
            self.session.lock().checkpoint("use_timestamp=false")?;
            debug!(initial_data = %initial, "completed unstable checkpoint");
            CheckpointOutcome::Unstable
        } else if stable < initial {
            debug!(
                stable = %stable,
                initial_data = %initial,
                "stable timestamp is behind the initial data timestamp, skipping a checkpoint"
            );
            CheckpointOutcome::Skipped
        } else {
            let needed = self.oplog_needed_for_rollback();
            debug!(stable = %stable, "performing stable checkpoint");
            self.session.lock().checkpoint("use_timestamp=true")?;

            let published = match needed {
                Ok(ts) => {
                    self.oplog_needed_for_crash_recovery
                        .store(ts.as_u64(), Ordering::SeqCst);
                    Some(ts)
                }
                Err(_) => None,
            };
            CheckpointOutcome::Stable { published }
        };

        let key_store = self.key_store.read().clone();
        if let Some(key_store) = key_store {
            key_store.checkpoint()?;
        }
        Ok(outcome)
    }

    /// Oplog a rollback to the current stable timestamp would replay from.
    pub fn oplog_needed_for_rollback(&self) -> CoreResult<Timestamp> {
        let stable = self.timestamps.stable();
        let callback = self.oldest_active_callback.lock();
        let oldest_active = match callback.as_ref() {
            Some(callback) => callback(stable).map_err(|e| {
                debug!(error = %e, "getting oldest active transaction timestamp");
                e
            })?,
            None => None,
        };
        Ok(oldest_active.map_or(stable, |ts| ts.min(stable)))
    }

    /// Oplog crash recovery from the last checkpoint needs. `None` for
    /// ephemeral and read-only engines.
    #[must_use]
    pub fn oplog_needed_for_crash_recovery(&self) -> Option<Timestamp> {
        if self.timestamps.is_ephemeral() || self.timestamps.is_read_only() {
            return None;
        }
        Some(Timestamp::from_u64(
            self.oplog_needed_for_crash_recovery.load(Ordering::SeqCst),
        ))
    }

    /// Earliest oplog entry that must not be truncated.
    #[must_use]
    pub fn pinned_oplog(&self) -> Timestamp {
        let pinned = Timestamp::from_u64(self.pinned_oplog_timestamp.load(Ordering::SeqCst));

        if let Some(backup) = *self.oplog_pinned_by_backup.lock() {
            return backup.min(pinned);
        }

        let crash_recovery = self.oplog_needed_for_crash_recovery();
        if !self.timestamps.keeps_data_history() {
            return crash_recovery.unwrap_or(Timestamp::MAX).min(pinned);
        }
        if let Some(ts) = crash_recovery {
            return ts.min(pinned);
        }

        // Truncate nothing if the rollback floor is unknown.
        self.oplog_needed_for_rollback().unwrap_or(Timestamp::MIN)
    }

    /// Keeps oplog back to `ts` regardless of checkpoints.
    pub fn set_pinned_oplog_timestamp(&self, ts: Timestamp) {
        self.pinned_oplog_timestamp.store(ts.as_u64(), Ordering::SeqCst);
    }

    /// Pins the oplog at the current crash-recovery floor for a backup.
    pub fn pin_oplog_for_backup(&self) -> Option<Timestamp> {
        let floor = self.oplog_needed_for_crash_recovery();
        *self.oplog_pinned_by_backup.lock() = floor;
        floor
    }

    /// Releases the backup oplog pin.
    pub fn clear_backup_pin(&self) {
        *self.oplog_pinned_by_backup.lock() = None;
    }

    /// Discards every update newer than the stable timestamp.
    ///
    /// # Panics
    ///
    /// Panics when the engine keeps no history, or when the initial data
    /// timestamp was never set.
    pub fn rollback_to_stable(&self) -> CoreResult<Timestamp> {
        invariant(self.timestamps.keeps_data_history(), 50665, || {
            "the engine is configured to not support recover to a stable timestamp".to_string()
        });

        let stable = self.timestamps.stable();
        let initial = self.timestamps.initial_data();
        invariant(initial > Timestamp::ALLOW_UNSTABLE_CHECKPOINTS, 50666, || {
            format!("rollback requires an initial data timestamp, found {initial}")
        });
        if stable < initial {
            return Err(CoreError::UnrecoverableRollback {
                stable,
                initial_data: initial,
            });
        }

        debug!("syncing size storer to disk before rollback");
        self.size_storer.flush(true)?;

        info!(stable = %stable, initial_data = %initial, "rolling back to the stable timestamp");
        self.timestamps
            .engine()
            .rollback_to_stable()
            .map_err(|source| CoreError::RollbackFailed { stable, source })?;

        self.timestamps.reset_highest_seen_durable(stable);
        self.size_storer.reset()?;
        Ok(stable)
    }

    /// Flushes cached sizes and checkpoints everything. No-op for ephemeral
    /// engines.
    pub fn flush_all_files(&self) -> CoreResult<Option<CheckpointOutcome>> {
        if self.timestamps.is_ephemeral() {
            return Ok(None);
        }
        self.size_storer.flush(false)?;
        Ok(Some(self.checkpoint()))
    }
}

impl std::fmt::Debug for CheckpointCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointCoordinator")
            .field("timestamps", &self.timestamps)
            .field("pinned_oplog", &self.pinned_oplog())
            .finish_non_exhaustive()
    }
}
