//! Timestamp state machine.
//!
//! Four markers drive consistency:
//!
//! - **stable**: everything committed at or before it is durable once a
//!   checkpoint completes
//! - **oldest**: history below it may be discarded; trails stable by the
//!   history window and never passes an active pin
//! - **initial data**: when the data set first became consistent
//! - **recovery**: the checkpoint the engine recovered from, read once
//!
//! Stable and oldest are published to the engine before the local copies
//! change, so the engine never lags what this controller reports.

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::fatal::{fatal, invariant};
use crate::types::Timestamp;
use crate::write_unit::WriteUnitOfWork;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stratum_storage::KvEngine;
use tracing::{debug, info, warn};

/// Service name of the pin held between engine open and startup completion.
pub const STARTUP_PIN: &str = "_startup";

/// Owns the stable, oldest, initial-data and recovery timestamps.
pub struct TimestampController {
    engine: Arc<dyn KvEngine>,
    keeps_history: bool,
    ephemeral: bool,
    read_only: bool,
    stable: AtomicU64,
    oldest: AtomicU64,
    initial_data: AtomicU64,
    recovery: Option<Timestamp>,
    history_window_secs: AtomicU64,
    /// Pin registry. Also serializes oldest transitions.
    pins: Mutex<BTreeMap<String, Timestamp>>,
    highest_seen_durable: Mutex<Timestamp>,
}

impl TimestampController {
    /// Reads the persisted timestamps from a freshly opened engine and runs
    /// the startup sequence.
    pub fn open(engine: Arc<dyn KvEngine>, config: &EngineConfig) -> CoreResult<Self> {
        let recovery = query(engine.as_ref(), "recovery")?.filter(|ts| !ts.is_null());
        let persisted_oldest = query(engine.as_ref(), "oldest")?.unwrap_or(Timestamp::NULL);

        let window = if config.ephemeral {
            0
        } else {
            config.history_window_secs
        };

        let controller = Self {
            engine,
            keeps_history: config.keeps_data_history(),
            ephemeral: config.ephemeral,
            read_only: config.read_only,
            stable: AtomicU64::new(0),
            oldest: AtomicU64::new(persisted_oldest.as_u64()),
            initial_data: AtomicU64::new(persisted_oldest.as_u64()),
            recovery,
            history_window_secs: AtomicU64::new(window),
            pins: Mutex::new(BTreeMap::new()),
            highest_seen_durable: Mutex::new(Timestamp::NULL),
        };

        if !persisted_oldest.is_null() {
            info!(oldest = %persisted_oldest, "found persisted oldest timestamp");
        }

        match recovery {
            None if !persisted_oldest.is_null() => {
                // An oldest timestamp without a stable checkpoint cannot be
                // honored; start from scratch.
                warn!(oldest = %persisted_oldest, "ignoring oldest timestamp without a recovery timestamp");
                controller.oldest.store(0, Ordering::SeqCst);
                controller.initial_data.store(0, Ordering::SeqCst);
            }
            Some(recovery) if !controller.read_only && !controller.ephemeral => {
                info!(recovery = %recovery, "recovering from stable checkpoint");
                if controller.initial_data().is_null() {
                    controller.set_initial_data(recovery);
                    controller.set_oldest(recovery, false)?;
                }
                controller.pin(STARTUP_PIN, controller.oldest(), false)?;
                controller.set_stable(recovery, false)?;
                *controller.highest_seen_durable.lock() = recovery;
            }
            _ => {}
        }

        Ok(controller)
    }

    /// Returns the engine the timestamps are published to.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn KvEngine> {
        &self.engine
    }

    /// Current stable timestamp.
    #[must_use]
    pub fn stable(&self) -> Timestamp {
        Timestamp::from_u64(self.stable.load(Ordering::SeqCst))
    }

    /// Current oldest timestamp.
    #[must_use]
    pub fn oldest(&self) -> Timestamp {
        Timestamp::from_u64(self.oldest.load(Ordering::SeqCst))
    }

    /// Current initial-data timestamp.
    #[must_use]
    pub fn initial_data(&self) -> Timestamp {
        Timestamp::from_u64(self.initial_data.load(Ordering::SeqCst))
    }

    /// Recovery timestamp read at startup.
    #[must_use]
    pub fn recovery(&self) -> Option<Timestamp> {
        self.recovery
    }

    /// Whether the engine keeps history back to stable.
    #[must_use]
    pub fn keeps_data_history(&self) -> bool {
        self.keeps_history
    }

    /// Whether the engine is ephemeral.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Whether the engine is read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// History window in seconds.
    #[must_use]
    pub fn history_window_secs(&self) -> u64 {
        self.history_window_secs.load(Ordering::SeqCst)
    }

    /// Changes the history window. Takes effect at the next stable update.
    pub fn set_history_window(&self, secs: u64) {
        self.history_window_secs.store(secs, Ordering::SeqCst);
    }

    /// Records when the data set became consistent.
    pub fn set_initial_data(&self, ts: Timestamp) {
        debug!(initial_data = %ts, "setting initial data timestamp");
        self.initial_data.store(ts.as_u64(), Ordering::SeqCst);
    }

    /// Advances the stable timestamp.
    ///
    /// Null is ignored, as is a backward move unless `force` is set. A forced
    /// update also moves oldest to `ts`.
    ///
    /// # Panics
    ///
    /// Panics when majority reads are enabled and an unforced `ts` is ahead
    /// of the engine's all-durable timestamp.
    pub fn set_stable(&self, ts: Timestamp, force: bool) -> CoreResult<()> {
        if ts.is_null() {
            return Ok(());
        }
        let current = self.stable();
        if !force && ts < current {
            debug!(requested = %ts, stable = %current, "ignoring backward stable timestamp");
            return Ok(());
        }

        let all_durable = query(self.engine.as_ref(), "all_durable")?.unwrap_or(Timestamp::MIN);
        if self.keeps_history && !force && !all_durable.is_null() && ts > all_durable {
            fatal(
                23985,
                format!("stable timestamp {ts} is ahead of all durable timestamp {all_durable}"),
            );
        }

        let hex = ts.to_hex();
        if force {
            self.engine.set_timestamp(&format!(
                "force=true,oldest_timestamp={hex},commit_timestamp={hex},stable_timestamp={hex}"
            ))?;
            let _pins = self.pins.lock();
            *self.highest_seen_durable.lock() = Timestamp::NULL;
            self.oldest.store(ts.as_u64(), Ordering::SeqCst);
            self.stable.store(ts.as_u64(), Ordering::SeqCst);
            info!(stable = %ts, "forced stable and oldest timestamps");
            return Ok(());
        }

        self.engine.set_timestamp(&format!("stable_timestamp={hex}"))?;
        self.stable.fetch_max(ts.as_u64(), Ordering::SeqCst);
        self.set_oldest_from_stable()
    }

    /// Moves oldest toward `ts`, holding it at the earliest active pin.
    ///
    /// # Panics
    ///
    /// Panics when a pin is below the current oldest, or when `force` is set
    /// while pins exist.
    pub fn set_oldest(&self, ts: Timestamp, force: bool) -> CoreResult<()> {
        let pins = self.pins.lock();
        let current = self.oldest();

        let mut target = ts;
        for (service, pinned) in pins.iter() {
            invariant(*pinned >= current, 5380101, || {
                format!("pin {service} at {pinned} is behind oldest {current}")
            });
            target = target.min(*pinned);
        }

        let hex = target.to_hex();
        if force {
            invariant(pins.is_empty(), 5380102, || {
                format!("cannot force oldest while {} pins are active", pins.len())
            });
            self.engine.set_timestamp(&format!(
                "force=true,oldest_timestamp={hex},commit_timestamp={hex}"
            ))?;
            self.oldest.store(target.as_u64(), Ordering::SeqCst);
            *self.highest_seen_durable.lock() = Timestamp::NULL;
            info!(oldest = %target, "forced oldest timestamp");
            return Ok(());
        }

        self.engine.set_timestamp(&format!("oldest_timestamp={hex}"))?;
        if target > current {
            self.oldest.store(target.as_u64(), Ordering::SeqCst);
            debug!(oldest = %target, "advanced oldest timestamp");
        }
        Ok(())
    }

    /// Computes where oldest should move given the current stable timestamp
    /// and history window. `None` means oldest stays put.
    #[must_use]
    pub fn derive_oldest_from_stable(&self) -> Option<Timestamp> {
        let stable = self.stable();
        let window = self.history_window_secs();
        let secs = u64::from(stable.secs());
        if secs < window {
            return None;
        }

        let candidate = Timestamp::new((secs - window) as u32, stable.inc());
        if candidate <= self.oldest() {
            return None;
        }
        let initial = self.initial_data();
        if candidate <= initial {
            return Some(initial);
        }
        Some(candidate)
    }

    /// Forwards [`Self::derive_oldest_from_stable`] to [`Self::set_oldest`].
    pub fn set_oldest_from_stable(&self) -> CoreResult<()> {
        match self.derive_oldest_from_stable() {
            Some(ts) => self.set_oldest(ts, false),
            None => Ok(()),
        }
    }

    /// Holds oldest at or below `requested` on behalf of `service`.
    ///
    /// A request below the current oldest is rounded up when `round_up` is
    /// set and rejected with [`CoreError::SnapshotTooOld`] otherwise. A
    /// service holds at most one pin; pinning again replaces it.
    pub fn pin(&self, service: &str, requested: Timestamp, round_up: bool) -> CoreResult<Timestamp> {
        let mut pins = self.pins.lock();
        self.pin_locked(&mut pins, service, requested, round_up)
    }

    /// Like [`Self::pin`], but undoes the pin if `unit` rolls back: the
    /// previous pin for `service` is restored, or the pin removed if there
    /// was none.
    pub fn pin_in_unit(
        self: &Arc<Self>,
        unit: &mut WriteUnitOfWork,
        service: &str,
        requested: Timestamp,
        round_up: bool,
    ) -> CoreResult<Timestamp> {
        let (previous, pinned) = {
            let mut pins = self.pins.lock();
            let previous = pins.get(service).copied();
            (previous, self.pin_locked(&mut pins, service, requested, round_up)?)
        };

        let controller = Arc::clone(self);
        let service = service.to_string();
        unit.on_rollback(move || match previous {
            None => controller.unpin(&service),
            Some(previous) => {
                if let Err(e) = controller.pin(&service, previous, true) {
                    warn!(service = %service, error = %e, "failed to restore pin");
                }
            }
        });
        Ok(pinned)
    }

    fn pin_locked(
        &self,
        pins: &mut BTreeMap<String, Timestamp>,
        service: &str,
        requested: Timestamp,
        round_up: bool,
    ) -> CoreResult<Timestamp> {
        let oldest = self.oldest();
        let pinned = if requested < oldest {
            if !round_up {
                return Err(CoreError::SnapshotTooOld { requested, oldest });
            }
            oldest
        } else {
            requested
        };
        pins.insert(service.to_string(), pinned);
        debug!(service, requested = %requested, pinned = %pinned, "pinned oldest timestamp");
        Ok(pinned)
    }

    /// Removes the pin held by `service`, if any.
    pub fn unpin(&self, service: &str) {
        match self.pins.lock().remove(service) {
            Some(ts) => debug!(service, pinned = %ts, "unpinned oldest timestamp"),
            None => debug!(service, "no pin to remove"),
        }
    }

    /// Snapshot of the active pins.
    #[must_use]
    pub fn pinned_requests(&self) -> BTreeMap<String, Timestamp> {
        self.pins.lock().clone()
    }

    /// Releases the startup pin.
    pub fn notify_startup_complete(&self) {
        self.unpin(STARTUP_PIN);
    }

    /// Engine all-durable timestamp, never lower than a value already
    /// returned since the last forced update.
    pub fn all_durable(&self) -> CoreResult<Timestamp> {
        let reported = query(self.engine.as_ref(), "all_durable")?.unwrap_or(Timestamp::MIN);
        let mut highest = self.highest_seen_durable.lock();
        if reported > *highest {
            *highest = reported;
        }
        Ok(*highest)
    }

    /// Sets the highest-seen durable cache.
    pub(crate) fn reset_highest_seen_durable(&self, ts: Timestamp) {
        *self.highest_seen_durable.lock() = ts;
    }

    /// Stable timestamp of the last completed checkpoint.
    pub fn checkpoint_timestamp(&self) -> CoreResult<Timestamp> {
        Ok(query(self.engine.as_ref(), "last_checkpoint")?.unwrap_or(Timestamp::NULL))
    }

    /// Timestamp a restart would recover to, if any.
    pub fn last_stable_recovery_timestamp(&self) -> CoreResult<Option<Timestamp>> {
        if self.ephemeral {
            let stable = self.stable();
            return Ok((stable >= self.initial_data()).then_some(stable));
        }
        let last = self.checkpoint_timestamp()?;
        if !last.is_null() {
            return Ok(Some(last));
        }
        Ok(self.recovery)
    }
}

impl std::fmt::Debug for TimestampController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampController")
            .field("stable", &self.stable())
            .field("oldest", &self.oldest())
            .field("initial_data", &self.initial_data())
            .field("recovery", &self.recovery)
            .field("history_window_secs", &self.history_window_secs())
            .finish_non_exhaustive()
    }
}

/// Queries `get=<name>`; absent values map to `None`.
fn query(engine: &dyn KvEngine, name: &str) -> CoreResult<Option<Timestamp>> {
    match engine.query_timestamp(&format!("get={name}")) {
        Ok(hex) => Ok(Some(Timestamp::from_hex(&hex)?)),
        Err(e) if e.is_absent() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;
    use stratum_storage::MemoryEngine;

    fn controller_with(engine: &MemoryEngine, config: &EngineConfig) -> TimestampController {
        TimestampController::open(Arc::new(engine.clone()), config).unwrap()
    }

    fn controller() -> (MemoryEngine, TimestampController) {
        let engine = MemoryEngine::new();
        let controller = controller_with(&engine, &EngineConfig::default());
        (engine, controller)
    }

    #[test]
    fn fresh_engine_starts_at_null() {
        let (engine, controller) = controller();
        assert!(controller.stable().is_null());
        assert!(controller.oldest().is_null());
        assert!(controller.recovery().is_none());
        assert!(engine.timestamp_log().is_empty());
    }

    #[test]
    fn stable_is_published_and_never_moves_backward() {
        let (engine, controller) = controller();
        controller.set_stable(Timestamp::new(10, 0), false).unwrap();
        controller.set_stable(Timestamp::new(5, 0), false).unwrap();
        controller.set_stable(Timestamp::NULL, false).unwrap();

        assert_eq!(controller.stable(), Timestamp::new(10, 0));
        assert_eq!(
            engine.timestamp_log(),
            vec![format!("stable_timestamp={}", Timestamp::new(10, 0).to_hex())]
        );
    }

    #[test]
    fn forced_stable_moves_both_markers() {
        let (engine, controller) = controller();
        controller.set_stable(Timestamp::new(1000, 0), false).unwrap();
        assert_eq!(controller.oldest(), Timestamp::new(700, 0));

        let target = Timestamp::new(400, 2);
        controller.set_stable(target, true).unwrap();
        assert_eq!(controller.stable(), target);
        assert_eq!(controller.oldest(), target);
        let hex = target.to_hex();
        assert_eq!(
            engine.timestamp_log().last().unwrap(),
            &format!("force=true,oldest_timestamp={hex},commit_timestamp={hex},stable_timestamp={hex}")
        );
    }

    #[test]
    #[should_panic(expected = "ahead of all durable")]
    fn stable_ahead_of_all_durable_is_fatal() {
        let (engine, controller) = controller();
        engine.set_all_durable(Timestamp::new(5, 0).as_u64());
        let _ = controller.set_stable(Timestamp::new(6, 0), false);
    }

    #[test]
    fn stable_ahead_of_all_durable_allowed_without_majority_reads() {
        let engine = MemoryEngine::new();
        engine.set_all_durable(Timestamp::new(5, 0).as_u64());
        let controller =
            controller_with(&engine, &EngineConfig::default().majority_read_concern(false));
        controller.set_stable(Timestamp::new(6, 0), false).unwrap();
        assert_eq!(controller.stable(), Timestamp::new(6, 0));
    }

    #[test]
    fn oldest_trails_stable_by_window() {
        let (_engine, controller) = controller();
        controller.set_stable(Timestamp::new(200, 3), false).unwrap();
        assert!(controller.oldest().is_null());

        controller.set_stable(Timestamp::new(1000, 3), false).unwrap();
        assert_eq!(controller.oldest(), Timestamp::new(700, 3));

        controller.set_history_window(100);
        controller.set_stable(Timestamp::new(1001, 0), false).unwrap();
        assert_eq!(controller.oldest(), Timestamp::new(901, 0));
    }

    #[test]
    fn derived_oldest_never_below_initial_data() {
        let (_engine, controller) = controller();
        controller.set_initial_data(Timestamp::new(800, 0));
        controller.set_stable(Timestamp::new(1000, 0), false).unwrap();
        assert_eq!(controller.oldest(), Timestamp::new(800, 0));
    }

    #[test]
    fn pin_below_oldest_is_rejected_or_rounded() {
        let (_engine, controller) = controller();
        controller.set_oldest(Timestamp::from_u64(50), false).unwrap();

        let err = controller
            .pin("backup", Timestamp::from_u64(10), false)
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::SnapshotTooOld { requested, oldest }
                if requested == Timestamp::from_u64(10) && oldest == Timestamp::from_u64(50)
        ));

        let pinned = controller
            .pin("backup", Timestamp::from_u64(10), true)
            .unwrap();
        assert_eq!(pinned, Timestamp::from_u64(50));
    }

    #[test]
    fn index_builder_pin_holds_oldest() {
        let (_engine, controller) = controller();
        controller.set_oldest(Timestamp::from_u64(50), false).unwrap();

        let pinned = controller
            .pin("indexBuilder", Timestamp::from_u64(100), false)
            .unwrap();
        assert_eq!(pinned, Timestamp::from_u64(100));

        controller.set_oldest(Timestamp::from_u64(150), false).unwrap();
        assert_eq!(controller.oldest(), Timestamp::from_u64(100));
        controller.set_oldest(Timestamp::from_u64(300), false).unwrap();
        assert_eq!(controller.oldest(), Timestamp::from_u64(100));

        controller.unpin("indexBuilder");
        controller.set_oldest(Timestamp::from_u64(300), false).unwrap();
        assert_eq!(controller.oldest(), Timestamp::from_u64(300));
    }

    #[test]
    fn unpin_unknown_service_is_noop() {
        let (_engine, controller) = controller();
        controller.unpin("nobody");
        assert!(controller.pinned_requests().is_empty());
    }

    #[test]
    #[should_panic(expected = "pins are active")]
    fn forced_oldest_with_pins_is_fatal() {
        let (_engine, controller) = controller();
        controller.pin("a", Timestamp::from_u64(5), false).unwrap();
        let _ = controller.set_oldest(Timestamp::from_u64(9), true);
    }

    #[test]
    fn pin_in_unit_rollback_restores_previous() {
        let (_engine, controller) = controller();
        let controller = Arc::new(controller);

        {
            let mut unit = WriteUnitOfWork::new();
            controller
                .pin_in_unit(&mut unit, "ttl", Timestamp::from_u64(7), false)
                .unwrap();
        }
        assert!(controller.pinned_requests().is_empty());

        controller.pin("ttl", Timestamp::from_u64(4), false).unwrap();
        {
            let mut unit = WriteUnitOfWork::new();
            controller
                .pin_in_unit(&mut unit, "ttl", Timestamp::from_u64(9), false)
                .unwrap();
        }
        assert_eq!(
            controller.pinned_requests().get("ttl"),
            Some(&Timestamp::from_u64(4))
        );

        let mut unit = WriteUnitOfWork::new();
        controller
            .pin_in_unit(&mut unit, "ttl", Timestamp::from_u64(12), false)
            .unwrap();
        unit.commit();
        assert_eq!(
            controller.pinned_requests().get("ttl"),
            Some(&Timestamp::from_u64(12))
        );
    }

    #[test]
    fn startup_from_recovery_pins_oldest() {
        let recovery = Timestamp::new(2000, 1);
        let engine = MemoryEngine::new().with_recovery(recovery.as_u64(), 0);
        let controller = controller_with(&engine, &EngineConfig::default());

        assert_eq!(controller.recovery(), Some(recovery));
        assert_eq!(controller.initial_data(), recovery);
        assert_eq!(controller.stable(), recovery);
        assert_eq!(controller.oldest(), recovery);
        assert_eq!(
            controller.pinned_requests().get(STARTUP_PIN),
            Some(&recovery)
        );
        assert_eq!(controller.all_durable().unwrap(), recovery);

        controller.notify_startup_complete();
        assert!(controller.pinned_requests().is_empty());
    }

    #[test]
    fn startup_with_persisted_oldest_keeps_it() {
        let recovery = Timestamp::new(2000, 0);
        let oldest = Timestamp::new(1500, 0);
        let engine = MemoryEngine::new().with_recovery(recovery.as_u64(), oldest.as_u64());
        let controller = controller_with(&engine, &EngineConfig::default());

        assert_eq!(controller.initial_data(), oldest);
        assert_eq!(controller.oldest(), oldest);
        assert_eq!(controller.pinned_requests().get(STARTUP_PIN), Some(&oldest));
    }

    #[test]
    fn oldest_without_recovery_is_discarded() {
        let engine = MemoryEngine::new().with_recovery(0, 77);
        let controller = controller_with(&engine, &EngineConfig::default());
        assert!(controller.oldest().is_null());
        assert!(controller.initial_data().is_null());
    }

    #[test]
    fn read_only_startup_publishes_nothing() {
        let engine = MemoryEngine::new().with_recovery(Timestamp::new(9, 0).as_u64(), 0);
        let controller = controller_with(&engine, &EngineConfig::default().read_only(true));
        assert!(controller.stable().is_null());
        assert!(engine.timestamp_log().is_empty());
    }

    #[test]
    fn all_durable_is_monotonic() {
        let (engine, controller) = controller();
        assert_eq!(controller.all_durable().unwrap(), Timestamp::MIN);
        engine.set_all_durable(40);
        assert_eq!(controller.all_durable().unwrap(), Timestamp::from_u64(40));
        engine.set_all_durable(30);
        assert_eq!(controller.all_durable().unwrap(), Timestamp::from_u64(40));
    }

    #[test]
    fn last_stable_recovery_timestamp_sources() {
        let engine = MemoryEngine::new().with_recovery(Timestamp::new(30, 0).as_u64(), 0);
        let controller = controller_with(&engine, &EngineConfig::default());
        assert_eq!(
            controller.last_stable_recovery_timestamp().unwrap(),
            Some(Timestamp::new(30, 0))
        );

        let engine = MemoryEngine::new();
        let controller = controller_with(&engine, &EngineConfig::default().ephemeral(true));
        controller.set_initial_data(Timestamp::new(5, 0));
        assert_eq!(controller.last_stable_recovery_timestamp().unwrap(), None);
        controller.set_stable(Timestamp::new(6, 0), false).unwrap();
        assert_eq!(
            controller.last_stable_recovery_timestamp().unwrap(),
            Some(Timestamp::new(6, 0))
        );
        assert_eq!(controller.oldest(), Timestamp::new(6, 0));
    }

    #[test]
    fn pins_hold_oldest_while_stable_races_ahead() {
        let engine = MemoryEngine::new();
        let controller = Arc::new(controller_with(
            &engine,
            &EngineConfig::default().history_window_secs(5),
        ));

        let advancing = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || {
                for secs in 1..=2_000 {
                    controller.set_stable(Timestamp::new(secs, 0), false).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|i| {
                let controller = Arc::clone(&controller);
                thread::spawn(move || {
                    let service = format!("reader{i}");
                    for _ in 0..500 {
                        let behind = controller.stable().secs().saturating_sub(8);
                        let requested = Timestamp::new(behind, 0);
                        let pinned = controller.pin(&service, requested, true).unwrap();
                        assert!(pinned >= requested);
                        assert!(controller.oldest() <= pinned);
                        controller.unpin(&service);
                    }
                })
            })
            .collect();

        advancing.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        assert!(controller.pinned_requests().is_empty());
        controller.set_oldest_from_stable().unwrap();
        assert_eq!(controller.oldest(), Timestamp::new(1_995, 0));
    }

    proptest! {
        #[test]
        fn unforced_stable_is_non_decreasing(updates in prop::collection::vec(0u64..1_000_000, 1..64)) {
            let (_engine, controller) = controller();
            let mut previous = controller.stable();
            for raw in updates {
                controller.set_stable(Timestamp::from_u64(raw), false).unwrap();
                let current = controller.stable();
                prop_assert!(current >= previous);
                previous = current;
            }
        }

        #[test]
        fn oldest_never_passes_a_pin(
            pins in prop::collection::vec(1u32..5_000, 1..6),
            stables in prop::collection::vec(1u32..10_000, 1..32),
        ) {
            let (_engine, controller) = controller();
            controller.set_history_window(0);
            for (i, secs) in pins.iter().enumerate() {
                controller.pin(&format!("svc{i}"), Timestamp::new(*secs, 0), true).unwrap();
            }
            for secs in stables {
                controller.set_stable(Timestamp::new(secs, 0), false).unwrap();
                let floor = controller.pinned_requests().values().copied().min().unwrap();
                prop_assert!(controller.oldest() <= floor);
                prop_assert!(controller.oldest() <= controller.stable());
            }
        }
    }
}
