//! Storage engine facade.
//!
//! [`StorageEngine::open`] brings the layer up in a fixed order:
//!
//! 1. the key store, which may run a master key rotation and stop there
//! 2. the data engine, salvaged in repair mode if its metadata is damaged
//! 3. the size storer, timestamps, checkpoints, backups and drop queue
//!
//! [`StorageEngine::shutdown`] undoes it: close any backup, checkpoint both
//! engines, then close the key store and the data engine.

use crate::backup::BackupCoordinator;
use crate::checkpoint::CheckpointCoordinator;
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::keystore::{
    open_key_store, EncryptionHooks, EncryptionKeyStore, KeyEvictionListener, KeyProvider,
    KeyStoreContext, KeyStoreOpen, KeyStoreRegistry, RotationOutcome, SecretService,
};
use crate::repair::{open_with_repair, DropQueue, RepairManager};
use crate::size_storer::{SizeStorer, SIZE_STORER_URI};
use crate::timestamp::TimestampController;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stratum_storage::{KvEngine, LogEngine, MemoryEngine, StorageError, StorageResult};
use tracing::{debug, error, info, warn};

/// Services shared by every engine a process opens.
#[derive(Clone)]
pub struct EngineServices {
    registry: Arc<KeyStoreRegistry>,
    secrets: Option<Arc<dyn SecretService>>,
}

impl Default for EngineServices {
    fn default() -> Self {
        Self {
            registry: KeyStoreRegistry::new(),
            secrets: None,
        }
    }
}

impl EngineServices {
    /// Creates services with a private registry and no secret service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the secret service holding master keys.
    #[must_use]
    pub fn secret_service(mut self, secrets: Arc<dyn SecretService>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Shares `registry` instead of a private one.
    #[must_use]
    pub fn registry(mut self, registry: Arc<KeyStoreRegistry>) -> Self {
        self.registry = registry;
        self
    }

    fn key_store_context(&self, config: &EngineConfig) -> Option<KeyStoreContext> {
        let encryption = config.encryption.clone()?;
        let mut ctx = KeyStoreContext::new(encryption).registry(Arc::clone(&self.registry));
        if let Some(secrets) = &self.secrets {
            ctx = ctx.secret_service(Arc::clone(secrets));
        }
        Some(ctx)
    }
}

impl std::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServices")
            .field("registry", &self.registry)
            .field("secrets", &self.secrets.is_some())
            .finish()
    }
}

/// Result of [`StorageEngine::open`].
#[derive(Debug)]
pub enum OpenOutcome {
    /// The engine is up.
    Ready(Box<StorageEngine>),
    /// A master key rotation ran; nothing else was opened and the process
    /// should restart without requesting rotation.
    RestartRequired(RotationOutcome),
}

impl OpenOutcome {
    /// The engine, or `None` after a rotation.
    #[must_use]
    pub fn ready(self) -> Option<StorageEngine> {
        match self {
            Self::Ready(engine) => Some(*engine),
            Self::RestartRequired(_) => None,
        }
    }
}

/// Configuration string the data engine is opened with.
#[must_use]
pub fn engine_config_string(config: &EngineConfig) -> String {
    let mut parts = vec!["create"];
    if config.ephemeral {
        parts.push("in_memory=true");
    }
    if config.read_only {
        parts.push("readonly=true");
    }
    parts.push("transaction_sync=(enabled=true)");
    parts.join(",")
}

/// The data engine with every consistency component wired to it.
pub struct StorageEngine {
    config: EngineConfig,
    engine: Arc<dyn KvEngine>,
    timestamps: Arc<TimestampController>,
    size_storer: Arc<SizeStorer>,
    checkpoints: Arc<CheckpointCoordinator>,
    backups: BackupCoordinator,
    repair: RepairManager,
    drops: DropQueue,
    key_store: Mutex<Option<Arc<EncryptionKeyStore>>>,
    hooks: Option<Arc<EncryptionHooks>>,
    modified_by_repair: bool,
    shut_down: AtomicBool,
}

impl StorageEngine {
    /// Opens the layer over the engine returned by `open_engine`.
    ///
    /// `open_engine` receives [`engine_config_string`], with `salvage=true`
    /// appended when repair mode retries a damaged engine.
    ///
    /// # Errors
    ///
    /// - key store errors, including [`CoreError::RotationDirectoryExists`]
    /// - [`CoreError::EngineOpen`] if the data engine cannot be opened
    /// - storage errors while reading persisted timestamps or sizes
    pub fn open<F>(
        config: EngineConfig,
        services: &EngineServices,
        open_engine: F,
    ) -> CoreResult<OpenOutcome>
    where
        F: FnMut(&str) -> StorageResult<Arc<dyn KvEngine>>,
    {
        let key_store = match services.key_store_context(&config) {
            Some(ctx) => match open_key_store(&config.path, &ctx)? {
                KeyStoreOpen::Ready(store) => Some(Arc::new(store)),
                KeyStoreOpen::RestartRequired(outcome) => {
                    info!("{outcome}");
                    return Ok(OpenOutcome::RestartRequired(outcome));
                }
            },
            None => None,
        };

        let opened = open_with_repair(&engine_config_string(&config), config.repair, open_engine)?;
        let engine = opened.engine;
        let mut modified_by_repair = opened.modified_by_repair;

        let repair = RepairManager::new(Arc::clone(&engine), config.repair, config.ephemeral);
        if config.repair && !config.ephemeral && has_table(engine.as_ref(), SIZE_STORER_URI)? {
            modified_by_repair |= repair.salvage_if_needed(SIZE_STORER_URI)?.modified_data();
        }

        let size_storer = Arc::new(SizeStorer::open(&engine)?);
        let timestamps = Arc::new(TimestampController::open(Arc::clone(&engine), &config)?);
        let checkpoints = Arc::new(CheckpointCoordinator::new(
            Arc::clone(&timestamps),
            Arc::clone(&size_storer),
        )?);

        let hooks = key_store.as_ref().map(|store| {
            checkpoints.attach_key_store(Arc::clone(store));
            let hooks = Arc::new(EncryptionHooks::new(
                Arc::clone(store) as Arc<dyn KeyProvider>
            ));
            let listener: Arc<dyn KeyEvictionListener> = Arc::clone(&hooks) as _;
            store.add_eviction_listener(&listener);
            hooks
        });

        let backups = BackupCoordinator::new(
            Arc::clone(&engine),
            Arc::clone(&checkpoints),
            Arc::clone(&size_storer),
            key_store.clone(),
        );
        let drops = DropQueue::new(Arc::clone(&engine), Some(Arc::clone(&size_storer)));

        info!(
            path = %config.path.display(),
            encrypted = key_store.is_some(),
            recovery = ?timestamps.recovery(),
            modified_by_repair,
            "storage engine started"
        );
        Ok(OpenOutcome::Ready(Box::new(Self {
            config,
            engine,
            timestamps,
            size_storer,
            checkpoints,
            backups,
            repair,
            drops,
            key_store: Mutex::new(key_store),
            hooks,
            modified_by_repair,
            shut_down: AtomicBool::new(false),
        })))
    }

    /// Opens the layer over an in-memory engine.
    pub fn open_memory(
        config: EngineConfig,
        services: &EngineServices,
        engine: MemoryEngine,
    ) -> CoreResult<OpenOutcome> {
        Self::open(config, services, move |_| {
            Ok(Arc::new(engine.clone()) as Arc<dyn KvEngine>)
        })
    }

    /// Opens the layer over a [`LogEngine`] in the data directory.
    pub fn open_durable(config: EngineConfig, services: &EngineServices) -> CoreResult<OpenOutcome> {
        let path = config.path.clone();
        Self::open(config, services, move |engine_config| {
            Ok(Arc::new(LogEngine::open_with_config(&path, engine_config)?) as Arc<dyn KvEngine>)
        })
    }

    /// Configuration the engine was opened with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Data engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn KvEngine> {
        &self.engine
    }

    /// Timestamp controller.
    #[must_use]
    pub fn timestamps(&self) -> &Arc<TimestampController> {
        &self.timestamps
    }

    /// Size cache.
    #[must_use]
    pub fn size_storer(&self) -> &Arc<SizeStorer> {
        &self.size_storer
    }

    /// Checkpoint coordinator.
    #[must_use]
    pub fn checkpoints(&self) -> &Arc<CheckpointCoordinator> {
        &self.checkpoints
    }

    /// Backup coordinator.
    #[must_use]
    pub fn backups(&self) -> &BackupCoordinator {
        &self.backups
    }

    /// Table repair.
    #[must_use]
    pub fn repair(&self) -> &RepairManager {
        &self.repair
    }

    /// Queue of drops waiting on busy tables.
    #[must_use]
    pub fn drops(&self) -> &DropQueue {
        &self.drops
    }

    /// Key store, if encryption is enabled and the engine is running.
    #[must_use]
    pub fn key_store(&self) -> Option<Arc<EncryptionKeyStore>> {
        self.key_store.lock().clone()
    }

    /// Page encryption hooks over the key store.
    #[must_use]
    pub fn encryption_hooks(&self) -> Option<&Arc<EncryptionHooks>> {
        self.hooks.as_ref()
    }

    /// Whether opening the engine salvaged or rebuilt anything.
    #[must_use]
    pub fn modified_by_repair(&self) -> bool {
        self.modified_by_repair
    }

    /// Releases the startup pin once recovery has caught up.
    pub fn notify_startup_complete(&self) {
        self.timestamps.notify_startup_complete();
    }

    /// Deletes the data key of database `db`. Failures are logged, not
    /// returned; a missing key is not an error.
    pub fn drop_database_keys(&self, db: &str) {
        let Some(store) = self.key_store() else {
            return;
        };
        match store.delete_key_by_id(db) {
            Ok(()) => debug!(db, "dropped database key"),
            Err(e) => error!(db, error = %e, "failed to drop database key"),
        }
    }

    /// Applies `config` to the data engine and to the key store.
    pub fn reconfigure(&self, config: &str) -> CoreResult<()> {
        self.engine.reconfigure(config)?;
        if let Some(store) = self.key_store() {
            store.reconfigure(config)?;
        }
        Ok(())
    }

    /// Checkpoints both engines and closes them. Later calls do nothing.
    pub fn shutdown(&self) -> CoreResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(path = %self.config.path.display(), "shutting down storage engine");

        if self.backups.is_open() {
            warn!("closing a backup cursor left open at shutdown");
            self.backups.end_non_blocking_backup();
        }

        let flushed = if self.config.read_only {
            Ok(())
        } else {
            if let Err(e) = self.drops.drop_some_queued() {
                warn!(error = %e, "failed to drop queued tables at shutdown");
            }
            self.checkpoints.flush_all_files().map(|outcome| {
                debug!(?outcome, "final checkpoint");
            })
        };

        self.checkpoints.detach_key_store();
        let closed_keys = match self.key_store.lock().take() {
            Some(store) => store.close(),
            None => Ok(()),
        };
        let closed_engine = self.engine.close().map_err(CoreError::from);

        flushed.and(closed_keys).and(closed_engine)?;
        info!("storage engine shut down");
        Ok(())
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "failed to shut down storage engine");
        }
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("path", &self.config.path)
            .field("timestamps", &self.timestamps)
            .field("encrypted", &self.hooks.is_some())
            .field("modified_by_repair", &self.modified_by_repair)
            .finish_non_exhaustive()
    }
}

fn has_table(engine: &dyn KvEngine, uri: &str) -> CoreResult<bool> {
    let mut session = engine.open_session()?;
    match session.table_metadata(uri) {
        Ok(_) => Ok(true),
        Err(StorageError::NoEntry | StorageError::NotFound) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Whether `path` holds a key store, current or legacy.
#[must_use]
pub fn has_key_store(path: &Path) -> bool {
    path.join(crate::keystore::KEY_DB_DIR).is_dir()
        || path.join(crate::keystore::LEGACY_KEY_DB_DIR).is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncryptionConfig;
    use crate::keystore::{KeyStoreRole, MemorySecretService};
    use crate::types::Timestamp;
    use crate::timestamp::STARTUP_PIN;
    use tempfile::tempdir;

    fn encrypted(path: &Path) -> (EngineConfig, EngineServices) {
        let config = EngineConfig::new(path).encryption(EncryptionConfig::with_secret("master"));
        let services =
            EngineServices::new().secret_service(Arc::new(MemorySecretService::new()));
        (config, services)
    }

    fn ready(outcome: OpenOutcome) -> StorageEngine {
        match outcome {
            OpenOutcome::Ready(engine) => *engine,
            OpenOutcome::RestartRequired(outcome) => panic!("unexpected rotation: {outcome}"),
        }
    }

    #[test]
    fn config_string_reflects_modes() {
        assert_eq!(
            engine_config_string(&EngineConfig::default()),
            "create,transaction_sync=(enabled=true)"
        );
        let config = EngineConfig::default().ephemeral(true).read_only(true);
        assert_eq!(
            engine_config_string(&config),
            "create,in_memory=true,readonly=true,transaction_sync=(enabled=true)"
        );
    }

    #[test]
    fn plain_engine_checkpoints_on_shutdown() {
        let memory = MemoryEngine::new();
        let engine = ready(
            StorageEngine::open_memory(EngineConfig::default(), &EngineServices::new(), memory.clone())
                .unwrap(),
        );
        assert!(engine.key_store().is_none());
        assert!(engine.encryption_hooks().is_none());
        assert!(memory.has_table(SIZE_STORER_URI));

        engine.shutdown().unwrap();
        assert_eq!(memory.checkpoints().len(), 1);
        engine.shutdown().unwrap();
        assert_eq!(memory.checkpoints().len(), 1);
    }

    #[test]
    fn restart_from_checkpoint_holds_startup_pin() {
        let recovery = Timestamp::new(500, 0);
        let memory = MemoryEngine::new().with_recovery(recovery.as_u64(), 0);
        let engine = ready(
            StorageEngine::open_memory(EngineConfig::default(), &EngineServices::new(), memory)
                .unwrap(),
        );
        assert_eq!(engine.timestamps().stable(), recovery);
        assert!(engine.timestamps().pinned_requests().contains_key(STARTUP_PIN));
        engine.notify_startup_complete();
        assert!(engine.timestamps().pinned_requests().is_empty());
    }

    #[test]
    fn encrypted_engine_seals_pages_and_drops_keys() {
        let dir = tempdir().unwrap();
        let (config, services) = encrypted(dir.path());
        let engine = ready(
            StorageEngine::open_memory(config, &services, MemoryEngine::with_home(dir.path()))
                .unwrap(),
        );
        let hooks = Arc::clone(engine.encryption_hooks().unwrap());
        let sealed = hooks.encrypt("db1", b"page").unwrap();
        assert_eq!(hooks.decrypt("db1", &sealed).unwrap(), b"page");

        engine.drop_database_keys("db1");
        assert!(!hooks.is_cached("db1"));
        assert!(hooks.decrypt("db1", &sealed).is_err());
        engine.drop_database_keys("never-created");

        engine.shutdown().unwrap();
        assert!(engine.key_store().is_none());
        assert!(has_key_store(dir.path()));
    }

    #[test]
    fn key_store_role_is_released_on_shutdown() {
        let dir = tempdir().unwrap();
        let (config, services) = encrypted(dir.path());
        let engine = ready(
            StorageEngine::open_memory(config.clone(), &services, MemoryEngine::new()).unwrap(),
        );
        assert!(matches!(
            StorageEngine::open_memory(config.clone(), &services, MemoryEngine::new()),
            Err(CoreError::KeyStoreRoleTaken { role: "main" })
        ));

        drop(engine);
        assert!(!services.registry.is_registered(KeyStoreRole::Main));
        ready(StorageEngine::open_memory(config, &services, MemoryEngine::new()).unwrap());
    }

    #[test]
    fn rotation_stops_startup() {
        let dir = tempdir().unwrap();
        let (config, services) = encrypted(dir.path());
        let key = {
            let engine = ready(
                StorageEngine::open_memory(config.clone(), &services, MemoryEngine::new()).unwrap(),
            );
            engine.key_store().unwrap().get_key_by_id("db1").unwrap()
        };

        let mut rotate = config.clone();
        if let Some(encryption) = rotate.encryption.as_mut() {
            encryption.rotate_master_key = true;
        }
        let mut opened = false;
        let outcome = StorageEngine::open(rotate, &services, |_| {
            opened = true;
            Ok(Arc::new(MemoryEngine::new()) as Arc<dyn KvEngine>)
        })
        .unwrap();
        assert!(matches!(outcome, OpenOutcome::RestartRequired(_)));
        assert!(!opened);

        let engine = ready(StorageEngine::open_memory(config, &services, MemoryEngine::new()).unwrap());
        assert_eq!(engine.key_store().unwrap().get_key_by_id("db1").unwrap(), key);
    }

    #[test]
    fn damaged_metadata_needs_repair_mode() {
        let open = |config: &str| -> StorageResult<Arc<dyn KvEngine>> {
            if config.contains("salvage=true") {
                Ok(Arc::new(MemoryEngine::new()))
            } else {
                Err(StorageError::TrySalvage)
            }
        };

        assert!(matches!(
            StorageEngine::open(EngineConfig::default(), &EngineServices::new(), open),
            Err(CoreError::EngineOpen { .. })
        ));

        let engine = ready(
            StorageEngine::open(EngineConfig::default().repair(true), &EngineServices::new(), open)
                .unwrap(),
        );
        assert!(engine.modified_by_repair());
    }

    #[test]
    fn durable_engine_reopens() {
        let dir = tempdir().unwrap();
        let (config, services) = encrypted(dir.path());
        let key = {
            let engine = ready(StorageEngine::open_durable(config.clone(), &services).unwrap());
            engine.key_store().unwrap().get_key_by_id("db1").unwrap()
        };
        let engine = ready(StorageEngine::open_durable(config, &services).unwrap());
        assert_eq!(engine.key_store().unwrap().get_key_by_id("db1").unwrap(), key);
        assert!(engine.timestamps().recovery().is_none());
    }
}
