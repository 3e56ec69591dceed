//! Encryption key store.
//!
//! The key store owns a dedicated [`LogEngine`] sealed under the master key.
//! It holds two tables:
//!
//! - `table:key`: namespace id to 32-byte data key
//! - `table:parameters`: `_gcm_iv_reserved`, the persisted nonce high-water
//!   mark
//!
//! # Nonces
//!
//! GCM nonces come from a `u128` counter. Before the counter passes the
//! persisted bound, the bound is raised by [`GCM_IV_RESERVE_BATCH`] and
//! written back. On restart the counter resumes at the bound, so a crash
//! burns at most one batch and never repeats a nonce.
//!
//! # Locking
//!
//! `iv` guards the counter and the pseudo-random generator; `handles`
//! guards the engine and its session. `iv` is always taken before
//! `handles`.

mod master_key;
mod provider;
mod registry;
mod rotation;
mod secret;

pub use master_key::{
    check_permissions, decode_master_key, encode_master_key, read_first_token, PROHIBITED_MODE,
    RELAXED_ROOT_PROHIBITED_MODE,
};
pub use provider::{EncryptionHooks, KeyEvictionListener, KeyProvider};
pub use registry::{KeyStoreContext, KeyStoreRegistry, KeyStoreRole, RoleGuard};
pub use rotation::{
    open_key_store, prepare_key_store_dir, rotate_master_key, KeyStoreOpen, RotationOutcome,
    KEY_DB_DIR, LEGACY_KEY_DB_DIR, ROTATED_DIR, ROTATION_DIR,
};
pub use secret::{DirectorySecretService, MemorySecretService, SecretService};

use crate::backup::{BackupBlock, BackupOptions, BackupState, HotBackup};
use crate::error::{CoreError, CoreResult};
use parking_lot::{Mutex, RwLock};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use stratum_storage::{
    decode_be, encode_be_minimal, EncryptionKey, KvEngine, KvSession, LogEngine,
    LogEngineOptions, StorageError, KEY_SIZE,
};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Key table.
pub const KEY_TABLE_URI: &str = "table:key";
/// Parameters table.
pub const PARAMETERS_TABLE_URI: &str = "table:parameters";
/// Parameters row holding the reserved nonce bound.
pub const GCM_IV_RESERVED_KEY: &str = "_gcm_iv_reserved";
/// How far the reserved bound moves at a time.
pub const GCM_IV_RESERVE_BATCH: u128 = 1 << 12;

const TABLE_CONFIG: &str = "key_format=S,value_format=u,access_pattern_hint=random";

struct IvState {
    counter: u128,
    reserved: u128,
    prng: StdRng,
}

struct Handles {
    engine: LogEngine,
    session: Box<dyn KvSession>,
}

/// Per-namespace data keys, the master key, and the nonce counter.
pub struct EncryptionKeyStore {
    path: PathBuf,
    role: KeyStoreRole,
    just_created: bool,
    master_key: EncryptionKey,
    ctx: KeyStoreContext,
    iv: Mutex<IvState>,
    handles: Mutex<Option<Handles>>,
    bound: Mutex<HashSet<String>>,
    listeners: RwLock<Vec<Weak<dyn KeyEvictionListener>>>,
    backup: BackupState,
    closed: AtomicBool,
    _guard: RoleGuard,
}

impl EncryptionKeyStore {
    /// Opens the key store at `path` in `role`.
    ///
    /// `just_created` says whether the directory was created for this open;
    /// only then may a main store generate a missing master key.
    ///
    /// # Errors
    ///
    /// - [`CoreError::KeyStoreRoleTaken`] if another store holds `role`
    /// - master key errors from the key file or secret service
    /// - storage errors if the engine cannot be opened under the master key
    pub fn open(
        path: impl Into<PathBuf>,
        role: KeyStoreRole,
        just_created: bool,
        ctx: &KeyStoreContext,
    ) -> CoreResult<Self> {
        let path = path.into();
        let guard = ctx.registry.register(role)?;
        let result = Self::open_with_guard(path.clone(), role, just_created, ctx, guard);
        if let Err(e) = &result {
            error!(path = %path.display(), error = %e, "failed to open key store");
        }
        result
    }

    fn open_with_guard(
        path: PathBuf,
        role: KeyStoreRole,
        just_created: bool,
        ctx: &KeyStoreContext,
        guard: RoleGuard,
    ) -> CoreResult<Self> {
        let master_key = master_key::load_master_key(ctx, role, just_created)?;
        let create = role == KeyStoreRole::Rotation || just_created;
        let handles = open_handles(&path, &master_key, create)?;
        let mut session = handles.session;

        session.create(KEY_TABLE_URI, TABLE_CONFIG)?;
        session.create(PARAMETERS_TABLE_URI, TABLE_CONFIG)?;
        let reserved = read_reserved(session.as_mut())?;

        info!(path = %path.display(), %role, reserved, "encryption key store initialized");
        Ok(Self {
            backup: BackupState::new(&path),
            path,
            role,
            just_created,
            master_key,
            ctx: ctx.clone(),
            iv: Mutex::new(IvState {
                counter: reserved,
                reserved,
                prng: StdRng::from_rng(OsRng).map_err(|e| {
                    CoreError::encryption_failed(format!("cannot seed generator: {e}"))
                })?,
            }),
            handles: Mutex::new(Some(Handles {
                engine: handles.engine,
                session,
            })),
            bound: Mutex::new(HashSet::new()),
            listeners: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            _guard: guard,
        })
    }

    /// Directory of the store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Role the store was opened in.
    #[must_use]
    pub fn role(&self) -> KeyStoreRole {
        self.role
    }

    /// Whether the directory was created by this open.
    #[must_use]
    pub fn just_created(&self) -> bool {
        self.just_created
    }

    /// Handle to the store's engine.
    pub fn engine(&self) -> CoreResult<LogEngine> {
        self.handles
            .lock()
            .as_ref()
            .map(|h| h.engine.clone())
            .ok_or_else(closed)
    }

    /// Registers a listener for key deletions. Only a weak reference is
    /// kept.
    pub fn add_eviction_listener(&self, listener: &Arc<dyn KeyEvictionListener>) {
        self.listeners.write().push(Arc::downgrade(listener));
    }

    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut dyn KvSession) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut handles = self.handles.lock();
        let handles = handles.as_mut().ok_or_else(closed)?;
        f(handles.session.as_mut())
    }

    /// Returns the key for `key_id`, generating and storing one on first
    /// use. An empty id returns the master key.
    pub fn get_key_by_id(&self, key_id: &str) -> CoreResult<EncryptionKey> {
        debug!(key_id, "get_key_by_id");
        if key_id.is_empty() {
            return Ok(self.master_key.clone());
        }

        // The id is bound under the session lock so a concurrent delete
        // either sees the binding or runs before the key exists.
        self.with_session(|session| {
            let key = match session.search(KEY_TABLE_URI, key_id)? {
                Some(bytes) => {
                    let bytes = Zeroizing::new(bytes);
                    crate::fatal::invariant(bytes.len() == KEY_SIZE, 29042, || {
                        format!("stored key for {key_id} has {} bytes", bytes.len())
                    });
                    EncryptionKey::from_bytes(&bytes)?
                }
                None => {
                    let key = EncryptionKey::generate();
                    session.insert(KEY_TABLE_URI, key_id, key.as_bytes())?;
                    debug!(key_id, "generated and stored key");
                    key
                }
            };
            self.bound.lock().insert(key_id.to_string());
            Ok(key)
        })
    }

    /// Removes the key for `key_id`. A missing key is not an error. Cached
    /// state bound to the key is evicted either way.
    pub fn delete_key_by_id(&self, key_id: &str) -> CoreResult<()> {
        debug!(key_id, "delete_key_by_id");
        let mut was_bound = false;
        let removed = self.with_session(|session| {
            let removed = match session.remove(KEY_TABLE_URI, key_id) {
                Err(e) if e.is_absent() => Ok(()),
                other => other.map_err(CoreError::from),
            };
            was_bound = self.bound.lock().remove(key_id);
            removed
        });

        if was_bound {
            self.notify_evicted(key_id);
        }
        removed
    }

    fn notify_evicted(&self, key_id: &str) {
        let mut listeners = self.listeners.write();
        listeners.retain(|weak| match weak.upgrade() {
            Some(listener) => {
                listener.evict(key_id);
                true
            }
            None => false,
        });
    }

    /// Namespace ids with a stored key.
    pub fn key_ids(&self) -> CoreResult<Vec<String>> {
        self.with_session(|session| {
            session
                .scan(KEY_TABLE_URI)?
                .map(|row| row.map(|(id, _)| id).map_err(CoreError::from))
                .collect()
        })
    }

    /// Writes the next nonce into `buf`, little-endian, zero-padded or
    /// truncated to its length.
    pub fn get_iv_gcm(&self, buf: &mut [u8]) -> CoreResult<()> {
        let mut iv = self.iv.lock();
        iv.counter += 1;
        let bytes = iv.counter.to_le_bytes();
        buf.fill(0);
        let n = buf.len().min(bytes.len());
        buf[..n].copy_from_slice(&bytes[..n]);

        if iv.counter > iv.reserved {
            self.reserve_gcm_iv_range_locked(&mut iv)?;
        }
        Ok(())
    }

    /// Raises the reserved bound by one batch and persists it. The caller
    /// holds the `iv` lock.
    fn reserve_gcm_iv_range_locked(&self, iv: &mut IvState) -> CoreResult<()> {
        let previous = iv.reserved;
        iv.reserved += GCM_IV_RESERVE_BATCH;
        if let Err(e) = self.store_reserved(iv.reserved) {
            iv.reserved = previous;
            error!(error = %e, "failed to persist reserved nonce range");
            return Err(e);
        }
        debug!(reserved = iv.reserved, "reserved nonce range");
        Ok(())
    }

    fn store_reserved(&self, reserved: u128) -> CoreResult<()> {
        self.with_session(|session| {
            session.insert(
                PARAMETERS_TABLE_URI,
                GCM_IV_RESERVED_KEY,
                &encode_be_minimal(reserved),
            )?;
            Ok(())
        })
    }

    #[cfg(test)]
    fn persisted_reserved(&self) -> CoreResult<u128> {
        self.with_session(read_reserved)
    }

    /// The reserved nonce bound.
    #[must_use]
    pub fn reserved_iv(&self) -> u128 {
        self.iv.lock().reserved
    }

    /// The last nonce handed out.
    #[must_use]
    pub fn iv_counter(&self) -> u128 {
        self.iv.lock().counter
    }

    /// Fills `buf` from the seeded generator.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidArgument`] unless `buf.len()` is a multiple of 4.
    pub fn store_pseudo_bytes(&self, buf: &mut [u8]) -> CoreResult<()> {
        if buf.len() % 4 != 0 {
            return Err(CoreError::invalid_argument(format!(
                "pseudo-random buffer length {} is not a multiple of 4",
                buf.len()
            )));
        }
        let mut iv = self.iv.lock();
        for chunk in buf.chunks_exact_mut(4) {
            chunk.copy_from_slice(&iv.prng.next_u32().to_le_bytes());
        }
        Ok(())
    }

    /// A fresh key from the operating system generator.
    #[must_use]
    pub fn generate_secure_key(&self) -> EncryptionKey {
        EncryptionKey::generate()
    }

    /// Copies the reserved bound and every key row from `old`.
    ///
    /// Used right after opening a rotation store; data keys are copied
    /// byte for byte.
    pub fn clone_from(&self, old: &EncryptionKeyStore) -> CoreResult<()> {
        let reserved = old.reserved_iv();
        {
            let mut iv = self.iv.lock();
            self.store_reserved(reserved).map_err(|e| {
                error!(error = %e, "failed to copy key store parameters during rotation");
                e
            })?;
            iv.reserved = reserved;
            iv.counter = reserved;
        }

        let rows: Vec<(String, Zeroizing<Vec<u8>>)> = old.with_session(|session| {
            session
                .scan(KEY_TABLE_URI)?
                .map(|row| {
                    row.map(|(id, key)| (id, Zeroizing::new(key)))
                        .map_err(CoreError::from)
                })
                .collect()
        })?;
        let copied = rows.len();
        self.with_session(|session| {
            for (id, key) in &rows {
                session.insert(KEY_TABLE_URI, id, key)?;
            }
            Ok(())
        })?;
        info!(keys = copied, reserved, "cloned key store");
        Ok(())
    }

    /// Writes the master key to the secret service.
    pub fn store_master_key(&self) -> CoreResult<()> {
        let config = &self.ctx.encryption;
        let (Some(name), Some(service)) = (&config.secret_name, &self.ctx.secrets) else {
            return Err(CoreError::invalid_operation(
                "storing the master key requires a secret service",
            ));
        };
        let token = master_key::secret_token(&self.ctx)?;
        service.write_key(name, &token, &encode_master_key(&self.master_key))?;
        info!(secret = %name, "stored master key");
        Ok(())
    }

    /// Checkpoints the store's engine.
    pub fn checkpoint(&self) -> CoreResult<()> {
        self.with_session(|session| Ok(session.checkpoint("")?))
    }

    /// Closes and reopens the engine, then applies `config`.
    pub fn reconfigure(&self, config: &str) -> CoreResult<()> {
        info!("closing key store in preparation for reconfiguring");
        let iv = self.iv.lock();
        let mut slot = self.handles.lock();
        let Some(mut handles) = slot.take() else {
            return Err(closed());
        };
        persist_reserved_at_least(handles.session.as_mut(), iv.reserved)
            .and_then(|()| close_handles(handles))?;

        let reopened = open_handles(&self.path, &self.master_key, false)?;
        info!("key store reopened");
        reopened.engine.reconfigure(config)?;
        info!(config, "key store reconfigured");
        *slot = Some(reopened);
        Ok(())
    }

    /// Persists the reserved bound, never lowering it, and closes the
    /// engine. Later calls do nothing.
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let iv = self.iv.lock();
        let Some(mut handles) = self.handles.lock().take() else {
            return Ok(());
        };
        let persisted = persist_reserved_at_least(handles.session.as_mut(), iv.reserved);
        let closed = close_handles(handles);
        persisted.and(closed)?;
        info!(path = %self.path.display(), "encryption key store closed");
        Ok(())
    }

    /// Opens a backup of the store and returns all of its blocks at once.
    /// With `disable_incremental` incremental tracking is discarded, nothing
    /// is listed and no cursor stays open.
    pub fn begin_non_blocking_backup(
        &self,
        options: &BackupOptions,
    ) -> CoreResult<Vec<BackupBlock>> {
        options.validate()?;
        let engine = self.engine()?;
        if options.disable_incremental {
            self.backup.force_stop(&engine)?;
            return Ok(Vec::new());
        }
        self.backup.open(&engine, options)?;
        match self.backup.next_batch(usize::MAX) {
            Ok(blocks) => Ok(blocks),
            Err(e) => {
                self.backup.release(engine.is_shutting_down());
                Err(e)
            }
        }
    }

    /// Lists log files written since the backup began.
    pub fn extend_backup_cursor(&self) -> CoreResult<Vec<PathBuf>> {
        self.backup.extend(|| Ok(()))
    }

    /// Releases the backup cursor.
    pub fn end_non_blocking_backup(&self) {
        let shutting_down = self
            .engine()
            .map(|engine| engine.is_shutting_down())
            .unwrap_or(true);
        self.backup.release(shutting_down);
    }

    /// Adds the store's files to `backup` under `dest/key.db`.
    pub fn add_to_hot_backup(&self, backup: &mut HotBackup, dest: &Path) -> CoreResult<()> {
        let engine = self.engine()?;
        backup.add_engine(&engine, &self.path, &dest.join(KEY_DB_DIR))
    }

    /// Drops every handle without persisting anything, as a crash would.
    #[cfg(test)]
    pub(crate) fn crash(self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl KeyProvider for EncryptionKeyStore {
    fn get_key_by_id(&self, key_id: &str) -> CoreResult<EncryptionKey> {
        EncryptionKeyStore::get_key_by_id(self, key_id)
    }

    fn get_iv_gcm(&self, buf: &mut [u8]) -> CoreResult<()> {
        EncryptionKeyStore::get_iv_gcm(self, buf)
    }

    fn store_pseudo_bytes(&self, buf: &mut [u8]) -> CoreResult<()> {
        EncryptionKeyStore::store_pseudo_bytes(self, buf)
    }

    fn generate_secure_key(&self) -> EncryptionKey {
        EncryptionKeyStore::generate_secure_key(self)
    }
}

impl Drop for EncryptionKeyStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "failed to close key store");
        }
    }
}

impl std::fmt::Debug for EncryptionKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKeyStore")
            .field("path", &self.path)
            .field("role", &self.role)
            .field("just_created", &self.just_created)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn closed() -> CoreError {
    CoreError::Storage(StorageError::Closed)
}

fn open_handles(path: &Path, master_key: &EncryptionKey, create: bool) -> CoreResult<Handles> {
    let options = LogEngineOptions::new()
        .create(create)
        .sync_on_write(true)
        .encryption_key(master_key.clone());
    let engine = LogEngine::open(path, options).map_err(|e| match e {
        StorageError::NoEntry => CoreError::key_file(path, "key store directory is missing"),
        other => other.into(),
    })?;
    let session = engine.open_session()?;
    Ok(Handles { engine, session })
}

fn read_reserved(session: &mut dyn KvSession) -> CoreResult<u128> {
    match session.search(PARAMETERS_TABLE_URI, GCM_IV_RESERVED_KEY)? {
        Some(bytes) => Ok(decode_be(&bytes)?),
        None => Ok(0),
    }
}

fn persist_reserved_at_least(session: &mut dyn KvSession, reserved: u128) -> CoreResult<()> {
    if read_reserved(session)? < reserved {
        session.insert(
            PARAMETERS_TABLE_URI,
            GCM_IV_RESERVED_KEY,
            &encode_be_minimal(reserved),
        )?;
    }
    Ok(())
}

fn close_handles(mut handles: Handles) -> CoreResult<()> {
    handles.session.close()?;
    handles.engine.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncryptionConfig;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn context(dir: &Path) -> KeyStoreContext {
        let key_file = dir.join("master.key");
        if !key_file.exists() {
            master_key::tests::write_key_file(&key_file);
        }
        KeyStoreContext::new(EncryptionConfig::with_key_file(key_file))
    }

    fn open(dir: &Path, ctx: &KeyStoreContext) -> EncryptionKeyStore {
        EncryptionKeyStore::open(dir.join(KEY_DB_DIR), KeyStoreRole::Main, true, ctx).unwrap()
    }

    #[test]
    fn keys_are_created_once_and_persist() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let key = {
            let store = open(dir.path(), &ctx);
            let key = store.get_key_by_id("db1").unwrap();
            assert_eq!(store.get_key_by_id("db1").unwrap(), key);
            assert_ne!(store.get_key_by_id("db2").unwrap(), key);
            key
        };
        let store = open(dir.path(), &ctx);
        assert_eq!(store.get_key_by_id("db1").unwrap(), key);
        assert_eq!(store.key_ids().unwrap(), vec!["db1", "db2"]);
    }

    #[test]
    fn empty_id_is_the_master_key() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let store = open(dir.path(), &ctx);
        let master = decode_master_key(
            &read_first_token(&dir.path().join("master.key"), false).unwrap(),
        )
        .unwrap();
        assert_eq!(store.get_key_by_id("").unwrap(), master);
        assert!(store.key_ids().unwrap().is_empty());
    }

    #[test]
    fn wrong_master_key_cannot_open_store() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        open(dir.path(), &ctx).get_key_by_id("db1").unwrap();

        master_key::tests::write_key_file(&dir.path().join("master.key"));
        assert!(EncryptionKeyStore::open(
            dir.path().join(KEY_DB_DIR),
            KeyStoreRole::Main,
            false,
            &ctx
        )
        .is_err());
        assert!(!ctx.registry.is_registered(KeyStoreRole::Main));
    }

    #[test]
    fn deleted_key_is_regenerated_and_evicted() {
        struct Counting(AtomicUsize);
        impl KeyEvictionListener for Counting {
            fn evict(&self, _key_id: &str) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let store = open(dir.path(), &ctx);
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let listener: Arc<dyn KeyEvictionListener> = counting.clone();
        store.add_eviction_listener(&listener);

        let old = store.get_key_by_id("db1").unwrap();
        store.delete_key_by_id("db1").unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert_ne!(store.get_key_by_id("db1").unwrap(), old);

        store.delete_key_by_id("never-used").unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nonces_reserve_in_batches() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let store = open(dir.path(), &ctx);
        assert_eq!(store.reserved_iv(), 0);

        let mut nonce = [0xffu8; 12];
        store.get_iv_gcm(&mut nonce).unwrap();
        assert_eq!(nonce, [1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(store.reserved_iv(), GCM_IV_RESERVE_BATCH);
        assert_eq!(store.persisted_reserved().unwrap(), GCM_IV_RESERVE_BATCH);

        for _ in 1..GCM_IV_RESERVE_BATCH {
            store.get_iv_gcm(&mut nonce).unwrap();
        }
        assert_eq!(store.iv_counter(), GCM_IV_RESERVE_BATCH);
        assert_eq!(store.reserved_iv(), GCM_IV_RESERVE_BATCH);
        store.get_iv_gcm(&mut nonce).unwrap();
        assert_eq!(store.reserved_iv(), 2 * GCM_IV_RESERVE_BATCH);
    }

    #[test]
    fn short_and_long_nonce_buffers() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let store = open(dir.path(), &ctx);
        let mut short = [0u8; 1];
        store.get_iv_gcm(&mut short).unwrap();
        assert_eq!(short, [1]);
        let mut long = [0xaau8; 20];
        store.get_iv_gcm(&mut long).unwrap();
        assert_eq!(long[0], 2);
        assert!(long[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn nonces_never_repeat_across_crash() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let mut seen = HashSet::new();

        let store = open(dir.path(), &ctx);
        for _ in 0..100 {
            let mut nonce = [0u8; 12];
            store.get_iv_gcm(&mut nonce).unwrap();
            assert!(seen.insert(nonce));
        }
        store.crash();

        let store = open(dir.path(), &ctx);
        assert_eq!(store.iv_counter(), GCM_IV_RESERVE_BATCH);
        for _ in 0..100 {
            let mut nonce = [0u8; 12];
            store.get_iv_gcm(&mut nonce).unwrap();
            assert!(seen.insert(nonce));
        }
    }

    #[test]
    fn close_never_lowers_reserved_bound() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let store = open(dir.path(), &ctx);
        let mut nonce = [0u8; 12];
        store.get_iv_gcm(&mut nonce).unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(store.get_key_by_id("db1").is_err());
        drop(store);

        let store = open(dir.path(), &ctx);
        assert_eq!(store.reserved_iv(), GCM_IV_RESERVE_BATCH);
    }

    #[test]
    fn pseudo_bytes_require_word_multiples() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let store = open(dir.path(), &ctx);
        let mut buf = [0u8; 32];
        store.store_pseudo_bytes(&mut buf).unwrap();
        assert!(buf.iter().any(|&b| b != 0));
        assert!(store.store_pseudo_bytes(&mut [0u8; 6]).is_err());
    }

    #[test]
    fn clone_copies_keys_and_reserved_bound() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let old = open(dir.path(), &ctx);
        let a = old.get_key_by_id("a").unwrap();
        let b = old.get_key_by_id("b").unwrap();
        old.get_iv_gcm(&mut [0u8; 12]).unwrap();

        let other = context(dir.path());
        let copy = open(&dir.path().join("other"), &other);
        copy.clone_from(&old).unwrap();
        assert_eq!(copy.reserved_iv(), GCM_IV_RESERVE_BATCH);
        assert_eq!(copy.get_key_by_id("a").unwrap(), a);
        assert_eq!(copy.get_key_by_id("b").unwrap(), b);
        let mut nonce = [0u8; 12];
        copy.get_iv_gcm(&mut nonce).unwrap();
        assert_eq!(nonce[..2], [1, 16]);
    }

    #[test]
    fn rotation_role_needs_secret_service() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let err = EncryptionKeyStore::open(
            dir.path().join("rotation"),
            KeyStoreRole::Rotation,
            true,
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
        assert!(!ctx.registry.is_registered(KeyStoreRole::Rotation));
    }

    #[test]
    fn checkpoint_and_reconfigure_keep_contents() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let store = open(dir.path(), &ctx);
        let key = store.get_key_by_id("db1").unwrap();
        store.checkpoint().unwrap();
        store.reconfigure("transaction_sync=(enabled=false)").unwrap();
        assert_eq!(store.get_key_by_id("db1").unwrap(), key);
    }

    #[test]
    fn backup_lists_store_files() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let store = open(dir.path(), &ctx);
        store.get_key_by_id("db1").unwrap();

        let blocks = store
            .begin_non_blocking_backup(&BackupOptions::full())
            .unwrap();
        assert!(!blocks.is_empty());
        assert!(blocks.iter().all(|b| b.file_path.starts_with(store.path())));
        assert!(matches!(
            store.begin_non_blocking_backup(&BackupOptions::full()),
            Err(CoreError::BackupInProgress)
        ));
        assert_eq!(store.extend_backup_cursor().unwrap().len(), 0);
        store.end_non_blocking_backup();

        assert!(store
            .begin_non_blocking_backup(&BackupOptions::disable_incremental())
            .unwrap()
            .is_empty());
        assert!(!store
            .begin_non_blocking_backup(&BackupOptions::full())
            .unwrap()
            .is_empty());
        store.end_non_blocking_backup();

        let mut both = BackupOptions::incremental("b1");
        both.disable_incremental = true;
        assert!(matches!(
            store.begin_non_blocking_backup(&both),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn concurrent_lookups_create_each_key_once() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let store = Arc::new(open(dir.path(), &ctx));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..4)
                        .map(|i| store.get_key_by_id(&format!("db{i}")).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for keys in &results[1..] {
            assert!(keys == &results[0]);
        }
        assert_eq!(store.key_ids().unwrap(), vec!["db0", "db1", "db2", "db3"]);
        for (i, key) in results[0].iter().enumerate() {
            assert!(store.get_key_by_id(&format!("db{i}")).unwrap() == *key);
        }
    }

    #[test]
    fn concurrent_nonces_are_distinct() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let store = Arc::new(open(dir.path(), &ctx));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..3_000)
                        .map(|_| {
                            let mut nonce = [0u8; 12];
                            store.get_iv_gcm(&mut nonce).unwrap();
                            nonce
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for nonce in handle.join().unwrap() {
                assert!(seen.insert(nonce));
            }
        }
        assert_eq!(store.iv_counter(), 12_000);
        assert!(store.reserved_iv() >= store.iv_counter());
    }
}
