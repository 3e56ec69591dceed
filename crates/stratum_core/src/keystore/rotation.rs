//! Key store directory layout and master key rotation.

use super::registry::{KeyStoreContext, KeyStoreRole};
use super::EncryptionKeyStore;
use crate::error::{CoreError, CoreResult};
use crate::fs_util::fsync_rename;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Key store directory under the data directory.
pub const KEY_DB_DIR: &str = "key.db";
/// Working directory of a rotation in progress.
pub const ROTATION_DIR: &str = "key.db.rotation";
/// Where the previous key store is kept after a rotation.
pub const ROTATED_DIR: &str = "key.db.rotated";
/// Key store directory name used by early releases.
pub const LEGACY_KEY_DB_DIR: &str = "keydb";

/// How a rotation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The new key store is in place. Startup must stop; the next start
    /// opens the rotated store.
    RestartRequired {
        /// Location of the previous key store.
        rotated_dir: PathBuf,
        /// Number of data keys carried over.
        keys: usize,
    },
}

impl fmt::Display for RotationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestartRequired { rotated_dir, keys } => write!(
                f,
                "master key rotation finished successfully ({keys} keys, previous store kept at {}); restart without rotation to continue",
                rotated_dir.display()
            ),
        }
    }
}

/// Result of opening the main key store.
#[derive(Debug)]
pub enum KeyStoreOpen {
    /// The store is open.
    Ready(EncryptionKeyStore),
    /// A requested rotation ran instead.
    RestartRequired(RotationOutcome),
}

/// Makes sure `db_path/key.db` exists, moving a legacy `keydb` directory
/// into place. Returns the store path and whether it was just created.
pub fn prepare_key_store_dir(db_path: &Path) -> CoreResult<(PathBuf, bool)> {
    let path = db_path.join(KEY_DB_DIR);
    if path.exists() {
        return Ok((path, false));
    }

    let legacy = db_path.join(LEGACY_KEY_DB_DIR);
    if legacy.exists() {
        fsync_rename(&legacy, &path).map_err(|e| {
            error!(from = %legacy.display(), to = %path.display(), error = %e, "error renaming key store directory");
            e
        })?;
        info!(from = %legacy.display(), to = %path.display(), "moved legacy key store directory");
        return Ok((path, false));
    }

    fs::create_dir_all(&path).map_err(|e| {
        error!(path = %path.display(), error = %e, "error creating key store directory");
        e
    })?;
    Ok((path, true))
}

/// Opens the main key store of `db_path`, rotating the master key first
/// when the configuration asks for it.
///
/// A directory created by this call is removed again if the store fails to
/// open.
pub fn open_key_store(db_path: &Path, ctx: &KeyStoreContext) -> CoreResult<KeyStoreOpen> {
    let (path, just_created) = prepare_key_store_dir(db_path)?;
    let store = match EncryptionKeyStore::open(&path, KeyStoreRole::Main, just_created, ctx) {
        Ok(store) => store,
        Err(e) => {
            if just_created {
                if let Err(remove) = fs::remove_dir_all(&path) {
                    warn!(path = %path.display(), error = %remove, "cannot remove key store directory");
                }
            }
            return Err(e);
        }
    };

    if ctx.encryption.rotate_master_key {
        return rotate_master_key(db_path, store, ctx).map(KeyStoreOpen::RestartRequired);
    }
    Ok(KeyStoreOpen::Ready(store))
}

/// Re-encrypts the key store under a new master key.
///
/// Clones `live` into a fresh store under `db_path/key.db.rotation`, closes
/// both stores, writes the new master key to the secret service, then swaps
/// directories: `key.db` becomes `key.db.rotated` and the rotation directory
/// becomes `key.db`.
///
/// Any failure up to and including the secret write removes the rotation
/// directory, leaving `key.db` usable under the old master key. Once the new
/// master key is stored the rotation directory holds the only store it
/// opens, so a failed swap leaves it in place.
///
/// # Errors
///
/// [`CoreError::RotationDirectoryExists`] if a previous rotation left its
/// directory behind.
pub fn rotate_master_key(
    db_path: &Path,
    live: EncryptionKeyStore,
    ctx: &KeyStoreContext,
) -> CoreResult<RotationOutcome> {
    let rotation_path = db_path.join(ROTATION_DIR);
    if rotation_path.exists() {
        return Err(CoreError::RotationDirectoryExists {
            path: rotation_path,
        });
    }
    fs::create_dir(&rotation_path).map_err(|e| {
        error!(path = %rotation_path.display(), error = %e, "error creating rotation directory");
        e
    })?;

    let live_path = live.path().to_path_buf();
    let keys = match prepare_rotation(&rotation_path, live, ctx) {
        Ok(keys) => keys,
        Err(e) => {
            if let Err(remove) = fs::remove_dir_all(&rotation_path) {
                warn!(path = %rotation_path.display(), error = %remove, "cannot remove rotation directory");
            }
            return Err(e);
        }
    };

    let rotated_dir = db_path.join(ROTATED_DIR);
    swap_directories(&live_path, &rotation_path, &rotated_dir).map_err(|e| {
        error!(
            rotation = %rotation_path.display(),
            error = %e,
            "master key stored but key store directories were not swapped; move the rotation directory to {} by hand",
            live_path.display()
        );
        e
    })?;

    info!(keys, rotated = %rotated_dir.display(), "master key rotation finished");
    Ok(RotationOutcome::RestartRequired { rotated_dir, keys })
}

/// Clones `live` into a Rotation store at `rotation_path`, closes both and
/// stores the new master key. Both stores are dropped before returning.
fn prepare_rotation(
    rotation_path: &Path,
    live: EncryptionKeyStore,
    ctx: &KeyStoreContext,
) -> CoreResult<usize> {
    let rotation = EncryptionKeyStore::open(rotation_path, KeyStoreRole::Rotation, true, ctx)?;
    rotation.clone_from(&live)?;
    let keys = rotation.key_ids()?.len();
    live.close()?;
    rotation.close()?;
    rotation.store_master_key()?;
    Ok(keys)
}

fn swap_directories(live_path: &Path, rotation_path: &Path, rotated_dir: &Path) -> CoreResult<()> {
    if rotated_dir.exists() {
        fs::remove_dir_all(rotated_dir)?;
    }
    fsync_rename(live_path, rotated_dir)?;
    fsync_rename(rotation_path, live_path)?;
    Ok(())
}
