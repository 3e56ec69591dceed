//! Secret services holding base64 master keys.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Stores master keys by secret name.
///
/// `read_key` returns `Ok(None)` when the secret does not exist, so the
/// caller can tell a missing key from a failed request.
pub trait SecretService: Send + Sync {
    /// Reads the encoded key stored under `name`.
    fn read_key(&self, name: &str, token: &str) -> CoreResult<Option<String>>;

    /// Writes `encoded` under `name`, replacing any previous value.
    fn write_key(&self, name: &str, token: &str, encoded: &str) -> CoreResult<()>;
}

/// An in-process secret service.
#[derive(Debug, Default)]
pub struct MemorySecretService {
    token: Option<String>,
    secrets: Mutex<HashMap<String, String>>,
}

impl MemorySecretService {
    /// Creates an empty service that accepts any token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty service that only accepts `token`.
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            secrets: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored secrets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.secrets.lock().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secrets.lock().is_empty()
    }

    fn authorize(&self, token: &str) -> CoreResult<()> {
        match &self.token {
            Some(expected) if expected != token => {
                Err(CoreError::secret_service("permission denied"))
            }
            _ => Ok(()),
        }
    }
}

impl SecretService for MemorySecretService {
    fn read_key(&self, name: &str, token: &str) -> CoreResult<Option<String>> {
        self.authorize(token)?;
        Ok(self.secrets.lock().get(name).cloned())
    }

    fn write_key(&self, name: &str, token: &str, encoded: &str) -> CoreResult<()> {
        self.authorize(token)?;
        self.secrets
            .lock()
            .insert(name.to_string(), encoded.to_string());
        Ok(())
    }
}

/// Keeps each secret in its own owner-only file under a directory.
#[derive(Debug, Clone)]
pub struct DirectorySecretService {
    dir: PathBuf,
}

impl DirectorySecretService {
    /// Uses `dir`, creating it on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The backing directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn secret_path(&self, name: &str) -> CoreResult<PathBuf> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !name.starts_with('.');
        if !valid {
            return Err(CoreError::secret_service(format!(
                "invalid secret name {name:?}"
            )));
        }
        Ok(self.dir.join(name))
    }
}

impl SecretService for DirectorySecretService {
    fn read_key(&self, name: &str, _token: &str) -> CoreResult<Option<String>> {
        let path = self.secret_path(name)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::secret_service(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    fn write_key(&self, name: &str, _token: &str, encoded: &str) -> CoreResult<()> {
        let path = self.secret_path(name)?;
        fs::create_dir_all(&self.dir)?;

        let temp = self.dir.join(format!(".{name}.tmp"));
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&temp)?;
        file.write_all(encoded.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        drop(file);
        crate::fs_util::fsync_rename(&temp, &path)?;
        Ok(())
    }
}
