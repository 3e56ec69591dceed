//! One key store per role.

use super::secret::SecretService;
use crate::config::EncryptionConfig;
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// What a key store is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyStoreRole {
    /// The live store used by the data engine.
    Main,
    /// A temporary store receiving a clone during master key rotation.
    Rotation,
}

impl KeyStoreRole {
    /// Lower-case role name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Rotation => "rotation",
        }
    }

    const fn slot(self) -> usize {
        match self {
            Self::Main => 0,
            Self::Rotation => 1,
        }
    }
}

impl fmt::Display for KeyStoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks which roles have an open key store.
#[derive(Debug, Default)]
pub struct KeyStoreRegistry {
    taken: Mutex<[bool; 2]>,
}

impl KeyStoreRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claims `role` until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// [`CoreError::KeyStoreRoleTaken`] if a store already holds the role.
    pub fn register(self: &Arc<Self>, role: KeyStoreRole) -> CoreResult<RoleGuard> {
        let mut taken = self.taken.lock();
        if taken[role.slot()] {
            return Err(CoreError::KeyStoreRoleTaken {
                role: role.as_str(),
            });
        }
        taken[role.slot()] = true;
        Ok(RoleGuard {
            registry: Arc::clone(self),
            role,
        })
    }

    /// Whether a store holds `role`.
    #[must_use]
    pub fn is_registered(&self, role: KeyStoreRole) -> bool {
        self.taken.lock()[role.slot()]
    }
}

/// Releases a role on drop.
#[derive(Debug)]
pub struct RoleGuard {
    registry: Arc<KeyStoreRegistry>,
    role: KeyStoreRole,
}

impl RoleGuard {
    /// The claimed role.
    #[must_use]
    pub fn role(&self) -> KeyStoreRole {
        self.role
    }
}

impl Drop for RoleGuard {
    fn drop(&mut self) {
        self.registry.taken.lock()[self.role.slot()] = false;
    }
}

/// Everything a key store needs from its surroundings.
#[derive(Clone)]
pub struct KeyStoreContext {
    /// Master key source settings.
    pub encryption: EncryptionConfig,
    /// Role registry shared by every store of one process.
    pub registry: Arc<KeyStoreRegistry>,
    /// Secret service for `encryption.secret_name`.
    pub secrets: Option<Arc<dyn SecretService>>,
}

impl KeyStoreContext {
    /// Creates a context with a fresh registry and no secret service.
    pub fn new(encryption: EncryptionConfig) -> Self {
        Self {
            encryption,
            registry: KeyStoreRegistry::new(),
            secrets: None,
        }
    }

    /// Sets the secret service.
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
}

impl fmt::Debug for KeyStoreContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStoreContext")
            .field("encryption", &self.encryption)
            .field("registry", &self.registry)
            .field("secrets", &self.secrets.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_store_per_role() {
        let registry = KeyStoreRegistry::new();
        let main = registry.register(KeyStoreRole::Main).unwrap();
        assert!(matches!(
            registry.register(KeyStoreRole::Main),
            Err(CoreError::KeyStoreRoleTaken { role: "main" })
        ));
        let rotation = registry.register(KeyStoreRole::Rotation).unwrap();
        assert_eq!(rotation.role(), KeyStoreRole::Rotation);

        drop(main);
        assert!(!registry.is_registered(KeyStoreRole::Main));
        assert!(registry.is_registered(KeyStoreRole::Rotation));
        registry.register(KeyStoreRole::Main).unwrap();
    }

    #[test]
    fn separate_registries_do_not_interfere() {
        let a = KeyStoreRegistry::new();
        let b = KeyStoreRegistry::new();
        let _held = a.register(KeyStoreRole::Main).unwrap();
        b.register(KeyStoreRole::Main).unwrap();
    }
}
