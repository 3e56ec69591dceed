//! Key provider seam and the page encryption hooks built on it.

use crate::error::{CoreError, CoreResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use stratum_storage::{EncryptionKey, NONCE_SIZE, TAG_SIZE};
use tracing::debug;

/// Source of keys and nonces for page encryption.
pub trait KeyProvider: Send + Sync {
    /// Key for `key_id`, created on first use. An empty id is the master key.
    fn get_key_by_id(&self, key_id: &str) -> CoreResult<EncryptionKey>;

    /// Fills `buf` with a nonce that is never handed out twice.
    fn get_iv_gcm(&self, buf: &mut [u8]) -> CoreResult<()>;

    /// Fills `buf` with pseudo-random bytes. `buf.len()` must be a multiple
    /// of 4.
    fn store_pseudo_bytes(&self, buf: &mut [u8]) -> CoreResult<()>;

    /// A fresh random key.
    fn generate_secure_key(&self) -> EncryptionKey;
}

/// Told when a key is deleted, so state derived from it can be dropped.
pub trait KeyEvictionListener: Send + Sync {
    /// Forgets everything derived from `key_id`.
    fn evict(&self, key_id: &str);
}

/// AES-256-GCM page encryption with one cached cipher per key id.
///
/// Sealed pages are laid out as `nonce (12 bytes) || ciphertext || tag`.
/// Nonces come from the provider's counter, so they stay unique across
/// restarts.
pub struct EncryptionHooks {
    provider: Arc<dyn KeyProvider>,
    cache: RwLock<CipherCache>,
}

#[derive(Default)]
struct CipherCache {
    ciphers: HashMap<String, Arc<Aes256Gcm>>,
    /// Bumped on every eviction.
    evictions: u64,
}

impl EncryptionHooks {
    /// Creates hooks over `provider`.
    pub fn new(provider: Arc<dyn KeyProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new(CipherCache::default()),
        }
    }

    fn cipher(&self, key_id: &str) -> CoreResult<Arc<Aes256Gcm>> {
        let evictions = {
            let cache = self.cache.read();
            if let Some(cipher) = cache.ciphers.get(key_id) {
                return Ok(Arc::clone(cipher));
            }
            cache.evictions
        };
        let key = self.provider.get_key_by_id(key_id)?;
        let cipher = Arc::new(Aes256Gcm::new(GenericArray::from_slice(key.as_bytes())));

        let mut cache = self.cache.write();
        if cache.evictions != evictions {
            // A key was deleted while this one was fetched; it may have
            // been this one, so the cipher serves this call only.
            return Ok(cipher);
        }
        Ok(Arc::clone(
            cache.ciphers.entry(key_id.to_string()).or_insert(cipher),
        ))
    }

    /// Seals `plaintext` under the key of `key_id`.
    pub fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let cipher = self.cipher(key_id)?;
        let mut nonce = [0u8; NONCE_SIZE];
        self.provider.get_iv_gcm(&mut nonce)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CoreError::encryption_failed("encryption error"))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend(ciphertext);
        Ok(sealed)
    }

    /// Opens a page sealed by [`Self::encrypt`].
    pub fn decrypt(&self, key_id: &str, sealed: &[u8]) -> CoreResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CoreError::decryption_failed("ciphertext too short"));
        }
        let cipher = self.cipher(key_id)?;
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CoreError::decryption_failed("decryption error"))
    }

    /// Whether a cipher for `key_id` is cached.
    #[must_use]
    pub fn is_cached(&self, key_id: &str) -> bool {
        self.cache.read().ciphers.contains_key(key_id)
    }
}

impl KeyEvictionListener for EncryptionHooks {
    fn evict(&self, key_id: &str) {
        let mut cache = self.cache.write();
        cache.evictions += 1;
        if cache.ciphers.remove(key_id).is_some() {
            debug!(key_id, "evicted cached cipher");
        }
    }
}

impl std::fmt::Debug for EncryptionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionHooks")
            .field("cached", &self.cache.read().ciphers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rand::RngCore;
    use std::sync::Weak;

    #[derive(Default)]
    struct FakeProvider {
        keys: Mutex<HashMap<String, EncryptionKey>>,
        counter: Mutex<u128>,
    }

    impl KeyProvider for FakeProvider {
        fn get_key_by_id(&self, key_id: &str) -> CoreResult<EncryptionKey> {
            Ok(self
                .keys
                .lock()
                .entry(key_id.to_string())
                .or_insert_with(EncryptionKey::generate)
                .clone())
        }

        fn get_iv_gcm(&self, buf: &mut [u8]) -> CoreResult<()> {
            let mut counter = self.counter.lock();
            *counter += 1;
            buf.fill(0);
            let bytes = counter.to_le_bytes();
            let n = buf.len().min(bytes.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            Ok(())
        }

        fn store_pseudo_bytes(&self, buf: &mut [u8]) -> CoreResult<()> {
            rand::thread_rng().fill_bytes(buf);
            Ok(())
        }

        fn generate_secure_key(&self) -> EncryptionKey {
            EncryptionKey::generate()
        }
    }

    #[test]
    fn pages_round_trip_per_namespace() {
        let hooks = EncryptionHooks::new(Arc::new(FakeProvider::default()));
        let sealed = hooks.encrypt("db1", b"page contents").unwrap();
        assert_eq!(sealed[..NONCE_SIZE], [1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(hooks.decrypt("db1", &sealed).unwrap(), b"page contents");
        assert!(hooks.decrypt("db2", &sealed).is_err());
    }

    #[test]
    fn nonces_advance() {
        let hooks = EncryptionHooks::new(Arc::new(FakeProvider::default()));
        let a = hooks.encrypt("db1", b"x").unwrap();
        let b = hooks.encrypt("db1", b"x").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn eviction_drops_the_cached_cipher() {
        let provider = Arc::new(FakeProvider::default());
        let hooks = EncryptionHooks::new(Arc::clone(&provider) as Arc<dyn KeyProvider>);
        let sealed = hooks.encrypt("db1", b"x").unwrap();
        assert!(hooks.is_cached("db1"));

        provider.keys.lock().remove("db1");
        hooks.evict("db1");
        assert!(!hooks.is_cached("db1"));
        assert!(hooks.decrypt("db1", &sealed).is_err());
    }

    /// Deletes the key it hands out, as a concurrent drop would between
    /// the fetch and the cache insert.
    struct DeletingProvider {
        inner: FakeProvider,
        hooks: Mutex<Weak<EncryptionHooks>>,
    }

    impl KeyProvider for DeletingProvider {
        fn get_key_by_id(&self, key_id: &str) -> CoreResult<EncryptionKey> {
            let key = self.inner.get_key_by_id(key_id)?;
            self.inner.keys.lock().remove(key_id);
            if let Some(hooks) = self.hooks.lock().upgrade() {
                hooks.evict(key_id);
            }
            Ok(key)
        }

        fn get_iv_gcm(&self, buf: &mut [u8]) -> CoreResult<()> {
            self.inner.get_iv_gcm(buf)
        }

        fn store_pseudo_bytes(&self, buf: &mut [u8]) -> CoreResult<()> {
            self.inner.store_pseudo_bytes(buf)
        }

        fn generate_secure_key(&self) -> EncryptionKey {
            self.inner.generate_secure_key()
        }
    }

    #[test]
    fn key_deleted_during_fetch_is_not_cached() {
        let provider = Arc::new(DeletingProvider {
            inner: FakeProvider::default(),
            hooks: Mutex::new(Weak::new()),
        });
        let hooks = Arc::new(EncryptionHooks::new(
            Arc::clone(&provider) as Arc<dyn KeyProvider>
        ));
        *provider.hooks.lock() = Arc::downgrade(&hooks);

        let sealed = hooks.encrypt("db1", b"x").unwrap();
        assert!(!hooks.is_cached("db1"));
        // The namespace now has a fresh key, so the old page stays sealed.
        assert!(hooks.decrypt("db1", &sealed).is_err());
    }

    #[test]
    fn truncated_page_is_rejected() {
        let hooks = EncryptionHooks::new(Arc::new(FakeProvider::default()));
        assert!(matches!(
            hooks.decrypt("db1", &[0u8; 10]),
            Err(CoreError::DecryptionFailed { .. })
        ));
    }
}
