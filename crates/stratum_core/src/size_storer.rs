//! Cached table sizes persisted to `table:sizeStorer`.
//!
//! Record counts and data sizes change on every write, so they live in
//! memory and are written back only when flushed: before checkpoints and
//! backups. After a rollback the cache is rebuilt from the table.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use stratum_storage::{KvEngine, KvSession};
use tracing::debug;

/// Table holding persisted sizes.
pub const SIZE_STORER_URI: &str = "table:sizeStorer";

const SIZE_STORER_CONFIG: &str = "key_format=S,value_format=u";
const ENCODED_LEN: usize = 16;

/// Sizes of one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeInfo {
    /// Number of records.
    pub num_records: i64,
    /// Data size in bytes.
    pub data_size: i64,
}

impl SizeInfo {
    fn encode(self) -> [u8; ENCODED_LEN] {
        let mut out = [0u8; ENCODED_LEN];
        out[..8].copy_from_slice(&self.num_records.to_le_bytes());
        out[8..].copy_from_slice(&self.data_size.to_le_bytes());
        out
    }

    fn decode(uri: &str, bytes: &[u8]) -> CoreResult<Self> {
        let bytes: &[u8; ENCODED_LEN] = bytes.try_into().map_err(|_| {
            CoreError::invalid_argument(format!(
                "size entry for {uri} is {} bytes, expected {ENCODED_LEN}",
                bytes.len()
            ))
        })?;
        let mut records = [0u8; 8];
        let mut size = [0u8; 8];
        records.copy_from_slice(&bytes[..8]);
        size.copy_from_slice(&bytes[8..]);
        Ok(Self {
            num_records: i64::from_le_bytes(records),
            data_size: i64::from_le_bytes(size),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    info: SizeInfo,
    dirty: bool,
}

/// In-memory size cache over a dedicated table.
pub struct SizeStorer {
    session: Mutex<Box<dyn KvSession>>,
    cache: Mutex<HashMap<String, Entry>>,
}

impl SizeStorer {
    /// Opens the size table, creating it if needed, and loads it.
    pub fn open(engine: &Arc<dyn KvEngine>) -> CoreResult<Self> {
        let mut session = engine.open_session()?;
        session.create(SIZE_STORER_URI, SIZE_STORER_CONFIG)?;
        let storer = Self {
            session: Mutex::new(session),
            cache: Mutex::new(HashMap::new()),
        };
        storer.reset()?;
        Ok(storer)
    }

    /// Cached sizes for `uri`, loading them from the table on a miss.
    pub fn load(&self, uri: &str) -> CoreResult<SizeInfo> {
        if let Some(entry) = self.cache.lock().get(uri) {
            return Ok(entry.info);
        }
        let stored = self.session.lock().search(SIZE_STORER_URI, uri)?;
        let info = match stored {
            Some(bytes) => SizeInfo::decode(uri, &bytes)?,
            None => SizeInfo::default(),
        };
        self.cache
            .lock()
            .entry(uri.to_string())
            .or_insert(Entry { info, dirty: false });
        Ok(info)
    }

    /// Replaces the cached sizes for `uri`.
    pub fn store(&self, uri: &str, info: SizeInfo) {
        self.cache
            .lock()
            .insert(uri.to_string(), Entry { info, dirty: true });
    }

    /// Forgets `uri` in the cache and the table.
    pub fn remove(&self, uri: &str) -> CoreResult<()> {
        self.cache.lock().remove(uri);
        match self.session.lock().remove(SIZE_STORER_URI, uri) {
            Err(e) if !e.is_absent() => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Writes dirty entries to the table. With `sync`, also flushes the log.
    pub fn flush(&self, sync: bool) -> CoreResult<()> {
        let dirty: Vec<(String, SizeInfo)> = {
            let mut cache = self.cache.lock();
            cache
                .iter_mut()
                .filter(|(_, entry)| entry.dirty)
                .map(|(uri, entry)| {
                    entry.dirty = false;
                    (uri.clone(), entry.info)
                })
                .collect()
        };

        let mut session = self.session.lock();
        for (uri, info) in &dirty {
            session.insert(SIZE_STORER_URI, uri, &info.encode())?;
        }
        if sync {
            session.log_flush("sync=on")?;
        }
        debug!(entries = dirty.len(), sync, "flushed size storer");
        Ok(())
    }

    /// Drops the cache and reloads every entry from the table.
    pub fn reset(&self) -> CoreResult<()> {
        let mut loaded = HashMap::new();
        {
            let mut session = self.session.lock();
            for row in session.scan(SIZE_STORER_URI)? {
                let (uri, bytes) = row?;
                let info = SizeInfo::decode(&uri, &bytes)?;
                loaded.insert(uri, Entry { info, dirty: false });
            }
        }
        *self.cache.lock() = loaded;
        Ok(())
    }
}

impl std::fmt::Debug for SizeStorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeStorer")
            .field("cached", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}
