//! Blocking hot backup into a local directory.

use crate::error::{CoreError, CoreResult};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use stratum_storage::{BackupCursor, KvEngine, KvSession, StorageError, LOG_DIR};
use tracing::{debug, info};

/// Storage metadata file copied alongside the engine files when present.
pub const STORAGE_METADATA_FILE: &str = "storage.bson";

const BUFFER_SIZE: usize = 8 * 1024;
const INTERRUPT_SAMPLE_RATE: u32 = 128;

#[derive(Debug)]
struct CopyJob {
    src: PathBuf,
    dest: PathBuf,
    size: u64,
}

/// A backup cursor held open until copying finishes.
struct HeldCursor {
    _cursor: Box<dyn BackupCursor>,
    _session: Box<dyn KvSession>,
}

/// Collects files from one or more engines and copies them.
///
/// Every engine added keeps its backup cursor open until [`HotBackup::copy`]
/// returns, so the listed files stay immutable while they are read.
pub struct HotBackup {
    dest: PathBuf,
    jobs: Vec<CopyJob>,
    held: Vec<HeldCursor>,
    total_bytes: u64,
}

impl HotBackup {
    /// Starts a backup into `dest`.
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self {
            dest: dest.into(),
            jobs: Vec::new(),
            held: Vec::new(),
            total_bytes: 0,
        }
    }

    /// Lists every file of `engine`, resolved under `src_home` and copied
    /// under `dest_home`.
    pub fn add_engine(
        &mut self,
        engine: &dyn KvEngine,
        src_home: &Path,
        dest_home: &Path,
    ) -> CoreResult<()> {
        let mut session = engine.open_session()?;
        session.log_flush("sync=off")?;
        let mut cursor = session.open_backup_cursor("").map_err(|e| match e {
            StorageError::Busy => CoreError::BackupInProgress,
            other => other.into(),
        })?;

        for file in cursor.by_ref() {
            let file = file?;
            let mut src = src_home.join(&file.name);
            let mut dest = dest_home.join(&file.name);
            if !src.exists() {
                src = src_home.join(LOG_DIR).join(&file.name);
                dest = dest_home.join(LOG_DIR).join(&file.name);
                if !src.exists() {
                    return Err(CoreError::InvalidPath { path: src });
                }
            }
            self.push(src, dest)?;
        }

        self.held.push(HeldCursor {
            _cursor: cursor,
            _session: session,
        });
        Ok(())
    }

    /// Adds the storage metadata file from `home`, if it exists.
    pub fn add_metadata(&mut self, home: &Path, dest_home: &Path) -> CoreResult<()> {
        let src = home.join(STORAGE_METADATA_FILE);
        if src.exists() {
            self.push(src, dest_home.join(STORAGE_METADATA_FILE))?;
        }
        Ok(())
    }

    fn push(&mut self, src: PathBuf, dest: PathBuf) -> CoreResult<()> {
        let size = fs::metadata(&src)?.len();
        self.total_bytes += size;
        self.jobs.push(CopyJob { src, dest, size });
        Ok(())
    }

    /// Source files listed so far.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.jobs.iter().map(|job| job.src.as_path())
    }

    /// Bytes that will be copied.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Copies every listed file, then releases the backup cursors.
    ///
    /// `interrupted` is polled on the first read and every 128 reads after.
    pub fn copy(self, interrupted: impl Fn() -> bool) -> CoreResult<()> {
        info!(
            dest = %self.dest.display(),
            files = self.jobs.len(),
            bytes = self.total_bytes,
            "starting hot backup"
        );
        let mut created = HashSet::new();
        created.insert(self.dest.clone());
        fs::create_dir_all(&self.dest)?;

        for job in &self.jobs {
            if let Some(parent) = job.dest.parent() {
                if created.insert(parent.to_path_buf()) {
                    fs::create_dir_all(parent)?;
                }
            }
            copy_file_size(&job.src, &job.dest, job.size, &interrupted)?;
            debug!(file = %job.src.display(), bytes = job.size, "copied");
        }

        info!(dest = %self.dest.display(), "hot backup complete");
        Ok(())
    }
}

impl std::fmt::Debug for HotBackup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotBackup")
            .field("dest", &self.dest)
            .field("jobs", &self.jobs)
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}

/// Copies the first `size` bytes of `src`.
fn copy_file_size(
    src: &Path,
    dest: &Path,
    size: u64,
    interrupted: &impl Fn() -> bool,
) -> CoreResult<()> {
    let mut input = File::open(src)?;
    let mut output = File::create(dest)?;
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut remaining = size;
    let mut sampler = 1;

    while remaining > 0 {
        sampler -= 1;
        if sampler == 0 {
            if interrupted() {
                return Err(CoreError::Interrupted);
            }
            sampler = INTERRUPT_SAMPLE_RATE;
        }
        let n = remaining.min(BUFFER_SIZE as u64) as usize;
        input.read_exact(&mut buf[..n])?;
        output.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    output.sync_all()?;
    Ok(())
}
