//! Backup commands.
//!
//! `hot-backup` copies a consistent image of the data directory, key store
//! included. `backup-manifest` opens a non-blocking backup under a fresh
//! identifier and lists the byte ranges an external copier would need.

use super::Target;
use crate::error::CliResult;
use serde::Serialize;
use std::path::Path;
use stratum_core::{BackupBlock, BackupOptions, StorageEngine, StreamingCursor};
use tracing::info;
use uuid::Uuid;

/// Copies the data directory into `dest`.
pub fn hot(target: &Target, dest: &Path) -> CliResult<()> {
    info!(src = %target.path().display(), dest = %dest.display(), "starting hot backup");
    let engine = target.open()?;
    engine.backups().hot_backup(dest, || false)?;
    engine.shutdown()?;
    println!("Backup written to {}", dest.display());
    Ok(())
}

/// What to list in a manifest.
#[derive(Debug, Clone)]
pub struct ManifestOptions {
    /// List changed ranges instead of whole files.
    pub incremental: bool,
    /// Identifier of the backup this one builds on.
    pub src_id: Option<String>,
    /// Granularity of changed ranges in megabytes.
    pub block_size_mb: u64,
    /// Blocks fetched per batch.
    pub batch_size: usize,
}

/// A listed backup.
#[derive(Debug, Serialize)]
pub struct Manifest {
    /// Identifier recorded for this backup; later incremental backups pass
    /// it as their source.
    pub backup_id: String,
    /// Source backup, for incremental backups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_id: Option<String>,
    /// Ranges of the data engine.
    pub blocks: Vec<ManifestBlock>,
    /// Ranges of the key store.
    pub key_store_blocks: Vec<ManifestBlock>,
}

/// One range to copy.
#[derive(Debug, Serialize)]
pub struct ManifestBlock {
    /// Absolute file path.
    pub file: String,
    /// Offset of the range.
    pub offset: u64,
    /// Length of the range; zero with zero offset means unchanged.
    pub length: u64,
    /// Size of the file when the backup began.
    pub file_size: u64,
}

impl From<BackupBlock> for ManifestBlock {
    fn from(block: BackupBlock) -> Self {
        Self {
            file: block.file_path.display().to_string(),
            offset: block.offset,
            length: block.length,
            file_size: block.file_size,
        }
    }
}

/// Opens a non-blocking backup, lists every block, then closes it.
pub fn collect_manifest(target: &Target, options: &ManifestOptions) -> CliResult<Manifest> {
    let backup_id = Uuid::new_v4().to_string();
    let mut backup_options = if options.incremental {
        BackupOptions::incremental(backup_id.clone()).block_size_mb(options.block_size_mb)
    } else {
        BackupOptions::full()
    };
    if let Some(src) = &options.src_id {
        backup_options = backup_options.src_backup_name(src.clone());
    }

    let engine = target.open()?;
    let listed = list_blocks(&engine, &backup_options, options.batch_size.max(1));
    engine.shutdown()?;
    let (blocks, key_store_blocks) = listed?;

    Ok(Manifest {
        backup_id,
        src_id: options.src_id.clone(),
        blocks,
        key_store_blocks,
    })
}

fn list_blocks(
    engine: &StorageEngine,
    options: &BackupOptions,
    batch_size: usize,
) -> CliResult<(Vec<ManifestBlock>, Vec<ManifestBlock>)> {
    let backups = engine.backups();
    let mut blocks = Vec::new();
    if let Some(cursor) = backups.begin_non_blocking_backup(options.clone())? {
        let listed = drain(&cursor, batch_size, &mut blocks);
        backups.end_non_blocking_backup();
        listed?;
    }

    let mut key_store_blocks = Vec::new();
    if let Some(store) = engine.key_store() {
        let listed = store.begin_non_blocking_backup(options);
        store.end_non_blocking_backup();
        key_store_blocks.extend(listed?.into_iter().map(ManifestBlock::from));
    }
    Ok((blocks, key_store_blocks))
}

fn drain(
    cursor: &StreamingCursor,
    batch_size: usize,
    blocks: &mut Vec<ManifestBlock>,
) -> CliResult<()> {
    loop {
        let batch = cursor.get_next_batch(batch_size)?;
        if batch.is_empty() {
            return Ok(());
        }
        blocks.extend(batch.into_iter().map(ManifestBlock::from));
    }
}

/// Runs the backup-manifest command.
pub fn manifest(target: &Target, options: &ManifestOptions, format: &str) -> CliResult<()> {
    let manifest = collect_manifest(target, options)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&manifest)?),
        _ => {
            println!("Backup {}", manifest.backup_id);
            if let Some(src) = &manifest.src_id {
                println!("  Source: {src}");
            }
            for (label, blocks) in [
                ("Data", &manifest.blocks),
                ("Key store", &manifest.key_store_blocks),
            ] {
                println!("{label} blocks: {}", blocks.len());
                for block in blocks {
                    if block.offset == 0 && block.length == 0 && options.incremental {
                        println!("  {} (unchanged)", block.file);
                    } else {
                        println!(
                            "  {} offset={} length={} size={}",
                            block.file, block.offset, block.length, block.file_size
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::key_file_target;
    use tempfile::tempdir;

    fn full() -> ManifestOptions {
        ManifestOptions {
            incremental: false,
            src_id: None,
            block_size_mb: 16,
            batch_size: 1,
        }
    }

    #[test]
    fn manifest_lists_both_engines() {
        let dir = tempdir().unwrap();
        let target = key_file_target(dir.path());
        {
            let engine = target.open().unwrap();
            engine.key_store().unwrap().get_key_by_id("db1").unwrap();
        }

        let manifest = collect_manifest(&target, &full()).unwrap();
        assert!(Uuid::parse_str(&manifest.backup_id).is_ok());
        assert!(!manifest.blocks.is_empty());
        assert!(!manifest.key_store_blocks.is_empty());

        let again = collect_manifest(&target, &full()).unwrap();
        assert_ne!(again.backup_id, manifest.backup_id);
    }

    #[test]
    fn hot_backup_copies_key_store() {
        let dir = tempdir().unwrap();
        let target = key_file_target(dir.path());
        let dest = dir.path().join("backup");
        hot(&target, &dest).unwrap();
        assert!(dest.join(stratum_core::keystore::KEY_DB_DIR).is_dir());
    }
}
