//! Durable file system helpers.

use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Renames `from` to `to` and syncs the parent directories.
pub fn fsync_rename(from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to)?;
    if let Some(parent) = to.parent() {
        sync_directory(parent)?;
    }
    if let Some(parent) = from.parent() {
        if Some(parent) != to.parent() {
            sync_directory(parent)?;
        }
    }
    Ok(())
}

/// Flushes directory entries to disk.
#[cfg(unix)]
pub fn sync_directory(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Flushes directory entries to disk.
#[cfg(not(unix))]
pub fn sync_directory(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rename_moves_file() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        fs::write(&from, b"x").unwrap();
        fsync_rename(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"x");
    }
}
