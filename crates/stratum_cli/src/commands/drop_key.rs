//! Drop-key command implementation.

use super::Target;
use crate::error::{CliError, CliResult};

/// Deletes the data key of `db`. Returns whether a key existed.
pub fn run(target: &Target, db: &str) -> CliResult<bool> {
    target.require_encryption("drop-key")?;
    let engine = target.open()?;
    let store = engine
        .key_store()
        .ok_or(CliError::EncryptionRequired { command: "drop-key" })?;

    let existed = store.key_ids()?.iter().any(|id| id == db);
    engine.drop_database_keys(db);
    engine.shutdown()?;

    if existed {
        println!("Dropped key for {db}");
    } else {
        println!("No key stored for {db}");
    }
    Ok(existed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::key_file_target;
    use crate::commands::TargetOptions;
    use tempfile::tempdir;

    #[test]
    fn drops_only_the_named_key() {
        let dir = tempdir().unwrap();
        let target = key_file_target(dir.path());
        {
            let engine = target.open().unwrap();
            let store = engine.key_store().unwrap();
            store.get_key_by_id("db1").unwrap();
            store.get_key_by_id("db2").unwrap();
        }

        assert!(run(&target, "db1").unwrap());
        assert!(!run(&target, "db1").unwrap());

        let engine = target.open().unwrap();
        assert_eq!(engine.key_store().unwrap().key_ids().unwrap(), vec!["db2"]);
    }

    #[test]
    fn needs_encryption() {
        let dir = tempdir().unwrap();
        let target = Target::resolve(
            &TargetOptions {
                path: Some(dir.path().to_path_buf()),
                ..TargetOptions::default()
            },
            "drop-key",
        )
        .unwrap();
        assert!(matches!(
            run(&target, "db1"),
            Err(CliError::EncryptionRequired { .. })
        ));
    }
}
