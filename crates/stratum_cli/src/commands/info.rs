//! Info command implementation.

use super::Target;
use crate::error::CliResult;
use serde::Serialize;
use stratum_core::keystore::ROTATED_DIR;
use stratum_core::Timestamp;
use stratum_storage::KvEngine;

/// Data directory summary.
#[derive(Debug, Serialize)]
pub struct InfoResult {
    /// Data directory.
    pub path: String,
    /// Checkpoint the engine recovered from.
    pub recovery: Option<Timestamp>,
    /// Stable timestamp after startup.
    pub stable: Timestamp,
    /// Oldest timestamp after startup.
    pub oldest: Timestamp,
    /// Key store details, when encryption is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_store: Option<KeyStoreInfo>,
    /// Whether a store replaced by rotation is still on disk.
    pub rotated_store_present: bool,
}

/// Key store summary.
#[derive(Debug, Serialize)]
pub struct KeyStoreInfo {
    /// Key store directory.
    pub path: String,
    /// Namespaces with a data key.
    pub key_ids: Vec<String>,
    /// Persisted nonce bound.
    pub reserved_iv: u128,
    /// Next nonce.
    pub iv_counter: u128,
}

/// Opens the data directory and summarizes it.
pub fn collect(target: &Target) -> CliResult<InfoResult> {
    let engine = target.open()?;
    let timestamps = engine.timestamps();
    let key_store = match engine.key_store() {
        Some(store) => Some(KeyStoreInfo {
            path: store.path().display().to_string(),
            key_ids: store.key_ids()?,
            reserved_iv: store.reserved_iv(),
            iv_counter: store.iv_counter(),
        }),
        None => None,
    };
    let result = InfoResult {
        path: engine.engine().home().display().to_string(),
        recovery: timestamps.recovery(),
        stable: timestamps.stable(),
        oldest: timestamps.oldest(),
        key_store,
        rotated_store_present: target.path().join(ROTATED_DIR).exists(),
    };
    engine.shutdown()?;
    Ok(result)
}

/// Runs the info command.
pub fn run(target: &Target, format: &str) -> CliResult<()> {
    let result = collect(target)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InfoResult) {
    println!("Data directory: {}", result.path);
    match result.recovery {
        Some(ts) => println!("  Recovered from: {ts}"),
        None => println!("  Recovered from: (no stable checkpoint)"),
    }
    println!("  Stable:         {}", result.stable);
    println!("  Oldest:         {}", result.oldest);

    match &result.key_store {
        Some(store) => {
            println!();
            println!("Key store: {}", store.path);
            println!("  Keys:           {}", store.key_ids.len());
            for id in &store.key_ids {
                println!("    {id}");
            }
            println!("  Reserved IV:    {}", store.reserved_iv);
            println!("  Next IV:        {}", store.iv_counter);
        }
        None => println!("Encryption is not configured"),
    }
    if result.rotated_store_present {
        println!("A key store replaced by rotation is still present");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::key_file_target;
    use tempfile::tempdir;

    #[test]
    fn reports_keys_and_reserved_nonces() {
        let dir = tempdir().unwrap();
        let target = key_file_target(dir.path());
        {
            let engine = target.open().unwrap();
            engine.key_store().unwrap().get_key_by_id("db1").unwrap();
            let sealed = engine
                .encryption_hooks()
                .unwrap()
                .encrypt("db1", b"page")
                .unwrap();
            assert!(!sealed.is_empty());
        }

        let info = collect(&target).unwrap();
        let store = info.key_store.unwrap();
        assert_eq!(store.key_ids, vec!["db1"]);
        assert!(store.reserved_iv > 0);
        assert_eq!(store.iv_counter, store.reserved_iv);
        assert!(info.recovery.is_none());
        assert!(!info.rotated_store_present);
    }

    #[test]
    fn json_output_omits_missing_key_store() {
        let dir = tempdir().unwrap();
        let target = Target::resolve(
            &crate::commands::TargetOptions {
                path: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
            "info",
        )
        .unwrap();
        let rendered = serde_json::to_string(&collect(&target).unwrap()).unwrap();
        assert!(!rendered.contains("key_store"));
    }
}
