//! Init command implementation.

use super::Target;
use crate::error::CliResult;

/// Creates the data directory and, if encryption is configured, its key
/// store.
pub fn run(target: &Target) -> CliResult<()> {
    let engine = target.open()?;
    match engine.key_store() {
        Some(store) if store.just_created() => {
            println!("Created key store at {}", store.path().display());
        }
        Some(store) => println!("Key store already present at {}", store.path().display()),
        None => println!("Encryption is not configured"),
    }
    engine.shutdown()?;
    println!("Initialized {}", target.path().display());
    Ok(())
}
