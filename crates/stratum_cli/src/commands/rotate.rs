//! Rotate-master-key command implementation.

use super::Target;
use crate::error::{CliError, CliResult};
use stratum_core::{OpenOutcome, RotationOutcome, StorageEngine};
use tracing::info;

/// Re-encrypts the key store under a new master key.
pub fn run(target: &Target) -> CliResult<RotationOutcome> {
    target.require_encryption("rotate-master-key")?;
    let mut config = target.config.clone();
    if let Some(encryption) = config.encryption.as_mut() {
        encryption.rotate_master_key = true;
    }

    info!(path = %target.path().display(), "rotating master key");
    match StorageEngine::open_durable(config, &target.services())? {
        OpenOutcome::RestartRequired(outcome) => {
            println!("{outcome}");
            Ok(outcome)
        }
        OpenOutcome::Ready(engine) => {
            engine.shutdown()?;
            Err(CliError::RotationSkipped)
        }
    }
}
