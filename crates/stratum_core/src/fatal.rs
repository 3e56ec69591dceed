//! Invariant violations.
//!
//! Some states mean the durability guarantees are already broken, for example
//! a stable timestamp ahead of what the engine has made durable. Continuing
//! could persist an inconsistent checkpoint, so these paths log and panic.
//! Release builds abort on panic.

use std::fmt::Display;

/// Logs `message` under `id` and panics.
#[track_caller]
pub fn fatal(id: u32, message: impl Display) -> ! {
    tracing::error!(id, "fatal: {message}");
    panic!("fatal error {id}: {message}");
}

/// Panics through [`fatal`] when `condition` does not hold.
#[track_caller]
pub fn invariant(condition: bool, id: u32, message: impl FnOnce() -> String) {
    if !condition {
        fatal(id, message());
    }
}
