//! Core type definitions for Stratum.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical clock value.
///
/// The high 32 bits count seconds and the low 32 bits an increment within
/// the second. `0` is the null timestamp and `u64::MAX` means "no limit".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The null (unset) timestamp.
    pub const NULL: Self = Self(0);
    /// The smallest timestamp.
    pub const MIN: Self = Self(0);
    /// The largest timestamp.
    pub const MAX: Self = Self(u64::MAX);
    /// Initial-data sentinel meaning "no consistent snapshot yet"; checkpoints
    /// ignore the stable timestamp while it is set.
    pub const ALLOW_UNSTABLE_CHECKPOINTS: Self = Self(1);

    /// Creates a timestamp from seconds and an increment.
    #[must_use]
    pub const fn new(secs: u32, inc: u32) -> Self {
        Self(((secs as u64) << 32) | inc as u64)
    }

    /// Creates a timestamp from its raw value.
    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Seconds component.
    #[must_use]
    pub const fn secs(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Increment component.
    #[must_use]
    pub const fn inc(self) -> u32 {
        self.0 as u32
    }

    /// Returns true for the null timestamp.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Lowercase hex, as the engine timestamp protocol expects.
    #[must_use]
    pub fn to_hex(self) -> String {
        format!("{:x}", self.0)
    }

    /// Parses an engine hex timestamp.
    pub fn from_hex(hex: &str) -> CoreResult<Self> {
        u64::from_str_radix(hex.trim(), 16)
            .map(Self)
            .map_err(|_| CoreError::invalid_argument(format!("invalid hex timestamp {hex:?}")))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs(), self.inc())
    }
}
