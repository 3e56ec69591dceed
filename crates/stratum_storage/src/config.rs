//! Engine configuration strings.
//!
//! Engines are configured with comma-separated `key=value` lists where a value
//! may itself be a parenthesised list, e.g.
//! `incremental=(enabled=true,granularity=16MB,this_id="b1")`.

use crate::error::{StorageError, StorageResult};
use std::fmt;

/// A parsed configuration string, preserving entry order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigString {
    entries: Vec<(String, String)>,
}

impl ConfigString {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on unbalanced parentheses or quotes.
    pub fn parse(input: &str) -> StorageResult<Self> {
        let mut entries = Vec::new();
        for item in split_top_level(input)? {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            match item.split_once('=') {
                Some((key, value)) => {
                    entries.push((key.trim().to_string(), value.trim().to_string()));
                }
                // A bare key is shorthand for `key=true`.
                None => entries.push((item.to_string(), String::from("true"))),
            }
        }
        Ok(Self { entries })
    }

    /// Appends an entry.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.entries.push((key.to_string(), value.into()));
        self
    }

    /// Returns the raw value of the last entry named `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the value with surrounding quotes removed.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).map(unquote)
    }

    /// Interprets a value as a boolean (`true`/`false`/`1`/`0`/`on`/`off`).
    pub fn get_bool(&self, key: &str) -> StorageResult<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some("true" | "1" | "on") => Ok(Some(true)),
            Some("false" | "0" | "off") => Ok(Some(false)),
            Some(other) => Err(StorageError::invalid_argument(format!(
                "{key}: expected a boolean, got {other:?}"
            ))),
        }
    }

    /// Parses a nested `key=(...)` value.
    pub fn nested(&self, key: &str) -> StorageResult<Option<ConfigString>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => {
                let inner = value
                    .strip_prefix('(')
                    .and_then(|v| v.strip_suffix(')'))
                    .unwrap_or(value);
                Self::parse(inner).map(Some)
            }
        }
    }

    /// Parses a hexadecimal timestamp value.
    pub fn get_hex(&self, key: &str) -> StorageResult<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => u64::from_str_radix(value, 16).map(Some).map_err(|_| {
                StorageError::invalid_argument(format!("{key}: invalid hex value {value:?}"))
            }),
        }
    }

    /// Returns true if no entries are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over entries in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for ConfigString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn split_top_level(input: &str) -> StorageResult<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    StorageError::invalid_argument(format!("unbalanced ')' in {input:?}"))
                })?;
            }
            ',' if !quoted && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    if depth != 0 || quoted {
        return Err(StorageError::invalid_argument(format!(
            "unterminated group in {input:?}"
        )));
    }
    parts.push(&input[start..]);
    Ok(parts)
}
