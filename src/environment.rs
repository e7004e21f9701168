//! Snapshot of the process environment used as configuration input.
//!
//! Skip directives and agent discovery variables are read from a snapshot
//! captured once and handed to the stage controller and provisioning driver,
//! so tests can substitute a synthetic environment instead of mutating the
//! real one.

use std::collections::BTreeMap;
use std::env;

/// Immutable view of environment variables.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// Captures the current process environment.
    ///
    /// Variables whose name or value is not valid Unicode are converted
    /// lossily.
    #[must_use]
    pub fn from_process() -> Self {
        let vars = env::vars_os()
            .map(|(key, value)| {
                (
                    key.to_string_lossy().into_owned(),
                    value.to_string_lossy().into_owned(),
                )
            })
            .collect();
        Self { vars }
    }

    /// Builds a snapshot from explicit key/value pairs.
    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let vars = pairs
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        Self { vars }
    }

    /// Returns an empty snapshot.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the value of `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Returns a copy of the snapshot with `key` set to `value`.
    #[must_use]
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Interprets `key` as a boolean flag.
    ///
    /// Returns [`Flag::Unset`] when the variable is absent or blank.
    #[must_use]
    pub fn flag(&self, key: &str) -> Flag {
        self.get(key).map_or(Flag::Unset, Flag::parse)
    }
}

/// Result of interpreting an environment variable as a boolean flag.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Flag {
    /// Variable is absent or blank.
    Unset,
    /// Variable holds `true`, `1` or `yes` (case-insensitive).
    Enabled,
    /// Variable holds any other value; the raw value is kept for reporting.
    Disabled(String),
}

impl Flag {
    fn parse(raw: &str) -> Self {
        let value = raw.trim();
        if value.is_empty() {
            return Self::Unset;
        }
        if ["true", "1", "yes"]
            .iter()
            .any(|accepted| value.eq_ignore_ascii_case(accepted))
        {
            Self::Enabled
        } else {
            Self::Disabled(value.to_owned())
        }
    }

    /// Returns `true` for [`Flag::Enabled`].
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}
