//! Vault configuration.
//!
//! Configuration is plain data with defaults. It can be deserialized from
//! JSON, or read from a key/value lookup that uses the legacy setting
//! names:
//!
//! | key | meaning |
//! |---|---|
//! | `perms.precedence` | `U` (user-first) or `G` (group-first) |
//! | `rarLifetime` | restricted-access request lifetime, in minutes |
//! | `user.login_attempts` | failed logins before a user is disabled |
//! | `smtp.enabled` | `Y` or `N`; whether audit notification is on |

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use keyward_perms::Precedence;

pub const KEY_PRECEDENCE: &str = "perms.precedence";
pub const KEY_RA_LIFETIME: &str = "rarLifetime";
pub const KEY_LOGIN_ATTEMPTS: &str = "user.login_attempts";
pub const KEY_NOTIFY: &str = "smtp.enabled";

const MILLIS_PER_MINUTE: i64 = 60_000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A source of configuration values.
pub trait ConfigLookup {
    /// The raw value for `key`, if set.
    fn get(&self, key: &str) -> Option<String>;
}

/// In-memory [`ConfigLookup`].
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    values: HashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, builder style.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ConfigLookup for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Settings for a [`crate::Vault`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Which grant kind wins when a user holds both.
    pub precedence: Precedence,
    /// Restricted-access request lifetime.
    pub ra_lifetime_ms: i64,
    /// Failed logins before a user is disabled. Zero never disables.
    pub max_failed_logins: u32,
    /// Whether appended audit entries go to the notifier.
    pub notify: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            precedence: Precedence::UserFirst,
            ra_lifetime_ms: 10 * MILLIS_PER_MINUTE,
            max_failed_logins: 3,
            notify: true,
        }
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

impl VaultConfig {
    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Overlay values found in `lookup` on the defaults.
    pub fn from_lookup(lookup: &dyn ConfigLookup) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup.get(KEY_PRECEDENCE) {
            config.precedence = value
                .parse()
                .map_err(|_| invalid(KEY_PRECEDENCE, &value))?;
        }

        if let Some(value) = lookup.get(KEY_RA_LIFETIME) {
            let minutes: i64 = value
                .trim()
                .parse()
                .map_err(|_| invalid(KEY_RA_LIFETIME, &value))?;
            if minutes <= 0 {
                return Err(invalid(KEY_RA_LIFETIME, &value));
            }
            config.ra_lifetime_ms = minutes.saturating_mul(MILLIS_PER_MINUTE);
        }

        if let Some(value) = lookup.get(KEY_LOGIN_ATTEMPTS) {
            config.max_failed_logins = value
                .trim()
                .parse()
                .map_err(|_| invalid(KEY_LOGIN_ATTEMPTS, &value))?;
        }

        if let Some(value) = lookup.get(KEY_NOTIFY) {
            config.notify = match value.trim() {
                "Y" | "y" | "true" => true,
                "N" | "n" | "false" => false,
                _ => return Err(invalid(KEY_NOTIFY, &value)),
            };
        }

        Ok(config)
    }
}
