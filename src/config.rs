//! Configuration Module
//!
//! Loads cache settings from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Cache period for methods without their own rule
    pub default_period: Duration,
    /// Capacity of the in-memory store
    pub max_entries: usize,
    /// How often the SQLite purge task runs
    pub purge_interval: Duration,
    /// Age after which the purge task deletes SQLite entries
    pub purge_max_age: Duration,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_DEFAULT_PERIOD` - Default cache period in seconds (default: 60)
    /// - `CACHE_MAX_ENTRIES` - In-memory store capacity (default: 1000)
    /// - `CACHE_PURGE_INTERVAL` - Purge frequency in seconds (default: 300)
    /// - `CACHE_PURGE_MAX_AGE` - Purge cutoff age in seconds (default: 3600)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_period: Duration::from_secs(env_or(
                "CACHE_DEFAULT_PERIOD",
                defaults.default_period.as_secs(),
            )),
            max_entries: env_or("CACHE_MAX_ENTRIES", defaults.max_entries),
            purge_interval: Duration::from_secs(env_or(
                "CACHE_PURGE_INTERVAL",
                defaults.purge_interval.as_secs(),
            )),
            purge_max_age: Duration::from_secs(env_or(
                "CACHE_PURGE_MAX_AGE",
                defaults.purge_max_age.as_secs(),
            )),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_period: Duration::from_secs(60),
            max_entries: 1000,
            purge_interval: Duration::from_secs(300),
            purge_max_age: Duration::from_secs(3600),
        }
    }
}
