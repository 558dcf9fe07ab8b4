//! Configuration for the property store and the resource allocator.
//!
//! Settings are layered with priority:
//! 1. Default values (hardcoded)
//! 2. An optional TOML file
//! 3. Environment variables prefixed `PROPSTORE__` (highest priority),
//!    e.g. `PROPSTORE__STORE__POLL_INTERVAL_MS=100`

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::property_file::DEFAULT_POLL_INTERVAL;

/// Backing file and change detection settings.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Location of the shared properties file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Background check interval for external edits (unit: milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on waiting for a file lock (unit: milliseconds).
    /// Unset means wait indefinitely.
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_timeout_ms: None,
        }
    }
}

/// Resource allocation tuning.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct AllocatorConfig {
    /// Fraction of a pool's combinations that may be rejected before random
    /// probing is abandoned in favour of a sequential walk
    #[serde(default = "default_random_exhaustion_ratio")]
    pub random_exhaustion_ratio: f64,

    /// Number of resources requested when the caller does not say
    #[serde(default = "default_minimum")]
    pub default_minimum: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            random_exhaustion_ratio: default_random_exhaustion_ratio(),
            default_minimum: default_minimum(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
}

impl Settings {
    /// Load settings from defaults, an optional file and the environment.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix("PROPSTORE")
                    .prefix_separator("__")
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("dss.properties")
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}
fn default_random_exhaustion_ratio() -> f64 {
    0.4
}
fn default_minimum() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.store.poll_interval(), Duration::from_millis(50));
        assert!(settings.store.lock_timeout().is_none());
        assert_eq!(settings.allocator.default_minimum, 10);
        assert!((settings.allocator.random_exhaustion_ratio - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"[store]
path = "/var/run/dss.properties"
lock_timeout_ms = 250

[allocator]
default_minimum = 4"#
        )
        .unwrap();

        let settings = Settings::load(file.path().to_str()).unwrap();
        assert_eq!(settings.store.path, PathBuf::from("/var/run/dss.properties"));
        assert_eq!(settings.store.lock_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(settings.store.poll_interval_ms, 50);
        assert_eq!(settings.allocator.default_minimum, 4);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(Settings::load(Some("/nonexistent/propstore-settings")).is_err());
    }
}
