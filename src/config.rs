//! Configuration management for runlimit.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `RUNLIMIT_*` environment variables (`__` separates nested keys, e.g.
//! `RUNLIMIT_STORE__LOCK_TIMEOUT_MS`). The binary applies its command-line
//! flags on top of the result.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LimiterError, Result};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "RUNLIMIT";

/// Longest lock wait accepted, in milliseconds (one hour).
pub const MAX_LOCK_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// Main configuration for the limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Ledger store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Maximum identifier length, in characters, after trimming
    #[serde(default = "default_max_identifier_len")]
    pub max_identifier_len: usize,

    /// Optional append-only log of every attempt outcome
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            max_identifier_len: default_max_identifier_len(),
            audit_log: None,
        }
    }
}

/// Ledger store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the ledger document; the lock file sits next to it
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Upper bound on waiting for the store lock, in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Base delay between lock attempts, in milliseconds
    #[serde(default = "default_lock_poll_interval_ms")]
    pub lock_poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_poll_interval_ms: default_lock_poll_interval_ms(),
        }
    }
}

impl StoreConfig {
    /// Store configuration rooted at `path` with default timings.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Lock wait, clamped to [`MAX_LOCK_TIMEOUT_MS`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms.min(MAX_LOCK_TIMEOUT_MS))
    }

    /// Poll delay, never longer than the lock wait.
    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms).min(self.lock_timeout())
    }
}

fn default_store_path() -> PathBuf {
    std::env::temp_dir().join("runlimit").join("ledger.json")
}

fn default_lock_timeout_ms() -> u64 {
    3000
}

fn default_lock_poll_interval_ms() -> u64 {
    10
}

fn default_max_identifier_len() -> usize {
    128
}

impl LimiterConfig {
    /// Configuration with defaults everywhere except the store path.
    pub fn with_store_path(path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig::at(path),
            ..Self::default()
        }
    }

    /// Load configuration from defaults, an optional YAML file, and the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::layered(
            path,
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
    }

    fn layered(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        let config: LimiterConfig = builder
            .add_source(env)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LimiterError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the limiter unusable.
    pub fn validate(&self) -> Result<()> {
        if self.store.lock_timeout_ms == 0 {
            return Err(LimiterError::Config(
                "store.lock_timeout_ms must be positive".to_string(),
            ));
        }
        if self.store.lock_timeout_ms > MAX_LOCK_TIMEOUT_MS {
            return Err(LimiterError::Config(format!(
                "store.lock_timeout_ms must be at most {}",
                MAX_LOCK_TIMEOUT_MS
            )));
        }
        if self.store.lock_poll_interval_ms == 0 {
            return Err(LimiterError::Config(
                "store.lock_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.store.lock_poll_interval_ms > self.store.lock_timeout_ms {
            return Err(LimiterError::Config(
                "store.lock_poll_interval_ms must not exceed store.lock_timeout_ms".to_string(),
            ));
        }
        if self.max_identifier_len == 0 {
            return Err(LimiterError::Config(
                "max_identifier_len must be positive".to_string(),
            ));
        }
        if self.store.path.as_os_str().is_empty() {
            return Err(LimiterError::Config("store.path must not be empty".to_string()));
        }
        Ok(())
    }

    /// Render the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| LimiterError::Config(e.to_string()))
    }
}
