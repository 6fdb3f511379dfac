//! refsync configuration loading
//!
//! Loads configuration from `~/.config/refsync/refsync.toml` (or `REFSYNC_CONFIG` env).

use crate::category::Category;
use crate::errors::{RefSyncError, Result};
use crate::lock::{DEFAULT_ATTEMPT_TIMEOUT_SECS, DEFAULT_BACKOFF_CAP_SECS, LockRetryPolicy};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RefSyncConfig {
    /// Path to the SQLite store
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Store instance id folded into lock names; defaults to the db file stem
    #[serde(default)]
    pub store_instance: Option<String>,

    /// Lock retry settings
    #[serde(default)]
    pub lock: LockConfig,

    /// External loader per category
    #[serde(default)]
    pub loaders: BTreeMap<Category, LoaderConfig>,
}

fn default_db_path() -> String {
    dirs::home_dir()
        .map(|h| {
            h.join(".local")
                .join("share")
                .join("refsync")
                .join("refsync.db")
                .to_string_lossy()
                .into_owned()
        })
        .unwrap_or_else(|| "refsync.db".to_string())
}

/// Lock retry configuration
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LockConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// 0 disables waiting entirely
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_delay_secs() -> u64 {
    30
}
fn default_attempt_timeout_secs() -> u64 {
    DEFAULT_ATTEMPT_TIMEOUT_SECS
}
fn default_backoff_cap_secs() -> u64 {
    DEFAULT_BACKOFF_CAP_SECS
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay_secs(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

impl LockConfig {
    pub fn retry_policy(&self) -> LockRetryPolicy {
        LockRetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay_secs: self.initial_delay_secs,
            backoff_cap_secs: self.backoff_cap_secs,
            attempt_timeout_secs: self.attempt_timeout_secs,
        }
    }
}

/// External loader command
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Program followed by its arguments
    pub command: Vec<String>,
}

impl Default for RefSyncConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            store_instance: None,
            lock: LockConfig::default(),
            loaders: BTreeMap::new(),
        }
    }
}

impl RefSyncConfig {
    /// Environment variable for config path override
    pub const ENV_CONFIG_PATH: &'static str = "REFSYNC_CONFIG";

    /// Default config filename
    pub const DEFAULT_CONFIG_FILENAME: &'static str = "refsync.toml";

    /// Load configuration from file
    ///
    /// Resolution order:
    /// 1. `REFSYNC_CONFIG` environment variable
    /// 2. `~/.config/refsync/refsync.toml`
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::resolve_config_path();

        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "refsync config not found, using defaults"
            );
            return Ok(Self::default());
        }

        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RefSyncError::config_with_source(
                format!("failed to read config at {}", path.display()),
                e,
            )
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from TOML string
    pub fn parse(contents: &str) -> Result<Self> {
        let cfg: RefSyncConfig = toml::from_str(contents)
            .map_err(|e| RefSyncError::config_with_source("failed to parse config", e))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }

        dirs::home_dir()
            .map(|h| {
                h.join(".config")
                    .join("refsync")
                    .join(Self::DEFAULT_CONFIG_FILENAME)
            })
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_CONFIG_FILENAME))
    }

    fn validate(&self) -> Result<()> {
        if self.lock.max_attempts == 0 {
            return Err(RefSyncError::config("lock.max_attempts must be at least 1"));
        }
        if self.lock.attempt_timeout_secs == 0 {
            return Err(RefSyncError::config(
                "lock.attempt_timeout_secs must be at least 1",
            ));
        }
        if self.lock.initial_delay_secs == 0 {
            tracing::info!("lock.initial_delay_secs is 0, contended imports fail without waiting");
        }
        if let Some(instance) = &self.store_instance
            && instance.trim().is_empty()
        {
            return Err(RefSyncError::config("store_instance must not be blank"));
        }
        for (category, loader) in &self.loaders {
            if loader.command.is_empty() {
                return Err(RefSyncError::config(format!(
                    "loaders.{category}.command must not be empty"
                )));
            }
        }
        Ok(())
    }

    /// Get the resolved database path (expanding ~ if needed)
    pub fn resolved_db_path(&self) -> PathBuf {
        let path = &self.db_path;
        if let Some(stripped) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(stripped);
        }
        PathBuf::from(path)
    }

    pub fn retry_policy(&self) -> LockRetryPolicy {
        self.lock.retry_policy()
    }
}
