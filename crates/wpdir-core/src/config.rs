//! Configuration management for wpdir.
//!
//! Configuration is stored in TOML format in a platform-appropriate location.
//! Fan-out width, the match cap and poll intervals are all set here.

use crate::error::{Result, WpdirError};
use crate::retry::RetryPolicy;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure for wpdir.
///
/// ## Example Configuration File (wpdir.toml)
///
/// ```toml
/// [general]
/// data_dir = "/var/lib/wpdir"
/// log_level = "info"
///
/// [update]
/// workers = 4
/// changelog_interval_secs = 900
/// refresh_interval_secs = 172800
///
/// [search]
/// workers = 6
/// match_cap = 100000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Update pipeline tuning
    pub update: UpdateConfig,

    /// Search engine tuning
    pub search: SearchConfig,
}

/// General configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Working data location (None = platform data directory)
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            data_dir: None,
            log_level: "info".to_string(),
        }
    }
}

/// Update pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Number of update worker threads
    pub workers: usize,

    /// Capacity of the shared update queue
    pub queue_capacity: usize,

    /// Seconds between changelog checks
    pub changelog_interval_secs: u64,

    /// Seconds between full metadata refreshes
    pub refresh_interval_secs: u64,

    /// Metadata fetch attempts before giving up
    pub metadata_attempts: u32,

    /// Seconds to sleep between metadata attempts
    pub metadata_retry_sleep_secs: u64,

    /// Overall metadata fetch budget in seconds
    pub metadata_timeout_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            workers: 4,
            queue_capacity: 200_000,
            changelog_interval_secs: 15 * 60,
            refresh_interval_secs: 48 * 60 * 60,
            metadata_attempts: 3,
            metadata_retry_sleep_secs: 5,
            metadata_timeout_secs: 15,
        }
    }
}

impl UpdateConfig {
    pub fn changelog_interval(&self) -> Duration {
        Duration::from_secs(self.changelog_interval_secs.max(1))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    /// Retry policy applied to metadata refreshes.
    pub fn metadata_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.metadata_attempts,
            Duration::from_secs(self.metadata_retry_sleep_secs),
            Duration::from_secs(self.metadata_timeout_secs),
        )
    }
}

/// Search engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Concurrent package searches per sweep
    pub workers: usize,

    /// Hard cap on total matches reported by one search
    pub match_cap: u64,

    /// Capacity of the pending search queue
    pub queue_capacity: usize,

    /// Characters of matched line text kept per match
    pub line_display_len: usize,

    /// Upper bound on the lines of context a search may request
    pub max_lines_of_context: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            workers: 6,
            match_cap: 100_000,
            queue_capacity: 100,
            line_display_len: 100,
            max_lines_of_context: 2,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default config if no config file exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Config::default());
        }

        info!(path = %path.display(), "Loading configuration");
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents).map_err(|e| WpdirError::ConfigError {
            reason: format!("Failed to parse config: {}", e),
        })?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        info!(path = %path.display(), "Saving configuration");
        let contents = toml::to_string_pretty(self).map_err(|e| WpdirError::ConfigError {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values that would stall the pipeline.
    pub fn validate(&self) -> Result<()> {
        let zero = |name: &str| WpdirError::ConfigError {
            reason: format!("{} must be greater than zero", name),
        };
        if self.update.workers == 0 {
            return Err(zero("update.workers"));
        }
        if self.update.queue_capacity == 0 {
            return Err(zero("update.queue_capacity"));
        }
        if self.update.metadata_attempts == 0 {
            return Err(zero("update.metadata_attempts"));
        }
        if self.search.workers == 0 {
            return Err(zero("search.workers"));
        }
        if self.search.queue_capacity == 0 {
            return Err(zero("search.queue_capacity"));
        }
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "wpdir").ok_or_else(|| WpdirError::ConfigError {
            reason: "Could not determine config directory".to_string(),
        })?;

        Ok(dirs.config_dir().join("wpdir.toml"))
    }

    /// Get the data directory (from config or platform default).
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.general.data_dir {
            return Ok(path.clone());
        }
        let dirs = ProjectDirs::from("", "", "wpdir").ok_or_else(|| WpdirError::ConfigError {
            reason: "Could not determine data directory".to_string(),
        })?;

        Ok(dirs.data_dir().to_path_buf())
    }

    /// Root of all on-disk index generations.
    pub fn index_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("index"))
    }

    /// Location of the directory-backed key-value store.
    pub fn db_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("db"))
    }
}
