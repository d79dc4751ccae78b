//! Application configuration management.
//!
//! Settings are layered with figment, later layers winning:
//!
//! 1. Built-in defaults ([`Config::default`])
//! 2. The TOML config file (platform config dir, or `--config`)
//! 3. `MODCACHE_*` environment variables (e.g. `MODCACHE_QUOTA_BYTES`)
//! 4. CLI flags, applied by the caller after loading
//!
//! # Example
//!
//! ```no_run
//! use modcache::config::Config;
//!
//! let config = Config::load().unwrap_or_default();
//! println!("{} downloads in parallel", config.parallel_downloads);
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use directories::ProjectDirs;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::governor::{
    CompactionHook, ExternalCompaction, NoCompaction, SizeGovernor, DEFAULT_BUFFER_RATIO,
};
use crate::index::Roots;
use crate::monitor::MonitorSettings;
use crate::scanner::{WalkerConfig, DEFAULT_EXCLUDED_FOLDERS, DEFAULT_EXTENSIONS};
use crate::transfer::TransferConfig;

/// Prefix of environment variables read by [`Config::load`].
pub const ENV_PREFIX: &str = "MODCACHE_";

/// File name of the index inside the data directory.
pub const INDEX_FILE_NAME: &str = "index.txt";

const CONFIG_FILE_NAME: &str = "config.toml";

/// Accepted shape of an extension once a leading dot is stripped.
const EXTENSION_PATTERN: &str = r"^[A-Za-z0-9_]{1,16}$";

/// Errors raised while loading, validating or saving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A layer could not be parsed or had the wrong shape.
    #[error("Invalid configuration: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// A value parsed but is out of range.
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The platform directories could not be determined.
    #[error("Failed to determine project directories")]
    NoProjectDirs,

    /// The config file could not be written.
    #[error("Failed to write config file {path}: {source}")]
    Write {
        /// Target path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config could not be serialized.
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the user's installed mods.
    pub mod_root: Option<PathBuf>,
    /// Root of the downloaded-asset cache.
    pub cache_root: Option<PathBuf>,
    /// Index file location; defaults to the platform data directory.
    pub index_path: Option<PathBuf>,
    /// Cache quota in bytes; no eviction when unset.
    pub quota_bytes: Option<u64>,
    /// Share of the quota kept free after eviction.
    pub quota_buffer_ratio: f64,
    /// Mod-root extensions that are indexed.
    pub extensions: Vec<String>,
    /// Mod-root folder names that are skipped.
    pub excluded_folders: Vec<String>,
    /// Quiet period before mod-root changes are applied.
    pub mod_debounce_ms: u64,
    /// Quiet period before cache-root changes are applied.
    pub cache_debounce_ms: u64,
    /// Simultaneous downloads.
    pub parallel_downloads: usize,
    /// Seconds an uploaded hash stays verified.
    pub verification_window_secs: u64,
    /// Seconds between periodic full scans; 0 disables them.
    pub full_scan_interval_secs: u64,
    /// Whether the cache root is compacted after writes.
    pub compaction: bool,
    /// Scan worker threads; defaults to half the cores, clamped to 2..=8.
    pub scan_threads: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mod_root: None,
            cache_root: None,
            index_path: None,
            quota_bytes: None,
            quota_buffer_ratio: DEFAULT_BUFFER_RATIO,
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| (*s).to_string()).collect(),
            excluded_folders: DEFAULT_EXCLUDED_FOLDERS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            mod_debounce_ms: 10_000,
            cache_debounce_ms: 1_000,
            parallel_downloads: crate::transfer::DEFAULT_PARALLEL_DOWNLOADS,
            verification_window_secs: 600,
            full_scan_interval_secs: 30 * 60,
            compaction: false,
            scan_threads: None,
        }
    }
}

impl Config {
    /// Load from the default config file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer is malformed or a value is out of range.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path().ok();
        Self::load_from(path.as_deref())
    }

    /// Load with `file` as the TOML layer. A missing file is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer is malformed or a value is out of range.
    pub fn load_from(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = file {
            log::debug!("Reading config layer {}", path.display());
            figment = figment.merge(Toml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.quota_buffer_ratio) {
            return Err(ConfigError::Invalid {
                field: "quota_buffer_ratio",
                reason: format!("{} is not in [0, 1)", self.quota_buffer_ratio),
            });
        }
        if self.parallel_downloads == 0 {
            return Err(ConfigError::Invalid {
                field: "parallel_downloads",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.scan_threads == Some(0) {
            return Err(ConfigError::Invalid {
                field: "scan_threads",
                reason: "must be at least 1".to_string(),
            });
        }
        let extension = Regex::new(EXTENSION_PATTERN).map_err(|e| ConfigError::Invalid {
            field: "extensions",
            reason: e.to_string(),
        })?;
        if let Some(bad) = self
            .extensions
            .iter()
            .find(|ext| !extension.is_match(ext.trim_start_matches('.')))
        {
            return Err(ConfigError::Invalid {
                field: "extensions",
                reason: format!("'{bad}' is not a plain file extension"),
            });
        }
        Ok(())
    }

    /// Write this config as TOML to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        let write = |path: &Path| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, content.as_bytes())
        };
        write(path).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default platform-specific config file path.
    ///
    /// # Errors
    ///
    /// Returns an error if no home directory can be determined.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(project_dirs()?.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Configured index path, or `index.txt` in the platform data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is configured and no home directory exists.
    pub fn resolved_index_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.index_path {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().join(INDEX_FILE_NAME)),
        }
    }

    /// The two roots as configured.
    #[must_use]
    pub fn roots(&self) -> Roots {
        Roots::new(self.mod_root.clone(), self.cache_root.clone())
    }

    /// Candidate filters.
    #[must_use]
    pub fn walker_config(&self) -> WalkerConfig {
        WalkerConfig::new(self.extensions.clone(), self.excluded_folders.clone())
    }

    #[must_use]
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            walker: self.walker_config(),
            mod_debounce: Duration::from_millis(self.mod_debounce_ms),
            cache_debounce: Duration::from_millis(self.cache_debounce_ms),
            full_scan_interval: (self.full_scan_interval_secs > 0)
                .then(|| Duration::from_secs(self.full_scan_interval_secs)),
            scan_threads: self.scan_threads,
        }
    }

    #[must_use]
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            parallel_downloads: self.parallel_downloads,
            verification_window: Duration::from_secs(self.verification_window_secs),
            ..TransferConfig::default()
        }
    }

    /// The compaction hook selected by `compaction`.
    #[must_use]
    pub fn compaction_hook(&self) -> Arc<dyn CompactionHook> {
        if self.compaction {
            Arc::new(ExternalCompaction)
        } else {
            Arc::new(NoCompaction)
        }
    }

    /// A governor for the cache root, if both a cache root and a quota are set.
    #[must_use]
    pub fn governor(&self) -> Option<SizeGovernor> {
        let cache_root = self.cache_root.as_deref()?;
        let quota = self.quota_bytes?;
        Some(
            SizeGovernor::new(cache_root, quota)
                .with_buffer_ratio(self.quota_buffer_ratio)
                .with_compaction(self.compaction_hook()),
        )
    }
}

fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("com", "modcache", "modcache").ok_or(ConfigError::NoProjectDirs)
}
