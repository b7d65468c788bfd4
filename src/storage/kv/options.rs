use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::sys;

const GIB: u64 = 1024 * 1024 * 1024;

/// Options for opening a storage engine, loadable from TOML.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Data directory.
    pub db_path: PathBuf,
    /// Name looked up in the storage engine registry.
    pub engine: String,
    /// Keep a commit journal under `<db_path>/journal`.
    pub durable: bool,
    /// Overrides the memory-derived cache budget.
    pub cache_size_gb: Option<u64>,
    /// Upper bound on concurrently open sessions.
    pub session_max: usize,
    /// Collect engine statistics.
    pub statistics: bool,
    /// Seconds between checkpoints; zero disables.
    pub checkpoint_wait_secs: u64,
    /// Journal bytes that trigger a checkpoint; zero disables.
    pub checkpoint_log_size_bytes: u64,
    /// Appended verbatim to the engine open configuration.
    pub engine_config: String,
    /// Appended to every record store's create configuration.
    pub collection_config: String,
    /// Appended to every index's create configuration.
    pub index_config: String,
    /// Longest gap between background size syncs.
    pub size_sync_interval_ms: u64,
    /// Record-store hits between background size syncs.
    pub size_sync_hits: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/db"),
            engine: "dusk".to_string(),
            durable: true,
            cache_size_gb: None,
            session_max: 20_000,
            statistics: true,
            checkpoint_wait_secs: 60,
            checkpoint_log_size_bytes: 2 * GIB,
            engine_config: String::new(),
            collection_config: String::new(),
            index_config: String::new(),
            size_sync_interval_ms: 60_000,
            size_sync_hits: 100_000,
        }
    }
}

impl StorageOptions {
    /// Defaults rooted at `db_path`.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Reads options from a TOML file; absent keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let options: StorageOptions =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        options.validate()?;
        Ok(options)
    }

    /// Checks value ranges and the engine name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_max == 0 {
            return Err(ConfigError::Invalid {
                field: "session_max",
                value: self.session_max.to_string(),
            });
        }
        if self.cache_size_gb == Some(0) {
            return Err(ConfigError::Invalid {
                field: "cache_size_gb",
                value: "0".to_string(),
            });
        }
        if self.engine.is_empty() {
            return Err(ConfigError::Invalid {
                field: "engine",
                value: String::new(),
            });
        }
        Ok(())
    }

    /// Cache budget in GiB: the override, else a tenth of physical memory.
    pub fn cache_size_gb(&self) -> u64 {
        self.cache_size_gb
            .unwrap_or_else(|| cache_size_from_memory(sys::physical_memory_bytes()))
    }

    /// `size_sync_interval_ms` as a duration.
    pub fn size_sync_interval(&self) -> Duration {
        Duration::from_millis(self.size_sync_interval_ms)
    }

    /// Engine open configuration string.
    pub fn open_config(&self) -> String {
        let mut config = String::from("create,");
        config.push_str(&format!("cache_size={}G,", self.cache_size_gb()));
        config.push_str(&format!("session_max={},", self.session_max));
        config.push_str("extensions=[local=(entry=index_collator_extension)],");
        if self.statistics {
            config.push_str("statistics=(all),");
        }
        if self.durable {
            config.push_str("log=(enabled=true,archive=true,path=journal),");
        }
        config.push_str(&format!(
            "checkpoint=(wait={},log_size={}),",
            self.checkpoint_wait_secs,
            format_size(self.checkpoint_log_size_bytes)
        ));
        config.push_str(&self.engine_config);
        config
    }
}

/// One tenth of `total` bytes in whole GiB, never below 1.
pub fn cache_size_from_memory(total: Option<u64>) -> u64 {
    match total {
        Some(bytes) if bytes > 0 => (bytes / 10 / GIB).max(1),
        _ => 1,
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(GIB, "GB"), (1024 * 1024, "MB"), (1024, "KB")];
    for (unit, suffix) in UNITS {
        if bytes >= unit && bytes % unit == 0 {
            return format!("{}{suffix}", bytes / unit);
        }
    }
    bytes.to_string()
}

/// Errors raised while loading [`StorageOptions`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read storage config {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },
    /// The config file is not valid TOML for these options.
    #[error("failed to parse storage config {path}: {source}")]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// A field failed validation.
    #[error("storage option '{field}' has invalid value '{value}'")]
    Invalid {
        /// Option name.
        field: &'static str,
        /// Offending value as text.
        value: String,
    },
}
