// File: manager/src/config/mod.rs
pub mod manager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
pub use manager::ConfigManager;

use crate::constants::{chunking, defaults, retention};
use crate::retention::CleanupConfig;
use crate::snapshot::EngineConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub base_dir: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    #[serde(default)]
    pub max_parallel_units: usize,
    pub cleanup_schedule: Option<String>,
    #[serde(default)]
    pub cleanup: CleanupSettings,
    // Populated from individual network config files
    #[serde(skip)]
    pub networks: HashMap<String, NetworkConfig>,
}

fn default_chunk_size() -> u64 {
    chunking::CHUNK_SIZE
}

fn default_compression_level() -> i32 {
    chunking::COMPRESSION_LEVEL
}

impl Config {
    /// Defaults for everything but the base directory; no networks scheduled
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            chunk_size_bytes: default_chunk_size(),
            compression_level: default_compression_level(),
            max_parallel_units: defaults::MAX_PARALLEL_UNITS,
            cleanup_schedule: None,
            cleanup: CleanupSettings::default(),
            networks: HashMap::new(),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            base_dir: self.base_dir.clone(),
            chunk_size: self.chunk_size_bytes,
            compression_level: self.compression_level,
            max_parallel_units: self.max_parallel_units,
        }
    }

    pub fn cleanup_schedule(&self) -> &str {
        self.cleanup_schedule
            .as_deref()
            .unwrap_or(defaults::CLEANUP_SCHEDULE)
    }

    pub fn enabled_networks(&self) -> Vec<&NetworkConfig> {
        let mut networks: Vec<&NetworkConfig> = self.networks.values().filter(|n| n.enabled).collect();
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        networks
    }
}

/// `[cleanup]` section of main.toml; hours keep the file readable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSettings {
    #[serde(default = "default_max_log_size")]
    pub max_log_size_bytes: u64,
    #[serde(default = "default_max_log_age")]
    pub max_log_age_hours: u64,
    #[serde(default = "default_max_backup_age")]
    pub max_backup_age_hours: u64,
    #[serde(default = "default_max_stale_run_age")]
    pub max_stale_run_age_hours: u64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub verbose: bool,
}

fn default_max_log_size() -> u64 {
    retention::MAX_LOG_SIZE
}

fn default_max_log_age() -> u64 {
    retention::MAX_LOG_AGE.as_secs() / 3600
}

fn default_max_backup_age() -> u64 {
    retention::MAX_BACKUP_AGE.as_secs() / 3600
}

fn default_max_stale_run_age() -> u64 {
    retention::MAX_STALE_RUN_AGE.as_secs() / 3600
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            max_log_size_bytes: default_max_log_size(),
            max_log_age_hours: default_max_log_age(),
            max_backup_age_hours: default_max_backup_age(),
            max_stale_run_age_hours: default_max_stale_run_age(),
            dry_run: false,
            verbose: false,
        }
    }
}

impl CleanupSettings {
    pub fn to_cleanup_config(&self) -> CleanupConfig {
        let hours = |h: u64| Duration::from_secs(h * 3600);
        CleanupConfig {
            max_log_size: self.max_log_size_bytes,
            max_log_age: hours(self.max_log_age_hours),
            max_backup_age: hours(self.max_backup_age_hours),
            max_stale_run_age: hours(self.max_stale_run_age_hours),
            dry_run: self.dry_run,
            verbose: self.verbose,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfigFile {
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Defaults to the file stem of the config file
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub snapshot_schedule: Option<String>,
    #[serde(default = "default_true")]
    pub incremental: bool,
    /// Squash a unit once its chain holds more incrementals than this
    pub squash_after: Option<usize>,
}

fn default_true() -> bool {
    true
}
