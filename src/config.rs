//! Configuration module for the event dispatch engine.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `APPEVENT_` and use double
//! underscores to separate nested levels:
//! - `APPEVENT_INGESTION__ENABLED=false` sets `ingestion.enabled`
//! - `APPEVENT_PACKAGE__BYTE_BUDGET=65536` sets `package.byte_budget`
//! - `APPEVENT_STORAGE__MAX_SIZE_BYTES=10485760` sets `storage.max_size_bytes`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Storage settings for the durable event store
    #[serde(default)]
    pub storage: StorageConfig,

    /// Ingestion of externally-produced event files
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Package extraction settings
    #[serde(default)]
    pub package: PackageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Directory holding the durable event store
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,

    /// Upper bound on total stored event bytes
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestionConfig {
    /// Global enable flag, queried once at listener start
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory watched for externally-written event files.
    /// Defaults to `<storage.dir>/osevents` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PackageConfig {
    /// Default byte budget for package extraction (512 KiB)
    #[serde(default = "default_byte_budget")]
    pub byte_budget: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default log level for all modules
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module log level overrides
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".appevent")
}

fn default_max_size_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_byte_budget() -> usize {
    512 * 1024
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            storage: StorageConfig::default(),
            ingestion: IngestionConfig::default(),
            package: PackageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
            max_size_bytes: default_max_size_bytes(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            dir: None,
        }
    }
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            byte_budget: default_byte_budget(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from("appevent.toml")
    }

    /// Load configuration from a specific file, layered with env overrides.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            // Double underscore separates nested levels, single underscore
            // remains part of the field name
            .merge(Env::prefixed("APPEVENT_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Directory watched for externally-written event files.
    pub fn ingestion_dir(&self) -> PathBuf {
        self.ingestion
            .dir
            .clone()
            .unwrap_or_else(|| self.storage.dir.join("osevents"))
    }

    /// Save current configuration to file.
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }
}
