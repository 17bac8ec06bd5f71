//! YAML configuration shared by the CLI and the HTTP service.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::observability::LogFormat;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KernelConfig {
    pub store: StoreConfig,
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { db_path: PathBuf::from("./dispositionkernel.sqlite3") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind: String,
    /// Seconds between background publish runs. Zero disables the worker.
    pub publish_interval_secs: u64,
    pub publish_batch_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:4010".to_string(),
            publish_interval_secs: 30,
            publish_batch_size: 25,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub filter: Option<String>,
}

impl KernelConfig {
    /// Parse configuration from YAML text. Absent sections keep their defaults.
    ///
    /// # Errors
    /// Returns an error when the text is not valid configuration YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).context("failed to parse kernel configuration YAML")
    }

    /// Load configuration from `path`, or defaults when no path is given or the
    /// file does not exist.
    ///
    /// # Errors
    /// Returns an error when an existing file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "configuration file not found; using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("invalid configuration file {}", path.display()))
    }
}
