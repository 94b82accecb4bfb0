// Broker Configuration
//
// Storage location and log sizing, loaded from JSON.
// Every field has a default so a partial file is valid.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::log::LogOptions;

/// Default segment capacity (1 MiB).
pub const DEFAULT_SEGMENT_MAX_BYTES: u64 = 1024 * 1024;

/// Default number of messages returned by a consume without a limit.
pub const DEFAULT_MAX_MESSAGES: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Broker configuration loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Root of all persisted state. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,

    /// A segment is sealed once the next record would push it past this size.
    pub segment_max_bytes: u64,

    /// Consume limit used when a request does not carry one.
    pub default_max_messages: usize,

    /// `sync_data` after every append instead of leaving it to the OS.
    pub sync_on_append: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl BrokerConfig {
    /// Built-in configuration (used if no config file is provided).
    pub fn default_config() -> Self {
        Self {
            data_dir: None,
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            default_max_messages: DEFAULT_MAX_MESSAGES,
            sync_on_append: false,
        }
    }

    /// In-memory configuration with a custom segment size.
    pub fn in_memory(segment_max_bytes: u64) -> Self {
        Self {
            segment_max_bytes,
            ..Self::default_config()
        }
    }

    /// Persistent configuration rooted at `data_dir`.
    pub fn persistent(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Self::default_config()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config: BrokerConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "segment_max_bytes must be greater than zero".into(),
            ));
        }
        if let Some(dir) = &self.data_dir {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("data_dir must not be empty".into()));
            }
        }
        Ok(())
    }

    pub(crate) fn log_options(&self) -> LogOptions {
        LogOptions {
            segment_max_bytes: self.segment_max_bytes,
            sync_on_append: self.sync_on_append,
        }
    }
}
