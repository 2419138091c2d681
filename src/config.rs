//! Configuration for hangout-projections

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ProjectionError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hangout-projections")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite item table
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Read-modify-write attempts before a pointer sync gives up
    #[serde(default = "default_max_sync_attempts")]
    pub max_sync_attempts: usize,

    /// Maximum write intents accepted by one store transaction
    #[serde(default = "default_transaction_item_limit")]
    pub transaction_item_limit: usize,

    /// Feed page size when the caller does not ask for one
    #[serde(default = "default_feed_limit")]
    pub default_feed_limit: usize,

    /// Upper bound on requested feed page size
    #[serde(default = "default_max_feed_limit")]
    pub max_feed_limit: usize,

    /// Timeout for the concurrent feed window queries
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Change signal broadcast buffer
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_sync_attempts() -> usize {
    5
}

fn default_transaction_item_limit() -> usize {
    100
}

fn default_feed_limit() -> usize {
    20
}

fn default_max_feed_limit() -> usize {
    100
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

fn default_event_buffer() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            max_sync_attempts: default_max_sync_attempts(),
            transaction_item_limit: default_transaction_item_limit(),
            default_feed_limit: default_feed_limit(),
            max_feed_limit: default_max_feed_limit(),
            query_timeout_ms: default_query_timeout_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProjectionError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ProjectionError::Config(format!("Failed to read {:?}: {}", path.as_ref(), e)))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| ProjectionError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProjectionError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProjectionError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| ProjectionError::Config(format!("Failed to write {:?}: {}", path.as_ref(), e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ProjectionError> {
        if self.max_sync_attempts == 0 {
            return Err(ProjectionError::Config("max_sync_attempts must be at least 1".into()));
        }
        if self.transaction_item_limit == 0 {
            return Err(ProjectionError::Config("transaction_item_limit must be at least 1".into()));
        }
        if self.max_feed_limit == 0 || self.default_feed_limit > self.max_feed_limit {
            return Err(ProjectionError::Config(
                "default_feed_limit must be between 1 and max_feed_limit".into(),
            ));
        }
        Ok(())
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join("projections.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    /// Feed query timeout
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Clamp a requested page size into `[1, max_feed_limit]`
    pub fn clamp_feed_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_feed_limit)
            .clamp(1, self.max_feed_limit)
    }
}
