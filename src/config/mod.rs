//! Configuration system for nexq.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NexqConfig {
    /// Store configuration.
    pub store: StoreConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Store backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-memory backend.
    Memory {
        /// Sweep interval.
        #[serde(default = "default_memory_poll_interval_ms")]
        poll_interval_ms: u64,
    },
    /// SQLite backend.
    Sqlite {
        /// Connection URL, e.g. `sqlite://nexq.db?mode=rwc` (`mode=rwc` creates a missing file).
        database_url: String,
        /// Pool size.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Sweep interval.
        #[serde(default = "default_sql_poll_interval_ms")]
        poll_interval_ms: u64,
    },
    /// PostgreSQL backend.
    Postgres {
        /// Connection URL, e.g. `postgres://user@localhost/nexq`.
        database_url: String,
        /// Pool size.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Sweep interval.
        #[serde(default = "default_sql_poll_interval_ms")]
        poll_interval_ms: u64,
    },
}

fn default_memory_poll_interval_ms() -> u64 {
    1000
}

fn default_sql_poll_interval_ms() -> u64 {
    30_000
}

fn default_max_connections() -> u32 {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            poll_interval_ms: default_memory_poll_interval_ms(),
        }
    }
}

impl StoreConfig {
    /// Build a SQL store config from a database URL, picking the backend from its scheme.
    pub fn from_database_url(database_url: &str) -> Result<Self> {
        if database_url.starts_with("sqlite:") {
            Ok(StoreConfig::Sqlite {
                database_url: database_url.to_string(),
                max_connections: default_max_connections(),
                poll_interval_ms: default_sql_poll_interval_ms(),
            })
        } else if database_url.starts_with("postgres://")
            || database_url.starts_with("postgresql://")
        {
            Ok(StoreConfig::Postgres {
                database_url: database_url.to_string(),
                max_connections: default_max_connections(),
                poll_interval_ms: default_sql_poll_interval_ms(),
            })
        } else {
            Err(Error::Config(format!(
                "unsupported database url \"{}\"",
                database_url
            )))
        }
    }

    /// Backend name used in logs and metrics.
    pub fn backend_name(&self) -> &'static str {
        match self {
            StoreConfig::Memory { .. } => "memory",
            StoreConfig::Sqlite { .. } => "sqlite",
            StoreConfig::Postgres { .. } => "postgres",
        }
    }

    /// Configured sweep interval.
    pub fn poll_interval(&self) -> Duration {
        let ms = match self {
            StoreConfig::Memory { poll_interval_ms }
            | StoreConfig::Sqlite { poll_interval_ms, .. }
            | StoreConfig::Postgres { poll_interval_ms, .. } => *poll_interval_ms,
        };
        Duration::from_millis(ms)
    }

    /// Replace the sweep interval.
    pub fn set_poll_interval_ms(&mut self, ms: u64) {
        match self {
            StoreConfig::Memory { poll_interval_ms }
            | StoreConfig::Sqlite { poll_interval_ms, .. }
            | StoreConfig::Postgres { poll_interval_ms, .. } => *poll_interval_ms = ms,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level.
    pub level: String,
    /// Log format (text or json).
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log format enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format.
    #[default]
    Text,
    /// JSON format.
    Json,
}

impl NexqConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::Config(format!("failed to parse configuration: {}", e)))
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to render configuration: {}", e)))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        match &self.store {
            StoreConfig::Memory { .. } => {}
            StoreConfig::Sqlite {
                database_url,
                max_connections,
                ..
            }
            | StoreConfig::Postgres {
                database_url,
                max_connections,
                ..
            } => {
                if database_url.trim().is_empty() {
                    return Err(Error::Config("database_url cannot be empty".to_string()));
                }
                if *max_connections == 0 {
                    return Err(Error::Config(
                        "max_connections must be at least 1".to_string(),
                    ));
                }
            }
        }

        if self.logging.level.trim().is_empty() {
            return Err(Error::Config("logging.level cannot be empty".to_string()));
        }
        Ok(())
    }
}
