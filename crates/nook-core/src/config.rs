//! Runtime configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nook_storage::{CollectionSchema, ConnectionOptions};

use crate::error::CoreError;
use crate::users::USERS;
use crate::Result;

/// Overrides the platform data directory.
pub const DATA_DIR_ENV: &str = "NOOK_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the database file
    pub database_path: PathBuf,
    /// How long opens and writes wait on another connection's lock
    pub busy_timeout_ms: u64,
    /// Upper bound for a single store operation; unbounded when absent
    pub operation_timeout_ms: Option<u64>,
    /// Collections created when the database is first opened
    pub collections: Vec<CollectionSchema>,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            database_path: data_dir.join("nook.db"),
            busy_timeout_ms: 5_000,
            operation_timeout_ms: None,
            collections: vec![CollectionSchema::new(USERS)],
        }
    }

    pub fn data_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
            return PathBuf::from(dir);
        }
        dirs::data_local_dir()
            .map(|d| d.join("nook"))
            .unwrap_or_else(|| PathBuf::from(".nook"))
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(CoreError::Config("database_path is empty".to_string()));
        }
        for schema in &self.collections {
            schema
                .validate()
                .map_err(|e| CoreError::Config(e.to_string()))?;
        }
        Ok(())
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}
