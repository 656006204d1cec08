//! `[persistence]` section: where retained messages and persistent
//! sessions are stored between restarts.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Embedded LSM store under `path`
    #[default]
    Fjall,
    /// Process memory; nothing survives a restart
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Off by default: sessions and retained messages live in memory only
    pub enabled: bool,
    pub backend: BackendType,
    /// Data directory for the fjall backend
    pub path: PathBuf,
    /// How long queued writes may wait before a commit ("100ms", "1s")
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Writes that force a commit before the interval elapses
    pub max_batch_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: BackendType::Fjall,
            path: PathBuf::from("./data"),
            flush_interval: Duration::from_millis(100),
            max_batch_size: 100,
        }
    }
}

impl PersistenceConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Validation(
                "persistence flush_interval must be greater than zero".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Validation(
                "persistence max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.backend == BackendType::Fjall && self.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "persistence path is required for the fjall backend".to_string(),
            ));
        }
        Ok(())
    }
}
