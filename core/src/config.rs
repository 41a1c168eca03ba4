//! Reconciliation configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Configuration for the trust store and its background workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Directory for the JSON stores (None keeps everything in memory)
    pub data_dir: Option<PathBuf>,

    /// Size of the blocking pool reconciliations run on
    pub worker_threads: usize,

    /// Default tracing filter, e.g. "info" or "keychange_core=debug"
    pub log_level: String,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            worker_threads: 4,
            log_level: "info".to_string(),
        }
    }
}

impl ReconcileConfig {
    /// Config for tests and ephemeral use
    pub fn in_memory() -> Self {
        Self {
            worker_threads: 1,
            ..Self::default()
        }
    }

    /// Config backed by JSON files in `dir`
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Load from a JSON file. A missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Self = serde_json::from_str(&data).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReconcileConfig::default();
        assert!(config.data_dir.is_none());
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReconcileConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, ReconcileConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"data_dir": "/var/lib/keys"}"#).unwrap();

        let config = ReconcileConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/keys")));
        assert_eq!(config.worker_threads, 4);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"worker_threads": 0}"#).unwrap();

        assert!(matches!(ReconcileConfig::load(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(ReconcileConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
