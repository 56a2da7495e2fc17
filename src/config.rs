//! Configuration surface for quipu
//!
//! Reads from `.quipu/config.yml`. A missing file yields the defaults; an
//! unknown storage backend is fatal at startup.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Which storage backend serves reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Git refs and commits are scanned directly.
    GitObject,
    /// Reads hit the relational cache; writes still go through git.
    Sqlite,
}

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    /// `storage.type` names a backend this build does not know.
    UnknownBackend(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {}", e),
            ConfigError::Yaml(e) => write!(f, "malformed config: {}", e),
            ConfigError::UnknownBackend(name) => {
                write!(f, "unknown storage backend '{}' (expected 'git_object' or 'sqlite')", name)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Yaml(e)
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Storage backend selection
    #[serde(default)]
    pub storage: StorageConfig,

    /// Identity and cross-machine sharing
    #[serde(default)]
    pub sync: SyncConfig,
}

/// `storage:` section
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// `git_object` (default) or `sqlite`
    #[serde(default = "default_storage_type", rename = "type")]
    pub backend: String,
}

/// `sync:` section
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Owner identity for new nodes. Defaults to an ID derived from
    /// `git config user.email` when unset.
    #[serde(default)]
    pub user_id: Option<String>,

    /// Git remote used for cross-machine sharing
    #[serde(default = "default_remote_name")]
    pub remote_name: String,

    /// Owner IDs whose refs are fetched by `fetch_refs`
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

fn default_storage_type() -> String {
    "git_object".to_string()
}

fn default_remote_name() -> String {
    "origin".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            remote_name: default_remote_name(),
            subscriptions: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_type(),
        }
    }
}

impl Config {
    /// Load config from a `config.yml` path. A missing file is the default
    /// config; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Validate and resolve `storage.type`.
    pub fn storage_backend(&self) -> Result<StorageBackend> {
        match self.storage.backend.as_str() {
            "git_object" => Ok(StorageBackend::GitObject),
            "sqlite" => Ok(StorageBackend::Sqlite),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage_backend().unwrap(), StorageBackend::GitObject);
        assert_eq!(config.sync.remote_name, "origin");
        assert!(config.sync.user_id.is_none());
        assert!(config.sync.subscriptions.is_empty());
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
storage:
  type: sqlite
sync:
  user_id: ada-at-example-dot-com
  remote_name: upstream
  subscriptions:
    - bob-at-example-dot-com
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage_backend().unwrap(), StorageBackend::Sqlite);
        assert_eq!(config.sync.user_id.as_deref(), Some("ada-at-example-dot-com"));
        assert_eq!(config.sync.remote_name, "upstream");
        assert_eq!(config.sync.subscriptions, vec!["bob-at-example-dot-com"]);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let yaml = "sync:\n  remote_name: mirror\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage_backend().unwrap(), StorageBackend::GitObject);
        assert_eq!(config.sync.remote_name, "mirror");
    }

    #[test]
    fn test_unknown_backend_is_fatal() {
        let yaml = "storage:\n  type: postgres\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        match config.storage_backend() {
            Err(ConfigError::UnknownBackend(name)) => assert_eq!(name, "postgres"),
            other => panic!("expected UnknownBackend, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = Config::load(&temp.path().join("config.yml")).unwrap();
        assert_eq!(config.storage_backend().unwrap(), StorageBackend::GitObject);
    }
}
