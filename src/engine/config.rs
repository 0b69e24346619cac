//! ObjectDB Configuration Module
//! Handles loading and validating objectdb.config.json

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::connection::{Connection, ConstructionError};
use super::console::LogSink;
use super::migration::{MigrationError, MigrationRegistry};
use super::store::{Backend, MemoryBackend, SqliteBackend, StoreError};

pub const CONFIG_FILE: &str = "objectdb.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),
    #[error("No data directory available for the default database path")]
    NoDataDir,
    #[error("Failed to open storage: {0}")]
    Storage(#[from] StoreError),
    #[error("Invalid connection: {0}")]
    Connection(#[from] ConstructionError),
    #[error("Failed to load migrations: {0}")]
    Migrations(#[from] MigrationError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Key of the connection used when none is named
    pub default: String,
    pub connections: BTreeMap<String, ConnectionConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Migration root, relative to the project directory
    #[serde(default)]
    pub migrations: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    Sqlite {
        /// Defaults to `<data dir>/objectdb/objectdb.db`
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite { path: None }
    }
}

impl Config {
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, project_dir: &Path) -> Result<(), ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn default_for_database(name: &str) -> Self {
        let mut connections = BTreeMap::new();
        connections.insert(
            name.to_string(),
            ConnectionConfig {
                name: name.to_string(),
                version: 1,
            },
        );

        Self {
            default: name.to_string(),
            connections,
            storage: StorageConfig::Sqlite {
                path: Some(PathBuf::from("./data/objectdb.db")),
            },
            migrations: Some(PathBuf::from("migrations")),
        }
    }

    /// Look up a connection by key, falling back to `default`.
    pub fn connection(&self, key: Option<&str>) -> Result<&ConnectionConfig, ConfigError> {
        let key = key.unwrap_or(&self.default);
        self.connections
            .get(key)
            .ok_or_else(|| ConfigError::UnknownConnection(key.to_string()))
    }

    /// Resolve the SQLite file against the project directory.
    pub fn storage_path(&self, project_dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
        match &self.storage {
            StorageConfig::Memory => Ok(None),
            StorageConfig::Sqlite { path: Some(path) } if path.is_absolute() => {
                Ok(Some(path.clone()))
            }
            StorageConfig::Sqlite { path: Some(path) } => Ok(Some(project_dir.join(path))),
            StorageConfig::Sqlite { path: None } => dirs::data_local_dir()
                .map(|dir| Some(dir.join("objectdb").join("objectdb.db")))
                .ok_or(ConfigError::NoDataDir),
        }
    }

    pub fn build_backend(&self, project_dir: &Path) -> Result<Arc<dyn Backend>, ConfigError> {
        match self.storage_path(project_dir)? {
            None => Ok(Arc::new(MemoryBackend::new())),
            Some(path) => Ok(Arc::new(SqliteBackend::new(&path)?)),
        }
    }

    /// Registry loaded from the migration root; empty when none is configured
    /// or the directory does not exist yet.
    pub fn load_registry(&self, project_dir: &Path) -> Result<MigrationRegistry, ConfigError> {
        match &self.migrations {
            Some(dir) => {
                let root = project_dir.join(dir);
                if root.exists() {
                    Ok(MigrationRegistry::load_dir(&root)?)
                } else {
                    Ok(MigrationRegistry::new())
                }
            }
            None => Ok(MigrationRegistry::new()),
        }
    }

    pub fn connect(
        &self,
        backend: Arc<dyn Backend>,
        key: Option<&str>,
        sink: Arc<dyn LogSink>,
    ) -> Result<Connection, ConfigError> {
        let entry = self.connection(key)?;
        Ok(Connection::with_sink(backend, &entry.name, entry.version, sink)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::connection::ConnectionState;
    use crate::engine::console::MemorySink;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let config = Config::default_for_database("App");
        config.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.default, "App");
        assert_eq!(loaded.connection(None).unwrap().version, 1);
        assert_eq!(
            loaded.storage_path(dir.path()).unwrap(),
            Some(dir.path().join("./data/objectdb.db"))
        );
    }

    #[test]
    fn test_missing_config() {
        let dir = tempdir().unwrap();
        assert!(matches!(Config::load(dir.path()), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_parse_memory_storage() {
        let config: Config = serde_json::from_str(
            r#"{
                "default": "main",
                "connections": { "main": { "name": "App", "version": 3 } },
                "storage": { "type": "memory" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.storage, StorageConfig::Memory);
        assert_eq!(config.connection(Some("main")).unwrap().name, "App");
        assert!(matches!(
            config.connection(Some("other")),
            Err(ConfigError::UnknownConnection(_))
        ));
        assert!(config.migrations.is_none());
    }

    #[tokio::test]
    async fn test_connect_from_config() {
        let dir = tempdir().unwrap();
        let mut config = Config::default_for_database("App");
        config.storage = StorageConfig::Memory;

        let backend = config.build_backend(dir.path()).unwrap();
        let registry = config.load_registry(dir.path()).unwrap();
        let conn = config.connect(backend, None, MemorySink::new()).unwrap();
        conn.open_with_registry(&registry).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
    }
}
