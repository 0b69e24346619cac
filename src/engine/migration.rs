//! Migration Registry
//!
//! Maps a database name to its per-version migration steps. Steps are
//! applied during a version change, lowest version first and in
//! registration order within a version. Steps can be closures or
//! declarative operations read from JSON migration files laid out as
//! `<root>/<database>/ver_<n>/<NNN>_<name>.json`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::store::{self, CollectionOptions, DatabaseHandle, IndexOptions, StoreError};

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Migration step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: StoreError,
    },

    #[error("No open database handle to migrate")]
    NotOpen,

    #[error("Upgrade aborted: {0}")]
    Aborted(String),

    #[error("Invalid migration layout: {0}")]
    Layout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

type StepFn = dyn Fn(&dyn DatabaseHandle) -> store::Result<()> + Send + Sync;

/// One schema change, run against the handle of a version-change transaction
#[derive(Clone)]
pub struct MigrationStep {
    name: String,
    apply: Arc<StepFn>,
}

impl MigrationStep {
    pub fn new<F>(name: &str, apply: F) -> Self
    where
        F: Fn(&dyn DatabaseHandle) -> store::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            apply: Arc::new(apply),
        }
    }

    /// Step running declarative operations in order
    pub fn from_ops(name: &str, operations: Vec<MigrationOp>) -> Self {
        Self::new(name, move |handle| {
            operations.iter().try_for_each(|op| op.apply(handle))
        })
    }

    /// Create `collection` unless it already exists.
    pub fn create_collection(collection: &str, options: CollectionOptions) -> Self {
        let name = format!("create_{}", collection);
        Self::from_ops(
            &name,
            vec![MigrationOp::CreateCollection {
                name: collection.to_string(),
                key_path: options.key_path,
                auto_increment: options.auto_increment,
            }],
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, handle: &dyn DatabaseHandle) -> Result<(), MigrationError> {
        (self.apply)(handle).map_err(|source| MigrationError::Step {
            step: self.name.clone(),
            source,
        })
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep").field("name", &self.name).finish()
    }
}

/// A declarative schema operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MigrationOp {
    /// Create a collection if it does not exist yet
    CreateCollection {
        name: String,
        key_path: String,
        #[serde(default)]
        auto_increment: bool,
    },

    /// Delete a collection if it exists
    DeleteCollection {
        name: String,
    },

    /// Create an index if the collection does not have it yet
    CreateIndex {
        collection: String,
        name: String,
        key_path: String,
        #[serde(default)]
        unique: bool,
    },

    /// Delete an index if it exists
    DeleteIndex {
        collection: String,
        name: String,
    },
}

impl MigrationOp {
    pub fn apply(&self, handle: &dyn DatabaseHandle) -> store::Result<()> {
        match self {
            MigrationOp::CreateCollection { name, key_path, auto_increment } => {
                if !handle.contains_collection(name)? {
                    handle.create_collection(
                        name,
                        CollectionOptions {
                            key_path: key_path.clone(),
                            auto_increment: *auto_increment,
                        },
                    )?;
                }
            }

            MigrationOp::DeleteCollection { name } => {
                if handle.contains_collection(name)? {
                    handle.delete_collection(name)?;
                }
            }

            MigrationOp::CreateIndex { collection, name, key_path, unique } => {
                if !handle.index_names(collection)?.contains(name) {
                    handle.create_index(
                        collection,
                        IndexOptions {
                            name: name.clone(),
                            key_path: key_path.clone(),
                            unique: *unique,
                        },
                    )?;
                }
            }

            MigrationOp::DeleteIndex { collection, name } => {
                if handle.index_names(collection)?.contains(name) {
                    handle.delete_index(collection, name)?;
                }
            }
        }
        Ok(())
    }
}

/// A migration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    /// Human-readable name
    pub name: String,

    /// Operations to apply
    pub operations: Vec<MigrationOp>,

    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Migration {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            operations: Vec::new(),
            description: None,
        }
    }

    pub fn add_op(mut self, op: MigrationOp) -> Self {
        self.operations.push(op);
        self
    }

    /// Save as `<NNN>_<name>.json` inside a `ver_<n>` directory
    pub fn save(&self, version_dir: &Path, ordinal: u32) -> Result<(), MigrationError> {
        fs::create_dir_all(version_dir)?;
        let filename = format!("{:03}_{}.json", ordinal, self.name);
        let content = serde_json::to_string_pretty(self)?;
        fs::write(version_dir.join(filename), content)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, MigrationError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn into_step(self) -> MigrationStep {
        MigrationStep::from_ops(&self.name, self.operations)
    }
}

/// Database name → version → ordered steps
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    databases: HashMap<String, BTreeMap<u32, Vec<MigrationStep>>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step to `database` at `version`.
    pub fn register(&mut self, database: &str, version: u32, step: MigrationStep) -> &mut Self {
        self.databases
            .entry(database.to_string())
            .or_default()
            .entry(version)
            .or_default()
            .push(step);
        self
    }

    /// Steps for one version; empty when none are registered.
    pub fn steps(&self, database: &str, version: u32) -> &[MigrationStep] {
        self.databases
            .get(database)
            .and_then(|versions| versions.get(&version))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn versions(&self, database: &str) -> Vec<u32> {
        self.databases
            .get(database)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn latest_version(&self, database: &str) -> Option<u32> {
        self.databases
            .get(database)
            .and_then(|versions| versions.keys().next_back().copied())
    }

    /// Load every `<database>/ver_<n>/*.json` under `root`.
    pub fn load_dir(root: &Path) -> Result<Self, MigrationError> {
        let mut registry = Self::new();

        if !root.exists() {
            return Ok(registry);
        }

        for db_entry in sorted_entries(root)? {
            if !db_entry.is_dir() {
                continue;
            }
            let database = file_name(&db_entry)?;

            for version_entry in sorted_entries(&db_entry)? {
                if !version_entry.is_dir() {
                    continue;
                }
                let dir_name = file_name(&version_entry)?;
                let version = dir_name
                    .strip_prefix("ver_")
                    .and_then(|v| v.parse::<u32>().ok())
                    .ok_or_else(|| {
                        MigrationError::Layout(format!(
                            "expected ver_<n> directory, found {}",
                            version_entry.display()
                        ))
                    })?;

                for file in sorted_entries(&version_entry)? {
                    if file.extension().map(|e| e == "json").unwrap_or(false) {
                        let migration = Migration::load(&file)?;
                        debug!(database = %database, version, step = %migration.name, "migration loaded");
                        registry.register(&database, version, migration.into_step());
                    }
                }
            }
        }

        Ok(registry)
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<std::path::PathBuf>, MigrationError> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> Result<String, MigrationError> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| MigrationError::Layout(format!("unnamed entry {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::{Backend, MemoryBackend, Opened};
    use tempfile::tempdir;

    #[test]
    fn test_registry_ordering() {
        let mut registry = MigrationRegistry::new();
        registry
            .register("App", 2, MigrationStep::new("second", |_| Ok(())))
            .register("App", 1, MigrationStep::new("first_a", |_| Ok(())))
            .register("App", 1, MigrationStep::new("first_b", |_| Ok(())));

        let names: Vec<_> = registry.steps("App", 1).iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["first_a", "first_b"]);
        assert_eq!(registry.versions("App"), vec![1, 2]);
        assert_eq!(registry.latest_version("App"), Some(2));
        assert!(registry.steps("App", 3).is_empty());
        assert!(registry.steps("Other", 1).is_empty());
    }

    #[test]
    fn test_load_dir_layout() {
        let dir = tempdir().unwrap();
        let app = dir.path().join("QkidsApp");

        Migration::new("create_store_admins")
            .add_op(MigrationOp::CreateCollection {
                name: "admins".to_string(),
                key_path: "id".to_string(),
                auto_increment: false,
            })
            .save(&app.join("ver_1"), 1)
            .unwrap();
        Migration::new("create_store_courses")
            .add_op(MigrationOp::CreateCollection {
                name: "courses".to_string(),
                key_path: "id".to_string(),
                auto_increment: false,
            })
            .save(&app.join("ver_2"), 1)
            .unwrap();

        let registry = MigrationRegistry::load_dir(dir.path()).unwrap();
        assert_eq!(registry.versions("QkidsApp"), vec![1, 2]);
        assert_eq!(registry.steps("QkidsApp", 1)[0].name(), "create_store_admins");
    }

    #[test]
    fn test_load_dir_rejects_bad_version_dir() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("App").join("version1")).unwrap();

        let err = MigrationRegistry::load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, MigrationError::Layout(_)));
    }

    #[test]
    fn test_op_json_shape() {
        let op: MigrationOp = serde_json::from_str(
            r#"{"op": "create_index", "collection": "admins", "name": "by_email", "key_path": "email", "unique": true}"#,
        )
        .unwrap();
        assert_eq!(
            op,
            MigrationOp::CreateIndex {
                collection: "admins".to_string(),
                name: "by_email".to_string(),
                key_path: "email".to_string(),
                unique: true,
            }
        );
    }

    #[tokio::test]
    async fn test_create_collection_is_idempotent() {
        let backend = MemoryBackend::new();
        let Opened::Upgrade(upgrade) = backend.open("App", 1).await.unwrap() else {
            panic!("expected upgrade");
        };
        let handle = upgrade.handle();
        let step = MigrationStep::create_collection("admins", CollectionOptions::key_path("id"));

        step.apply(handle.as_ref()).unwrap();
        step.apply(handle.as_ref()).unwrap();
        assert_eq!(handle.collection_names().unwrap(), vec!["admins".to_string()]);
    }
}
