//! Object Store Substrate
//!
//! Trait-based abstraction over an asynchronous, versioned object store.
//! A backend opens named databases at a version; a handle exposes
//! collections and transactions; schema changes are only accepted while
//! a version-change transaction is running.

pub mod error;
pub mod key;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use error::{Result, StoreError};
pub use key::Key;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Factory for named, versioned databases
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open `name` at `version`. Databases that do not exist yet, or that are
    /// below `version`, come back as [`Opened::Upgrade`].
    async fn open(&self, name: &str, version: u32) -> Result<Opened>;

    /// Delete a database with every collection in it. Missing databases are
    /// not an error.
    async fn delete_database(&self, name: &str) -> Result<()>;

    /// Names and versions of the existing databases
    async fn databases(&self) -> Result<Vec<DatabaseInfo>>;
}

/// Outcome of [`Backend::open`]
pub enum Opened {
    Ready(Arc<dyn DatabaseHandle>),
    Upgrade(Box<dyn UpgradeTransaction>),
}

/// A live connection to one database
#[async_trait]
pub trait DatabaseHandle: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> u32;

    fn collection_names(&self) -> Result<Vec<String>>;

    fn contains_collection(&self, name: &str) -> Result<bool> {
        Ok(self.collection_names()?.iter().any(|n| n == name))
    }

    fn create_collection(&self, name: &str, options: CollectionOptions) -> Result<()>;

    fn delete_collection(&self, name: &str) -> Result<()>;

    fn create_index(&self, collection: &str, index: IndexOptions) -> Result<()>;

    fn delete_index(&self, collection: &str, index: &str) -> Result<()>;

    fn index_names(&self, collection: &str) -> Result<Vec<String>>;

    /// Begin a transaction over `scope`. Fails with `NotFound` for unknown
    /// collections and `InvalidState` once the handle is closed.
    async fn transaction(&self, scope: &[&str], mode: TransactionMode)
        -> Result<Box<dyn Transaction>>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// The version-change transaction of an upgrading open
#[async_trait]
pub trait UpgradeTransaction: Send {
    fn old_version(&self) -> u32;

    fn new_version(&self) -> u32;

    /// Handle accepting schema changes until commit or abort
    fn handle(&self) -> Arc<dyn DatabaseHandle>;

    /// Persist the schema changes and the new version.
    async fn commit(self: Box<Self>) -> Result<Arc<dyn DatabaseHandle>>;

    /// Discard the schema changes and close the handle.
    async fn abort(self: Box<Self>);
}

/// A unit of work over one or more collections
#[async_trait]
pub trait Transaction: Send + Sync {
    fn mode(&self) -> TransactionMode;

    /// Insert; fails with `Constraint` when the key or a unique index value
    /// is taken.
    async fn add(&self, collection: &str, record: Value) -> Result<Key>;

    /// Insert or replace.
    async fn put(&self, collection: &str, record: Value) -> Result<Key>;

    async fn get(&self, collection: &str, key: &Key) -> Result<Option<Value>>;

    /// First record, by primary key order, whose indexed value equals `key`.
    async fn get_by_index(&self, collection: &str, index: &str, key: &Key)
        -> Result<Option<Value>>;

    async fn delete(&self, collection: &str, key: &Key) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn abort(self: Box<Self>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

impl fmt::Debug for dyn DatabaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("name", &self.name())
            .field("version", &self.version())
            .finish()
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionMode::ReadOnly => write!(f, "readonly"),
            TransactionMode::ReadWrite => write!(f, "readwrite"),
        }
    }
}

/// Primary key declaration of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionOptions {
    pub key_path: String,
    #[serde(default)]
    pub auto_increment: bool,
}

impl CollectionOptions {
    pub fn key_path(path: &str) -> Self {
        Self {
            key_path: path.to_string(),
            auto_increment: false,
        }
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }
}

/// Secondary index declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexOptions {
    pub name: String,
    pub key_path: String,
    #[serde(default)]
    pub unique: bool,
}

impl IndexOptions {
    pub fn new(name: &str, key_path: &str) -> Self {
        Self {
            name: name.to_string(),
            key_path: key_path.to_string(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub version: u32,
}
