//! ObjectDB - data access over a versioned object store
//!
//! A [`Connection`] opens a named database at a version, running
//! registered migration steps when the stored version is behind. A
//! [`Query`] prepared from it inserts, updates, deletes and looks up
//! records in one collection.

pub mod engine;

pub use engine::store::{self, Backend, Key, MemoryBackend, SqliteBackend, StoreError};
pub use engine::{
    Connection, ConnectionError, ConnectionState, MigrationRegistry, MigrationStep, OpenError,
    Query, QueryError,
};
