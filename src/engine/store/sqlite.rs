//! SQLite-backed object store
//!
//! Persists every database in one SQLite file using rusqlite + r2d2
//! connection pooling. A version change runs inside one `BEGIN IMMEDIATE`
//! transaction on a dedicated pooled connection; read-write transactions do
//! the same, so writers on one file are serialized by SQLite itself.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSql, ToSqlOutput};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::error::{Result, StoreError};
use super::key::{self, Key};
use super::schema;
use super::{
    Backend, CollectionOptions, DatabaseHandle, DatabaseInfo, IndexOptions, Opened, Transaction,
    TransactionMode, UpgradeTransaction,
};

type DbPool = Pool<SqliteConnectionManager>;
type DbConn = PooledConnection<SqliteConnectionManager>;
type OpenCounts = Arc<Mutex<HashMap<String, usize>>>;
type WriterLock = Arc<tokio::sync::Mutex<()>>;

/// Persistent backend storing all databases in one SQLite file
pub struct SqliteBackend {
    pool: DbPool,
    db_path: PathBuf,
    open_handles: OpenCounts,
    /// Serializes writers of one database inside this process, so waiting
    /// for the SQLite write lock suspends the task instead of the thread.
    writers: Arc<Mutex<HashMap<String, WriterLock>>>,
}

impl SqliteBackend {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.execute_batch(schema::PRAGMAS));
        let pool = Pool::builder().max_size(8).build(manager)?;

        pool.get()?.execute_batch(schema::CREATE_TABLES)?;

        info!(path = %db_path.display(), "sqlite object store opened");

        Ok(Self {
            pool,
            db_path: db_path.to_path_buf(),
            open_handles: Arc::new(Mutex::new(HashMap::new())),
            writers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn handle(&self, name: &str, version: u32) -> Result<Arc<SqliteHandle>> {
        SqliteHandle::new(
            name,
            self.pool.clone(),
            version,
            self.open_handles.clone(),
            self.writer(name)?,
        )
        .map(Arc::new)
    }

    fn writer(&self, name: &str) -> Result<WriterLock> {
        let mut writers = self.writers.lock().map_err(|_| StoreError::poisoned())?;
        Ok(writers.entry(name.to_string()).or_default().clone())
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn open(&self, name: &str, version: u32) -> Result<Opened> {
        if version == 0 {
            return Err(StoreError::Data("version must be a positive integer".to_string()));
        }

        let current = {
            let conn = self.pool.get()?;
            stored_version(&conn, name)?
        };
        if current >= version {
            return Ok(Opened::Ready(self.handle(name, current)?));
        }

        let writer = self.writer(name)?.lock_owned().await;
        let conn = self.pool.get()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;

        // Re-read under the write lock; another opener may have upgraded
        let current = match stored_version(&conn, name) {
            Ok(v) => v,
            Err(e) => {
                rollback(&conn);
                return Err(e);
            }
        };
        if current >= version {
            conn.execute_batch("COMMIT")?;
            return Ok(Opened::Ready(self.handle(name, current)?));
        }

        debug!(database = %name, from = current, to = version, "sqlite upgrade started");

        let handle = match self.handle(name, current) {
            Ok(h) => h,
            Err(e) => {
                rollback(&conn);
                return Err(e);
            }
        };
        *handle.upgrade.lock().map_err(|_| StoreError::poisoned())? = Some(conn);

        Ok(Opened::Upgrade(Box::new(SqliteUpgrade {
            handle,
            old_version: current,
            new_version: version,
            _writer: writer,
        })))
    }

    async fn delete_database(&self, name: &str) -> Result<()> {
        {
            let counts = self.open_handles.lock().map_err(|_| StoreError::poisoned())?;
            let open = counts.get(name).copied().unwrap_or(0);
            if open > 0 {
                return Err(StoreError::Blocked(format!(
                    "database '{}' has {} open handle(s)",
                    name, open
                )));
            }
        }

        let _writer = self.writer(name)?.lock_owned().await;
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM object_records WHERE database = ?1", params![name])?;
        tx.execute("DELETE FROM object_indexes WHERE database = ?1", params![name])?;
        tx.execute("DELETE FROM object_collections WHERE database = ?1", params![name])?;
        tx.execute("DELETE FROM object_databases WHERE name = ?1", params![name])?;
        tx.commit()?;

        debug!(database = %name, "sqlite database deleted");
        Ok(())
    }

    async fn databases(&self) -> Result<Vec<DatabaseInfo>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT name, version FROM object_databases ORDER BY name")?;
        let infos = stmt
            .query_map([], |row| {
                Ok(DatabaseInfo {
                    name: row.get(0)?,
                    version: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(infos)
    }
}

struct SqliteHandle {
    name: String,
    pool: DbPool,
    version: AtomicU32,
    /// Connection holding the open version-change transaction
    upgrade: Mutex<Option<DbConn>>,
    closed: AtomicBool,
    open_handles: OpenCounts,
    writer: WriterLock,
}

impl SqliteHandle {
    fn new(
        name: &str,
        pool: DbPool,
        version: u32,
        open_handles: OpenCounts,
        writer: WriterLock,
    ) -> Result<Self> {
        *open_handles
            .lock()
            .map_err(|_| StoreError::poisoned())?
            .entry(name.to_string())
            .or_insert(0) += 1;

        Ok(Self {
            name: name.to_string(),
            pool,
            version: AtomicU32::new(version),
            upgrade: Mutex::new(None),
            closed: AtomicBool::new(false),
            open_handles,
            writer,
        })
    }

    /// Run against the upgrade connection when one is live, so uncommitted
    /// schema changes are visible.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let upgrade = self.upgrade.lock().map_err(|_| StoreError::poisoned())?;
        if let Some(conn) = upgrade.as_ref() {
            return f(&**conn);
        }
        drop(upgrade);

        let conn = self.pool.get()?;
        f(&*conn)
    }

    fn with_schema<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let upgrade = self.upgrade.lock().map_err(|_| StoreError::poisoned())?;
        match upgrade.as_ref() {
            Some(conn) => f(&**conn),
            None => Err(StoreError::InvalidState(
                "schema changes require a version-change transaction".to_string(),
            )),
        }
    }
}

impl Drop for SqliteHandle {
    fn drop(&mut self) {
        if let Ok(mut upgrade) = self.upgrade.lock() {
            if let Some(conn) = upgrade.take() {
                rollback(&conn);
            }
        }
        self.close();
    }
}

#[async_trait]
impl DatabaseHandle for SqliteHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    fn collection_names(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM object_collections WHERE database = ?1 ORDER BY name",
            )?;
            let names = stmt
                .query_map(params![self.name], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }

    fn create_collection(&self, name: &str, options: CollectionOptions) -> Result<()> {
        if options.key_path.is_empty() {
            return Err(StoreError::Data("key path cannot be empty".to_string()));
        }
        self.with_schema(|conn| {
            if load_collection(conn, &self.name, name)?.is_some() {
                return Err(StoreError::Constraint(format!(
                    "collection '{}' already exists",
                    name
                )));
            }
            conn.execute(
                "INSERT INTO object_collections (database, name, key_path, auto_increment)
                 VALUES (?1, ?2, ?3, ?4)",
                params![self.name, name, options.key_path, options.auto_increment],
            )?;
            Ok(())
        })
    }

    fn delete_collection(&self, name: &str) -> Result<()> {
        self.with_schema(|conn| {
            let removed = conn.execute(
                "DELETE FROM object_collections WHERE database = ?1 AND name = ?2",
                params![self.name, name],
            )?;
            if removed == 0 {
                return Err(StoreError::NotFound(format!("collection '{}'", name)));
            }
            conn.execute(
                "DELETE FROM object_indexes WHERE database = ?1 AND collection = ?2",
                params![self.name, name],
            )?;
            conn.execute(
                "DELETE FROM object_records WHERE database = ?1 AND collection = ?2",
                params![self.name, name],
            )?;
            Ok(())
        })
    }

    fn create_index(&self, collection: &str, index: IndexOptions) -> Result<()> {
        self.with_schema(|conn| {
            let meta = load_collection(conn, &self.name, collection)?
                .ok_or_else(|| StoreError::NotFound(format!("collection '{}'", collection)))?;

            if meta.indexes.iter().any(|i| i.name == index.name) {
                return Err(StoreError::Constraint(format!(
                    "index '{}' already exists on '{}'",
                    index.name, collection
                )));
            }

            if index.unique {
                let mut seen = Vec::new();
                for (_, record) in all_records(conn, &self.name, collection)? {
                    if let Ok(Some(v)) = key::extract(&record, &index.key_path) {
                        if seen.contains(&v) {
                            return Err(StoreError::Constraint(format!(
                                "existing records violate unique index '{}'",
                                index.name
                            )));
                        }
                        seen.push(v);
                    }
                }
            }

            conn.execute(
                "INSERT INTO object_indexes (database, collection, name, key_path, is_unique)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![self.name, collection, index.name, index.key_path, index.unique],
            )?;
            Ok(())
        })
    }

    fn delete_index(&self, collection: &str, index: &str) -> Result<()> {
        self.with_schema(|conn| {
            let removed = conn.execute(
                "DELETE FROM object_indexes WHERE database = ?1 AND collection = ?2 AND name = ?3",
                params![self.name, collection, index],
            )?;
            if removed == 0 {
                return Err(StoreError::NotFound(format!("index '{}'", index)));
            }
            Ok(())
        })
    }

    fn index_names(&self, collection: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let meta = load_collection(conn, &self.name, collection)?
                .ok_or_else(|| StoreError::NotFound(format!("collection '{}'", collection)))?;
            Ok(meta.indexes.into_iter().map(|i| i.name).collect())
        })
    }

    async fn transaction(
        &self,
        scope: &[&str],
        mode: TransactionMode,
    ) -> Result<Box<dyn Transaction>> {
        if self.is_closed() {
            return Err(StoreError::InvalidState("database handle is closed".to_string()));
        }
        let upgrading = self.upgrade.lock().map_err(|_| StoreError::poisoned())?.is_some();
        if upgrading {
            return Err(StoreError::InvalidState(
                "a version change is in progress".to_string(),
            ));
        }

        let writer = match mode {
            TransactionMode::ReadWrite => Some(self.writer.clone().lock_owned().await),
            TransactionMode::ReadOnly => None,
        };

        let conn = self.pool.get()?;
        conn.execute_batch(match mode {
            TransactionMode::ReadOnly => "BEGIN",
            TransactionMode::ReadWrite => "BEGIN IMMEDIATE",
        })?;

        let mut collections = HashMap::new();
        for name in scope {
            match load_collection(&conn, &self.name, name) {
                Ok(Some(meta)) => {
                    collections.insert(name.to_string(), meta);
                }
                Ok(None) => {
                    rollback(&conn);
                    return Err(StoreError::NotFound(format!("collection '{}'", name)));
                }
                Err(e) => {
                    rollback(&conn);
                    return Err(e);
                }
            }
        }

        Ok(Box::new(SqliteTransaction {
            database: self.name.clone(),
            conn: Mutex::new(Some(conn)),
            collections,
            mode,
            _writer: writer,
        }))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut counts) = self.open_handles.lock() {
            if let Some(count) = counts.get_mut(&self.name) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counts.remove(&self.name);
                }
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct SqliteUpgrade {
    handle: Arc<SqliteHandle>,
    old_version: u32,
    new_version: u32,
    _writer: OwnedMutexGuard<()>,
}

impl SqliteUpgrade {
    /// Roll back unless the upgrade already committed or aborted.
    fn discard(&self) {
        let conn = self.handle.upgrade.lock().ok().and_then(|mut upgrade| upgrade.take());
        if let Some(conn) = conn {
            rollback(&conn);
            self.handle.close();
            debug!(database = %self.handle.name, "sqlite upgrade aborted");
        }
    }
}

impl Drop for SqliteUpgrade {
    fn drop(&mut self) {
        self.discard();
    }
}

#[async_trait]
impl UpgradeTransaction for SqliteUpgrade {
    fn old_version(&self) -> u32 {
        self.old_version
    }

    fn new_version(&self) -> u32 {
        self.new_version
    }

    fn handle(&self) -> Arc<dyn DatabaseHandle> {
        self.handle.clone()
    }

    async fn commit(self: Box<Self>) -> Result<Arc<dyn DatabaseHandle>> {
        let conn = self
            .handle
            .upgrade
            .lock()
            .map_err(|_| StoreError::poisoned())?
            .take()
            .ok_or_else(|| StoreError::InvalidState("upgrade already finished".to_string()))?;

        let result = conn
            .execute(
                "INSERT INTO object_databases (name, version) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET version = excluded.version",
                params![self.handle.name, self.new_version],
            )
            .and_then(|_| conn.execute_batch("COMMIT"));

        if let Err(e) = result {
            rollback(&conn);
            self.handle.close();
            return Err(e.into());
        }

        self.handle.version.store(self.new_version, Ordering::SeqCst);
        debug!(
            database = %self.handle.name,
            version = self.new_version,
            "sqlite upgrade committed"
        );
        Ok(self.handle.clone())
    }

    async fn abort(self: Box<Self>) {
        self.discard();
    }
}

struct SqliteTransaction {
    database: String,
    conn: Mutex<Option<DbConn>>,
    collections: HashMap<String, CollectionMeta>,
    mode: TransactionMode,
    _writer: Option<OwnedMutexGuard<()>>,
}

impl SqliteTransaction {
    fn meta(&self, collection: &str) -> Result<&CollectionMeta> {
        self.collections.get(collection).ok_or_else(|| {
            StoreError::NotFound(format!(
                "collection '{}' is not in the transaction scope",
                collection
            ))
        })
    }

    fn writable(&self, collection: &str) -> Result<&CollectionMeta> {
        let meta = self.meta(collection)?;
        if self.mode == TransactionMode::ReadOnly {
            return Err(StoreError::ReadOnly(format!(
                "cannot write to '{}' in a readonly transaction",
                collection
            )));
        }
        Ok(meta)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().map_err(|_| StoreError::poisoned())?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| StoreError::InvalidState("transaction already finished".to_string()))?;
        f(&**conn)
    }

    fn take_conn(&self) -> Option<DbConn> {
        self.conn.lock().ok().and_then(|mut guard| guard.take())
    }

    fn write(&self, collection: &str, mut record: Value, overwrite: bool) -> Result<Key> {
        let meta = self.writable(collection)?;
        self.with_conn(|conn| {
            let key = resolve_key(conn, &self.database, collection, &meta.options, &mut record)?;
            if !overwrite && load_record(conn, &self.database, collection, &key)?.is_some() {
                return Err(StoreError::Constraint(format!("key {} already exists", key)));
            }
            check_unique(conn, &self.database, collection, &meta.indexes, &record, &key)?;
            store_record(conn, &self.database, collection, &meta.options, &key, &record)?;
            Ok(key)
        })
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.take_conn() {
            rollback(&conn);
        }
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    async fn add(&self, collection: &str, record: Value) -> Result<Key> {
        self.write(collection, record, false)
    }

    async fn put(&self, collection: &str, record: Value) -> Result<Key> {
        self.write(collection, record, true)
    }

    async fn get(&self, collection: &str, key: &Key) -> Result<Option<Value>> {
        self.meta(collection)?;
        self.with_conn(|conn| load_record(conn, &self.database, collection, key))
    }

    async fn get_by_index(
        &self,
        collection: &str,
        index: &str,
        key: &Key,
    ) -> Result<Option<Value>> {
        let meta = self.meta(collection)?;
        let options = meta
            .indexes
            .iter()
            .find(|i| i.name == index)
            .ok_or_else(|| StoreError::NotFound(format!("index '{}'", index)))?;

        self.with_conn(|conn| {
            let matches = records_with_value(conn, &self.database, collection, &options.key_path, key)?;
            Ok(matches.into_iter().min_by(|a, b| a.0.cmp(&b.0)).map(|(_, v)| v))
        })
    }

    async fn delete(&self, collection: &str, key: &Key) -> Result<()> {
        self.writable(collection)?;
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM object_records WHERE database = ?1 AND collection = ?2 AND key = ?3",
                params![self.database, collection, key.encode()],
            )?;
            Ok(())
        })
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let conn = self
            .take_conn()
            .ok_or_else(|| StoreError::InvalidState("transaction already finished".to_string()))?;

        if let Err(e) = conn.execute_batch("COMMIT") {
            rollback(&conn);
            return Err(e.into());
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        if let Some(conn) = self.take_conn() {
            rollback(&conn);
        }
    }
}

impl ToSql for Key {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Key::Int(i) => ToSqlOutput::from(*i),
            Key::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

struct CollectionMeta {
    options: CollectionOptions,
    indexes: Vec<IndexOptions>,
}

fn rollback(conn: &Connection) {
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        warn!(error = %e, "sqlite rollback failed");
    }
}

fn json_path(key_path: &str) -> String {
    format!("$.{}", key_path)
}

fn stored_version(conn: &Connection, name: &str) -> Result<u32> {
    let version: Option<u32> = conn
        .query_row(
            "SELECT version FROM object_databases WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0))
}

fn load_collection(conn: &Connection, database: &str, name: &str) -> Result<Option<CollectionMeta>> {
    let options = conn
        .query_row(
            "SELECT key_path, auto_increment FROM object_collections
             WHERE database = ?1 AND name = ?2",
            params![database, name],
            |row| {
                Ok(CollectionOptions {
                    key_path: row.get(0)?,
                    auto_increment: row.get(1)?,
                })
            },
        )
        .optional()?;

    let Some(options) = options else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT name, key_path, is_unique FROM object_indexes
         WHERE database = ?1 AND collection = ?2 ORDER BY name",
    )?;
    let indexes = stmt
        .query_map(params![database, name], |row| {
            Ok(IndexOptions {
                name: row.get(0)?,
                key_path: row.get(1)?,
                unique: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(CollectionMeta { options, indexes }))
}

fn load_record(conn: &Connection, database: &str, collection: &str, key: &Key) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM object_records WHERE database = ?1 AND collection = ?2 AND key = ?3",
            params![database, collection, key.encode()],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

fn all_records(conn: &Connection, database: &str, collection: &str) -> Result<Vec<(Key, Value)>> {
    let mut stmt = conn.prepare(
        "SELECT key, value FROM object_records WHERE database = ?1 AND collection = ?2",
    )?;
    let rows = stmt
        .query_map(params![database, collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(k, v)| Ok((Key::decode(&k)?, serde_json::from_str(&v)?)))
        .collect()
}

/// Records whose value at `key_path` equals `value`. SQLite narrows the
/// candidates, key semantics decide.
fn records_with_value(
    conn: &Connection,
    database: &str,
    collection: &str,
    key_path: &str,
    value: &Key,
) -> Result<Vec<(Key, Value)>> {
    let mut stmt = conn.prepare(
        "SELECT key, value FROM object_records
         WHERE database = ?1 AND collection = ?2 AND json_extract(value, ?3) = ?4",
    )?;
    let rows = stmt
        .query_map(params![database, collection, json_path(key_path), value], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut matches = Vec::new();
    for (k, v) in rows {
        let record: Value = serde_json::from_str(&v)?;
        if matches!(key::extract(&record, key_path), Ok(Some(ref found)) if found == value) {
            matches.push((Key::decode(&k)?, record));
        }
    }
    Ok(matches)
}

fn resolve_key(
    conn: &Connection,
    database: &str,
    collection: &str,
    options: &CollectionOptions,
    record: &mut Value,
) -> Result<Key> {
    match key::extract(record, &options.key_path)? {
        Some(k) => Ok(k),
        None if options.auto_increment => {
            let next: Option<i64> = conn.query_row(
                "SELECT next_key FROM object_collections WHERE database = ?1 AND name = ?2",
                params![database, collection],
                |row| row.get(0),
            )?;
            let next = next.ok_or_else(|| {
                StoreError::Constraint(format!("key generator of '{}' is exhausted", collection))
            })?;
            let generated = Key::Int(next);
            key::inject(record, &options.key_path, &generated)?;
            Ok(generated)
        }
        None => Err(StoreError::Data(format!(
            "record has no key at '{}'",
            options.key_path
        ))),
    }
}

fn check_unique(
    conn: &Connection,
    database: &str,
    collection: &str,
    indexes: &[IndexOptions],
    record: &Value,
    own_key: &Key,
) -> Result<()> {
    for index in indexes.iter().filter(|i| i.unique) {
        let Ok(Some(value)) = key::extract(record, &index.key_path) else {
            continue;
        };

        let taken = records_with_value(conn, database, collection, &index.key_path, &value)?
            .iter()
            .any(|(k, _)| k != own_key);

        if taken {
            return Err(StoreError::Constraint(format!(
                "unique index '{}' already contains {}",
                index.name, value
            )));
        }
    }
    Ok(())
}

fn store_record(
    conn: &Connection,
    database: &str,
    collection: &str,
    options: &CollectionOptions,
    key: &Key,
    record: &Value,
) -> Result<()> {
    conn.execute(
        "INSERT INTO object_records (database, collection, key, value) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(database, collection, key) DO UPDATE SET value = excluded.value",
        params![database, collection, key.encode(), serde_json::to_string(record)?],
    )?;

    if options.auto_increment {
        if let Key::Int(i) = key {
            // NULL marks the generator as exhausted
            match i.checked_add(1) {
                Some(next) => conn.execute(
                    "UPDATE object_collections SET next_key = MAX(next_key, ?3)
                     WHERE database = ?1 AND name = ?2 AND next_key IS NOT NULL",
                    params![database, collection, next],
                )?,
                None => conn.execute(
                    "UPDATE object_collections SET next_key = NULL
                     WHERE database = ?1 AND name = ?2",
                    params![database, collection],
                )?,
            };
        }
    }
    Ok(())
}
