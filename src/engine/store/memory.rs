//! In-process object store
//!
//! Databases live for the lifetime of the backend value. Read-write
//! transactions on one database are serialized through an async writer lock
//! and work on copies of the collections in scope, which are swapped in on
//! commit. An upgrade holds the writer lock for its whole duration.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::error::{Result, StoreError};
use super::key::{self, Key};
use super::{
    Backend, CollectionOptions, DatabaseHandle, DatabaseInfo, IndexOptions, Opened, Transaction,
    TransactionMode, UpgradeTransaction,
};

type Registry = Arc<Mutex<HashMap<String, Arc<DatabaseCell>>>>;

/// Volatile backend keeping every database in memory
#[derive(Clone, Default)]
pub struct MemoryBackend {
    databases: Registry,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

struct DatabaseCell {
    name: String,
    state: RwLock<DatabaseState>,
    writer: Arc<tokio::sync::Mutex<()>>,
    open_handles: AtomicUsize,
}

impl DatabaseCell {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(DatabaseState::default()),
            writer: Arc::new(tokio::sync::Mutex::new(())),
            open_handles: AtomicUsize::new(0),
        }
    }

    fn version(&self) -> Result<u32> {
        Ok(self.state.read().map_err(|_| StoreError::poisoned())?.version)
    }
}

#[derive(Debug, Clone, Default)]
struct DatabaseState {
    version: u32,
    collections: BTreeMap<String, CollectionData>,
}

#[derive(Debug, Clone)]
struct CollectionData {
    options: CollectionOptions,
    indexes: BTreeMap<String, IndexOptions>,
    records: BTreeMap<Key, Value>,
    /// `None` once an explicit key reached `i64::MAX`
    next_key: Option<i64>,
}

impl CollectionData {
    fn new(options: CollectionOptions) -> Self {
        Self {
            options,
            indexes: BTreeMap::new(),
            records: BTreeMap::new(),
            next_key: Some(1),
        }
    }

    /// Key for `record`, generating one when the collection auto-increments.
    /// The generator only advances once the write succeeds.
    fn resolve_key(&self, record: &mut Value) -> Result<Key> {
        match key::extract(record, &self.options.key_path)? {
            Some(k) => Ok(k),
            None if self.options.auto_increment => {
                let next = self.next_key.ok_or_else(|| {
                    StoreError::Constraint("key generator is exhausted".to_string())
                })?;
                let generated = Key::Int(next);
                key::inject(record, &self.options.key_path, &generated)?;
                Ok(generated)
            }
            None => Err(StoreError::Data(format!(
                "record has no key at '{}'",
                self.options.key_path
            ))),
        }
    }

    fn check_unique(&self, record: &Value, own_key: &Key) -> Result<()> {
        for index in self.indexes.values().filter(|i| i.unique) {
            let Ok(Some(value)) = key::extract(record, &index.key_path) else {
                continue;
            };

            let taken = self.records.iter().any(|(k, other)| {
                k != own_key
                    && matches!(key::extract(other, &index.key_path), Ok(Some(ref v)) if *v == value)
            });

            if taken {
                return Err(StoreError::Constraint(format!(
                    "unique index '{}' already contains {}",
                    index.name, value
                )));
            }
        }
        Ok(())
    }

    fn store(&mut self, key: Key, record: Value) {
        if self.options.auto_increment {
            if let (Key::Int(i), Some(next)) = (&key, self.next_key) {
                if *i >= next {
                    self.next_key = i.checked_add(1);
                }
            }
        }
        self.records.insert(key, record);
    }

    fn add(&mut self, mut record: Value) -> Result<Key> {
        let key = self.resolve_key(&mut record)?;
        if self.records.contains_key(&key) {
            return Err(StoreError::Constraint(format!("key {} already exists", key)));
        }
        self.check_unique(&record, &key)?;
        self.store(key.clone(), record);
        Ok(key)
    }

    fn put(&mut self, mut record: Value) -> Result<Key> {
        let key = self.resolve_key(&mut record)?;
        self.check_unique(&record, &key)?;
        self.store(key.clone(), record);
        Ok(key)
    }

    fn get_by_index(&self, index: &str, lookup: &Key) -> Result<Option<Value>> {
        let options = self
            .indexes
            .get(index)
            .ok_or_else(|| StoreError::NotFound(format!("index '{}'", index)))?;

        Ok(self
            .records
            .values()
            .find(|record| {
                matches!(key::extract(record, &options.key_path), Ok(Some(ref v)) if v == lookup)
            })
            .cloned())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn open(&self, name: &str, version: u32) -> Result<Opened> {
        if version == 0 {
            return Err(StoreError::Data("version must be a positive integer".to_string()));
        }

        let cell = {
            let mut databases = self.databases.lock().map_err(|_| StoreError::poisoned())?;
            databases
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(DatabaseCell::new(name)))
                .clone()
        };

        if cell.version()? >= version {
            return Ok(Opened::Ready(MemoryHandle::ready(cell)?));
        }

        let writer = cell.writer.clone().lock_owned().await;

        // Another opener may have upgraded while we waited for the lock
        let current = cell.state.read().map_err(|_| StoreError::poisoned())?.clone();
        if current.version >= version {
            drop(writer);
            return Ok(Opened::Ready(MemoryHandle::ready(cell)?));
        }

        debug!(database = %name, from = current.version, to = version, "memory upgrade started");

        let old_version = current.version;
        let handle = Arc::new(MemoryHandle::new(cell, old_version));
        *handle.upgrade.lock().map_err(|_| StoreError::poisoned())? = Some(current);

        Ok(Opened::Upgrade(Box::new(MemoryUpgrade {
            handle,
            databases: self.databases.clone(),
            old_version,
            new_version: version,
            _writer: writer,
        })))
    }

    async fn delete_database(&self, name: &str) -> Result<()> {
        let mut databases = self.databases.lock().map_err(|_| StoreError::poisoned())?;

        if let Some(cell) = databases.get(name) {
            let open = cell.open_handles.load(Ordering::SeqCst);
            if open > 0 {
                return Err(StoreError::Blocked(format!(
                    "database '{}' has {} open handle(s)",
                    name, open
                )));
            }
            databases.remove(name);
            debug!(database = %name, "memory database deleted");
        }

        Ok(())
    }

    async fn databases(&self) -> Result<Vec<DatabaseInfo>> {
        let databases = self.databases.lock().map_err(|_| StoreError::poisoned())?;
        let mut infos = Vec::new();

        for cell in databases.values() {
            let version = cell.version()?;
            if version > 0 {
                infos.push(DatabaseInfo {
                    name: cell.name.clone(),
                    version,
                });
            }
        }

        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }
}

struct MemoryHandle {
    cell: Arc<DatabaseCell>,
    version: AtomicU32,
    /// Working copy of the whole database while a version change runs
    upgrade: Mutex<Option<DatabaseState>>,
    closed: AtomicBool,
}

impl MemoryHandle {
    fn new(cell: Arc<DatabaseCell>, version: u32) -> Self {
        cell.open_handles.fetch_add(1, Ordering::SeqCst);
        Self {
            cell,
            version: AtomicU32::new(version),
            upgrade: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn ready(cell: Arc<DatabaseCell>) -> Result<Arc<dyn DatabaseHandle>> {
        let version = cell.version()?;
        Ok(Arc::new(Self::new(cell, version)))
    }

    fn with_schema<T>(&self, f: impl FnOnce(&mut DatabaseState) -> Result<T>) -> Result<T> {
        let mut upgrade = self.upgrade.lock().map_err(|_| StoreError::poisoned())?;
        match upgrade.as_mut() {
            Some(state) => f(state),
            None => Err(StoreError::InvalidState(
                "schema changes require a version-change transaction".to_string(),
            )),
        }
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl DatabaseHandle for MemoryHandle {
    fn name(&self) -> &str {
        &self.cell.name
    }

    fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    fn collection_names(&self) -> Result<Vec<String>> {
        let upgrade = self.upgrade.lock().map_err(|_| StoreError::poisoned())?;
        if let Some(state) = upgrade.as_ref() {
            return Ok(state.collections.keys().cloned().collect());
        }
        drop(upgrade);

        let state = self.cell.state.read().map_err(|_| StoreError::poisoned())?;
        Ok(state.collections.keys().cloned().collect())
    }

    fn create_collection(&self, name: &str, options: CollectionOptions) -> Result<()> {
        if options.key_path.is_empty() {
            return Err(StoreError::Data("key path cannot be empty".to_string()));
        }
        self.with_schema(|state| {
            if state.collections.contains_key(name) {
                return Err(StoreError::Constraint(format!(
                    "collection '{}' already exists",
                    name
                )));
            }
            state
                .collections
                .insert(name.to_string(), CollectionData::new(options));
            Ok(())
        })
    }

    fn delete_collection(&self, name: &str) -> Result<()> {
        self.with_schema(|state| {
            state
                .collections
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(format!("collection '{}'", name)))
        })
    }

    fn create_index(&self, collection: &str, index: IndexOptions) -> Result<()> {
        self.with_schema(|state| {
            let data = state
                .collections
                .get_mut(collection)
                .ok_or_else(|| StoreError::NotFound(format!("collection '{}'", collection)))?;

            if data.indexes.contains_key(&index.name) {
                return Err(StoreError::Constraint(format!(
                    "index '{}' already exists on '{}'",
                    index.name, collection
                )));
            }

            // Existing records must already satisfy a new unique index
            if index.unique {
                let mut seen = Vec::new();
                for record in data.records.values() {
                    if let Ok(Some(v)) = key::extract(record, &index.key_path) {
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

            data.indexes.insert(index.name.clone(), index);
            Ok(())
        })
    }

    fn delete_index(&self, collection: &str, index: &str) -> Result<()> {
        self.with_schema(|state| {
            let data = state
                .collections
                .get_mut(collection)
                .ok_or_else(|| StoreError::NotFound(format!("collection '{}'", collection)))?;
            data.indexes
                .remove(index)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(format!("index '{}'", index)))
        })
    }

    fn index_names(&self, collection: &str) -> Result<Vec<String>> {
        let names = |state: &DatabaseState| {
            state
                .collections
                .get(collection)
                .map(|data| data.indexes.keys().cloned().collect())
                .ok_or_else(|| StoreError::NotFound(format!("collection '{}'", collection)))
        };

        let upgrade = self.upgrade.lock().map_err(|_| StoreError::poisoned())?;
        if let Some(state) = upgrade.as_ref() {
            return names(state);
        }
        drop(upgrade);

        let state = self.cell.state.read().map_err(|_| StoreError::poisoned())?;
        names(&state)
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
            TransactionMode::ReadWrite => Some(self.cell.writer.clone().lock_owned().await),
            TransactionMode::ReadOnly => None,
        };

        let mut staged = BTreeMap::new();
        {
            let state = self.cell.state.read().map_err(|_| StoreError::poisoned())?;
            for name in scope {
                let data = state
                    .collections
                    .get(*name)
                    .ok_or_else(|| StoreError::NotFound(format!("collection '{}'", name)))?;
                if mode == TransactionMode::ReadWrite {
                    staged.insert(name.to_string(), data.clone());
                }
            }
        }

        Ok(Box::new(MemoryTransaction {
            cell: self.cell.clone(),
            scope: scope.iter().map(|s| s.to_string()).collect(),
            mode,
            staged: Mutex::new(staged),
            _writer: writer,
        }))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cell.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MemoryUpgrade {
    handle: Arc<MemoryHandle>,
    databases: Registry,
    old_version: u32,
    new_version: u32,
    _writer: OwnedMutexGuard<()>,
}

#[async_trait]
impl UpgradeTransaction for MemoryUpgrade {
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
        let staged = self
            .handle
            .upgrade
            .lock()
            .map_err(|_| StoreError::poisoned())?
            .take();

        let mut next = staged.ok_or_else(|| {
            StoreError::InvalidState("upgrade already finished".to_string())
        })?;
        next.version = self.new_version;

        *self.handle.cell.state.write().map_err(|_| StoreError::poisoned())? = next;
        self.handle.version.store(self.new_version, Ordering::SeqCst);

        debug!(
            database = %self.handle.cell.name,
            version = self.new_version,
            "memory upgrade committed"
        );
        Ok(self.handle.clone())
    }

    async fn abort(self: Box<Self>) {
        self.discard();
    }
}

impl MemoryUpgrade {
    /// Drop the staged state unless the upgrade already committed or aborted.
    fn discard(&self) {
        let staged = self
            .handle
            .upgrade
            .lock()
            .ok()
            .and_then(|mut upgrade| upgrade.take());
        if staged.is_none() {
            return;
        }
        self.handle.close();

        // A database created by this open does not outlive the failed upgrade
        if self.old_version == 0 {
            if let Ok(mut databases) = self.databases.lock() {
                let unused = databases
                    .get(&self.handle.cell.name)
                    .map(|cell| {
                        Arc::ptr_eq(cell, &self.handle.cell)
                            && cell.open_handles.load(Ordering::SeqCst) == 0
                    })
                    .unwrap_or(false);
                if unused {
                    databases.remove(&self.handle.cell.name);
                }
            }
        }

        debug!(database = %self.handle.cell.name, "memory upgrade aborted");
    }
}

impl Drop for MemoryUpgrade {
    fn drop(&mut self) {
        self.discard();
    }
}

struct MemoryTransaction {
    cell: Arc<DatabaseCell>,
    scope: Vec<String>,
    mode: TransactionMode,
    /// Working copies of the collections in scope (read-write only)
    staged: Mutex<BTreeMap<String, CollectionData>>,
    _writer: Option<OwnedMutexGuard<()>>,
}

impl MemoryTransaction {
    fn check_scope(&self, collection: &str) -> Result<()> {
        if self.scope.iter().any(|s| s == collection) {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!(
                "collection '{}' is not in the transaction scope",
                collection
            )))
        }
    }

    fn write<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut CollectionData) -> Result<T>,
    ) -> Result<T> {
        self.check_scope(collection)?;
        if self.mode == TransactionMode::ReadOnly {
            return Err(StoreError::ReadOnly(format!(
                "cannot write to '{}' in a readonly transaction",
                collection
            )));
        }

        let mut staged = self.staged.lock().map_err(|_| StoreError::poisoned())?;
        let data = staged
            .get_mut(collection)
            .ok_or_else(|| StoreError::NotFound(format!("collection '{}'", collection)))?;
        f(data)
    }

    fn read<T>(&self, collection: &str, f: impl FnOnce(&CollectionData) -> Result<T>) -> Result<T> {
        self.check_scope(collection)?;

        if self.mode == TransactionMode::ReadWrite {
            let staged = self.staged.lock().map_err(|_| StoreError::poisoned())?;
            let data = staged
                .get(collection)
                .ok_or_else(|| StoreError::NotFound(format!("collection '{}'", collection)))?;
            return f(data);
        }

        let state = self.cell.state.read().map_err(|_| StoreError::poisoned())?;
        let data = state
            .collections
            .get(collection)
            .ok_or_else(|| StoreError::NotFound(format!("collection '{}'", collection)))?;
        f(data)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    async fn add(&self, collection: &str, record: Value) -> Result<Key> {
        self.write(collection, |data| data.add(record))
    }

    async fn put(&self, collection: &str, record: Value) -> Result<Key> {
        self.write(collection, |data| data.put(record))
    }

    async fn get(&self, collection: &str, key: &Key) -> Result<Option<Value>> {
        self.read(collection, |data| Ok(data.records.get(key).cloned()))
    }

    async fn get_by_index(
        &self,
        collection: &str,
        index: &str,
        key: &Key,
    ) -> Result<Option<Value>> {
        self.read(collection, |data| data.get_by_index(index, key))
    }

    async fn delete(&self, collection: &str, key: &Key) -> Result<()> {
        self.write(collection, |data| {
            data.records.remove(key);
            Ok(())
        })
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.mode == TransactionMode::ReadOnly {
            return Ok(());
        }

        let staged = std::mem::take(&mut *self.staged.lock().map_err(|_| StoreError::poisoned())?);
        let mut state = self.cell.state.write().map_err(|_| StoreError::poisoned())?;
        for (name, data) in staged {
            if !state.collections.contains_key(&name) {
                return Err(StoreError::NotFound(format!("collection '{}'", name)));
            }
            state.collections.insert(name, data);
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}
