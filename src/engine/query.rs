//! Query Executor
//!
//! Record operations on one collection (optionally through one index) of
//! an open database. Every call runs in its own transaction and resolves
//! once for the whole transaction.
//!
//! Inserts skip records that violate a key or unique-index constraint and
//! keep going; the skipped record is reported to the log sink only.
//! Updates surface every error.

use futures_util::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

use super::console::LogSink;
use super::store::{self, DatabaseHandle, Key, StoreError, Transaction, TransactionMode};

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Database is not open")]
    NotOpen,

    #[error("Transaction failed: {0}")]
    Transaction(#[source] StoreError),

    #[error("Lookup failed: {0}")]
    Lookup(#[source] StoreError),

    #[error("Failed to serialize record: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to deserialize record: {0}")]
    Deserialize(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueryError>;

/// Executor bound to the handle that was current when it was prepared
pub struct Query<R = Value> {
    handle: Option<Arc<dyn DatabaseHandle>>,
    collection: String,
    index: Option<String>,
    sink: Arc<dyn LogSink>,
    _record: PhantomData<fn() -> R>,
}

impl<R> Query<R> {
    pub fn new(
        handle: Option<Arc<dyn DatabaseHandle>>,
        collection: &str,
        index: Option<&str>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            handle,
            collection: collection.to_string(),
            index: index.map(str::to_string),
            sink,
            _record: PhantomData,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn index(&self) -> Option<&str> {
        self.index.as_deref()
    }

    pub fn is_bound(&self) -> bool {
        self.handle.is_some()
    }

    /// Delete the record stored under `key`. Missing keys are not an error.
    pub async fn delete(&self, key: impl Into<Key>) -> Result<()> {
        let key: Key = key.into();
        self.delete_many([key]).await
    }

    pub async fn delete_many<I>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<Key>,
    {
        let keys: Vec<Key> = keys.into_iter().map(Into::into).collect();
        let tx = self.begin(TransactionMode::ReadWrite).await?;

        for key in &keys {
            match tx.delete(&self.collection, key).await {
                Ok(()) => self
                    .sink
                    .log(&format!("deleted {} from '{}'", key, self.collection)),
                Err(e) if e.is_constraint() => self.sink.info(&format!(
                    "ignoring constraint error deleting {} from '{}': {}",
                    key, self.collection, e
                )),
                Err(e) => return Err(self.fail(tx, e).await),
            }
        }

        self.finish(tx, true).await
    }

    async fn begin(&self, mode: TransactionMode) -> Result<Box<dyn Transaction>> {
        let handle = self.handle.as_ref().ok_or(QueryError::NotOpen)?;

        if let Some(index) = &self.index {
            let names = handle
                .index_names(&self.collection)
                .map_err(QueryError::Transaction)?;
            if !names.iter().any(|name| name == index) {
                return Err(QueryError::Transaction(StoreError::NotFound(format!(
                    "index '{}' on '{}'",
                    index, self.collection
                ))));
            }
        }

        handle
            .transaction(&[self.collection.as_str()], mode)
            .await
            .map_err(|e| {
                self.sink.error(&format!(
                    "failed to start {} transaction on '{}': {}",
                    mode, self.collection, e
                ));
                QueryError::Transaction(e)
            })
    }

    /// Commit, optionally swallowing a constraint failure raised at commit.
    async fn finish(&self, tx: Box<dyn Transaction>, suppress_constraint: bool) -> Result<()> {
        match tx.commit().await {
            Ok(()) => Ok(()),
            Err(e) if suppress_constraint && e.is_constraint() => {
                self.sink.error(&format!(
                    "transaction on '{}' hit a constraint at commit: {}",
                    self.collection, e
                ));
                Ok(())
            }
            Err(e) => {
                self.sink.error(&format!(
                    "transaction on '{}' failed to commit: {}",
                    self.collection, e
                ));
                Err(QueryError::Transaction(e))
            }
        }
    }

    async fn fail(&self, tx: Box<dyn Transaction>, error: StoreError) -> QueryError {
        self.sink.error(&format!(
            "aborting transaction on '{}': {}",
            self.collection, error
        ));
        tx.abort().await;
        QueryError::Transaction(error)
    }

    async fn lookup(&self, tx: &dyn Transaction, key: &Key) -> store::Result<Option<Value>> {
        match &self.index {
            Some(index) => tx.get_by_index(&self.collection, index, key).await,
            None => tx.get(&self.collection, key).await,
        }
    }
}

impl<R: Serialize> Query<R> {
    pub async fn insert(&self, record: &R) -> Result<()> {
        self.insert_many(std::slice::from_ref(record)).await
    }

    /// Add every record in one transaction. Records whose key or unique
    /// index value is already taken are skipped.
    pub async fn insert_many(&self, records: &[R]) -> Result<()> {
        let values = encode_all(records)?;
        let tx = self.begin(TransactionMode::ReadWrite).await?;

        for value in values {
            match tx.add(&self.collection, value).await {
                Ok(key) => self
                    .sink
                    .log(&format!("inserted {} into '{}'", key, self.collection)),
                Err(e) if e.is_constraint() => self.sink.info(&format!(
                    "skipping record for '{}': {}",
                    self.collection, e
                )),
                Err(e) => return Err(self.fail(tx, e).await),
            }
        }

        self.finish(tx, true).await
    }

    pub async fn update(&self, record: &R) -> Result<()> {
        self.update_many(std::slice::from_ref(record)).await
    }

    /// Insert or replace every record in one transaction.
    pub async fn update_many(&self, records: &[R]) -> Result<()> {
        let values = encode_all(records)?;
        let tx = self.begin(TransactionMode::ReadWrite).await?;

        for value in values {
            match tx.put(&self.collection, value).await {
                Ok(key) => self
                    .sink
                    .log(&format!("updated {} in '{}'", key, self.collection)),
                Err(e) => return Err(self.fail(tx, e).await),
            }
        }

        self.finish(tx, false).await
    }
}

impl<R: DeserializeOwned> Query<R> {
    /// Point lookup by primary key, or by the index value when the query
    /// was prepared with an index.
    pub async fn find(&self, key: impl Into<Key>) -> Result<Option<R>> {
        let key: Key = key.into();
        let tx = self.begin(TransactionMode::ReadOnly).await?;

        let found = match self.lookup(tx.as_ref(), &key).await {
            Ok(found) => found,
            Err(e) => {
                self.sink.error(&format!(
                    "lookup of {} in '{}' failed: {}",
                    key, self.collection, e
                ));
                tx.abort().await;
                return Err(QueryError::Lookup(e));
            }
        };
        self.finish(tx, false).await?;

        found.map(decode).transpose()
    }

    /// Look up every key concurrently in one read-only transaction. Keys
    /// without a record are left out; any failed lookup fails the call.
    pub async fn where_in<I>(&self, keys: I) -> Result<Vec<R>>
    where
        I: IntoIterator,
        I::Item: Into<Key>,
    {
        let keys: Vec<Key> = keys.into_iter().map(Into::into).collect();
        let tx = self.begin(TransactionMode::ReadOnly).await?;

        let lookups = keys.iter().map(|key| self.lookup(tx.as_ref(), key));
        let found = match try_join_all(lookups).await {
            Ok(found) => found,
            Err(e) => {
                self.sink.error(&format!(
                    "batch lookup in '{}' failed: {}",
                    self.collection, e
                ));
                tx.abort().await;
                return Err(QueryError::Lookup(e));
            }
        };
        self.finish(tx, false).await?;

        found.into_iter().flatten().map(decode).collect()
    }
}

impl<R> Clone for Query<R> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            collection: self.collection.clone(),
            index: self.index.clone(),
            sink: self.sink.clone(),
            _record: PhantomData,
        }
    }
}

impl<R> fmt::Debug for Query<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("collection", &self.collection)
            .field("index", &self.index)
            .field("bound", &self.handle.is_some())
            .finish()
    }
}

fn encode_all<R: Serialize>(records: &[R]) -> Result<Vec<Value>> {
    records
        .iter()
        .map(|record| serde_json::to_value(record).map_err(QueryError::Serialize))
        .collect()
}

fn decode<R: DeserializeOwned>(value: Value) -> Result<R> {
    serde_json::from_value(value).map_err(QueryError::Deserialize)
}
