//! Connection to one named, versioned database
//!
//! Owns the substrate handle and drives the version-change flow: when the
//! stored version is behind, the caller's upgrade callback runs inside the
//! version-change transaction and usually feeds registry steps to
//! [`Connection::migrate`]. Clones share the same handle and state.
//!
//! Callers must not `close` or drop the database while queries created from
//! the connection still have operations in flight.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::console::{default_sink, LogSink};
use super::migration::{MigrationError, MigrationRegistry, MigrationStep};
use super::query::Query;
use super::store::{Backend, DatabaseHandle, Opened, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unopened,
    Opening,
    Open,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unopened => write!(f, "unopened"),
            ConnectionState::Opening => write!(f, "opening"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConstructionError {
    #[error("Database name cannot be empty")]
    EmptyName,
}

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Failed to open database: {0}")]
    Store(#[from] StoreError),

    #[error("Upgrade failed: {0}")]
    Upgrade(#[from] MigrationError),

    #[error("Cannot open a connection that is {0}")]
    InvalidState(ConnectionState),
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection is not open")]
    NotOpen,

    #[error("Operation not allowed while the connection is {0}")]
    InvalidState(ConnectionState),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    version: u32,
    backend: Arc<dyn Backend>,
    sink: Arc<dyn LogSink>,
    slot: Mutex<Slot>,
}

struct Slot {
    state: ConnectionState,
    handle: Option<Arc<dyn DatabaseHandle>>,
    observed_version: Option<u32>,
    upgrade_needed: bool,
    initialization_needed: bool,
}

impl Connection {
    pub fn new(backend: Arc<dyn Backend>, name: &str, version: u32) -> Result<Self, ConstructionError> {
        Self::with_sink(backend, name, version, default_sink())
    }

    pub fn with_sink(
        backend: Arc<dyn Backend>,
        name: &str,
        version: u32,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, ConstructionError> {
        if name.is_empty() {
            return Err(ConstructionError::EmptyName);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                version,
                backend,
                sink,
                slot: Mutex::new(Slot {
                    state: ConnectionState::Unopened,
                    handle: None,
                    observed_version: None,
                    upgrade_needed: false,
                    initialization_needed: false,
                }),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The requested version
    pub fn version(&self) -> u32 {
        self.inner.version
    }

    pub fn state(&self) -> ConnectionState {
        self.slot().state
    }

    /// Version reported by the store at the last successful open
    pub fn observed_version(&self) -> Option<u32> {
        self.slot().observed_version
    }

    /// True when the last open ran a version change
    pub fn upgrade_needed(&self) -> bool {
        self.slot().upgrade_needed
    }

    /// True when the last open created the database
    pub fn initialization_needed(&self) -> bool {
        self.slot().initialization_needed
    }

    pub fn handle(&self) -> Option<Arc<dyn DatabaseHandle>> {
        self.slot().handle.clone()
    }

    /// Open the database. When the stored version is behind,
    /// `on_upgrade_needed` receives this connection and the old version and
    /// runs inside the version-change transaction; an error from it aborts
    /// the upgrade and leaves the stored schema untouched.
    pub async fn open<F, Fut>(&self, on_upgrade_needed: F) -> Result<Arc<dyn DatabaseHandle>, OpenError>
    where
        F: FnOnce(Connection, u32) -> Fut,
        Fut: Future<Output = Result<(), MigrationError>>,
    {
        {
            let mut slot = self.slot();
            match slot.state {
                ConnectionState::Unopened | ConnectionState::Closed => {
                    slot.state = ConnectionState::Opening;
                }
                state => return Err(OpenError::InvalidState(state)),
            }
        }
        // Dropping the open future before it settles rolls the slot back
        let mut attempt = OpenAttempt { conn: self, settled: false };

        let name = &self.inner.name;
        let version = self.inner.version;

        let opened = match self.inner.backend.open(name, version).await {
            Ok(opened) => opened,
            Err(e) => {
                self.inner.sink.error(&format!("failed to open '{}': {}", name, e));
                return Err(OpenError::Store(e));
            }
        };

        let upgrade = match opened {
            Opened::Ready(handle) => {
                attempt.settled = true;
                return Ok(self.finish_open(handle, false, false));
            }
            Opened::Upgrade(upgrade) => upgrade,
        };

        let old_version = upgrade.old_version();
        self.inner.sink.info(&format!(
            "upgrading '{}' from version {} to {}",
            name,
            old_version,
            upgrade.new_version()
        ));
        self.slot().handle = Some(upgrade.handle());

        if let Err(e) = on_upgrade_needed(self.clone(), old_version).await {
            self.inner.sink.error(&format!("upgrade of '{}' aborted: {}", name, e));
            upgrade.abort().await;
            return Err(OpenError::Upgrade(e));
        }

        match upgrade.commit().await {
            Ok(handle) => {
                attempt.settled = true;
                Ok(self.finish_open(handle, true, old_version == 0))
            }
            Err(e) => {
                self.inner.sink.error(&format!("upgrade of '{}' failed to commit: {}", name, e));
                Err(OpenError::Store(e))
            }
        }
    }

    /// Open and run the registry's steps for every version above the stored one.
    pub async fn open_with_registry(
        &self,
        registry: &MigrationRegistry,
    ) -> Result<Arc<dyn DatabaseHandle>, OpenError> {
        let target = self.inner.version;
        self.open(|conn, old_version| async move {
            for version in (old_version + 1)..=target {
                conn.migrate(registry.steps(conn.name(), version)).await?;
            }
            Ok::<(), MigrationError>(())
        })
        .await
    }

    /// Run `steps` in order against the current handle. Schema changes are
    /// only accepted while an upgrade is running.
    pub async fn migrate(&self, steps: &[MigrationStep]) -> Result<(), MigrationError> {
        if steps.is_empty() {
            return Ok(());
        }

        let handle = self.handle().ok_or(MigrationError::NotOpen)?;
        for step in steps {
            self.inner.sink.log(&format!(
                "applying migration step '{}' to '{}'",
                step.name(),
                self.inner.name
            ));
            step.apply(handle.as_ref())?;
        }
        Ok(())
    }

    /// Release the handle.
    pub fn close(&self) -> Result<(), ConnectionError> {
        let mut slot = self.slot();
        if slot.state != ConnectionState::Open {
            return Err(ConnectionError::NotOpen);
        }

        if let Some(handle) = slot.handle.take() {
            handle.close();
        }
        slot.state = ConnectionState::Closed;

        self.inner.sink.info(&format!("closed '{}'", self.inner.name));
        Ok(())
    }

    /// Delete the whole database. Only valid while unopened or closed.
    pub async fn drop_database(&self) -> Result<(), ConnectionError> {
        let state = self.state();
        if !matches!(state, ConnectionState::Unopened | ConnectionState::Closed) {
            return Err(ConnectionError::InvalidState(state));
        }

        if let Err(e) = self.inner.backend.delete_database(&self.inner.name).await {
            self.inner.sink.error(&format!("failed to drop '{}': {}", self.inner.name, e));
            return Err(e.into());
        }

        let mut slot = self.slot();
        slot.state = ConnectionState::Unopened;
        slot.observed_version = None;
        slot.upgrade_needed = false;
        slot.initialization_needed = false;

        self.inner.sink.info(&format!("dropped '{}'", self.inner.name));
        Ok(())
    }

    /// Query over `collection` (and `index`, if given) bound to the current
    /// handle. Before `open` completes every operation of the query fails.
    pub fn prepare_query(&self, collection: &str, index: Option<&str>) -> Query {
        self.prepare_query_as(collection, index)
    }

    /// Typed variant of [`Connection::prepare_query`]
    pub fn prepare_query_as<R>(&self, collection: &str, index: Option<&str>) -> Query<R> {
        Query::new(self.handle(), collection, index, self.inner.sink.clone())
    }

    fn finish_open(
        &self,
        handle: Arc<dyn DatabaseHandle>,
        upgraded: bool,
        initialized: bool,
    ) -> Arc<dyn DatabaseHandle> {
        let version = handle.version();
        {
            let mut slot = self.slot();
            slot.state = ConnectionState::Open;
            slot.handle = Some(handle.clone());
            slot.observed_version = Some(version);
            slot.upgrade_needed = upgraded;
            slot.initialization_needed = initialized;
        }

        self.inner
            .sink
            .info(&format!("opened '{}' at version {}", self.inner.name, version));
        handle
    }

    fn reset(&self) {
        let mut slot = self.slot();
        slot.state = ConnectionState::Unopened;
        slot.handle = None;
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resets a connection left in `Opening` by a failed or cancelled open.
/// The upgrade transaction rolls itself back when dropped.
struct OpenAttempt<'a> {
    conn: &'a Connection,
    settled: bool,
}

impl Drop for OpenAttempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.conn.reset();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.handle.take() {
            if !handle.is_closed() {
                self.sink
                    .error(&format!("connection to '{}' dropped while open", self.name));
                handle.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::console::{LogLevel, MemorySink};
    use crate::engine::store::{CollectionOptions, MemoryBackend};
    use std::time::Duration;
    use tokio::time::timeout;

    fn backend() -> Arc<dyn Backend> {
        Arc::new(MemoryBackend::new())
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = Connection::new(backend(), "", 1).unwrap_err();
        assert!(matches!(err, ConstructionError::EmptyName));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let conn = Connection::new(backend(), "App", 1).unwrap();
        assert_eq!(conn.state(), ConnectionState::Unopened);
        assert!(matches!(conn.close(), Err(ConnectionError::NotOpen)));

        conn.open(|_, _| async { Ok(()) }).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(matches!(
            conn.open(|_, _| async { Ok(()) }).await,
            Err(OpenError::InvalidState(ConnectionState::Open))
        ));
        assert!(matches!(
            conn.drop_database().await,
            Err(ConnectionError::InvalidState(ConnectionState::Open))
        ));

        conn.close().unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);

        conn.drop_database().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Unopened);
        assert_eq!(conn.observed_version(), None);
    }

    #[tokio::test]
    async fn test_flags_after_fresh_open() {
        let conn = Connection::new(backend(), "App", 2).unwrap();
        conn.open(|_, old| async move {
            assert_eq!(old, 0);
            Ok(())
        })
        .await
        .unwrap();

        assert!(conn.upgrade_needed());
        assert!(conn.initialization_needed());
        assert_eq!(conn.observed_version(), Some(2));
    }

    #[tokio::test]
    async fn test_migrate_outside_upgrade_fails() {
        let conn = Connection::new(backend(), "App", 1).unwrap();
        conn.open(|_, _| async { Ok(()) }).await.unwrap();

        let step = MigrationStep::create_collection("late", CollectionOptions::key_path("id"));
        let err = conn.migrate(&[step]).await.unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Step { source: StoreError::InvalidState(_), .. }
        ));
        assert!(conn.migrate(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropping_open_connection_closes_handle() {
        let backend = backend();
        let sink = MemorySink::new();
        let conn = Connection::with_sink(backend.clone(), "App", 1, sink.clone()).unwrap();
        let handle = conn.open(|_, _| async { Ok(()) }).await.unwrap();

        drop(conn);
        assert!(handle.is_closed());
        assert!(sink.contains(LogLevel::Error, "dropped while open"));
        backend.delete_database("App").await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_open_resets_state() {
        let conn = Connection::new(backend(), "App", 1).unwrap();
        let stalled = conn.open(|_, _| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        assert!(timeout(Duration::from_millis(50), stalled).await.is_err());
        assert_eq!(conn.state(), ConnectionState::Unopened);
        assert!(conn.handle().is_none());

        // The aborted first upgrade leaves no database behind
        conn.open(|_, old| async move {
            assert_eq!(old, 0);
            Ok(())
        })
        .await
        .unwrap();
        assert!(conn.initialization_needed());

        conn.close().unwrap();
        conn.drop_database().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_upgrade_resets_state() {
        let conn = Connection::new(backend(), "App", 1).unwrap();
        let err = conn
            .open(|_, _| async { Err(MigrationError::Aborted("no".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, OpenError::Upgrade(_)));
        assert_eq!(conn.state(), ConnectionState::Unopened);
        assert!(conn.handle().is_none());
    }
}
