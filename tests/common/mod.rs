use objectdb::engine::store::{Backend, MemoryBackend, SqliteBackend};
use std::sync::Arc;
use tempfile::TempDir;

pub struct Fixture {
    pub label: &'static str,
    pub backend: Arc<dyn Backend>,
    _dir: Option<TempDir>,
}

/// One fresh backend of each kind
pub fn backends() -> Vec<Fixture> {
    let dir = tempfile::tempdir().unwrap();
    let sqlite = SqliteBackend::new(&dir.path().join("objectdb.db")).unwrap();

    vec![
        Fixture {
            label: "memory",
            backend: Arc::new(MemoryBackend::new()),
            _dir: None,
        },
        Fixture {
            label: "sqlite",
            backend: Arc::new(sqlite),
            _dir: Some(dir),
        },
    ]
}
