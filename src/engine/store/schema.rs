//! SQL layout of the SQLite-backed store.
//! One file holds every database; records are JSON text keyed by the
//! encoded primary key.

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS object_databases (
    name TEXT PRIMARY KEY,
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS object_collections (
    database TEXT NOT NULL,
    name TEXT NOT NULL,
    key_path TEXT NOT NULL,
    auto_increment INTEGER NOT NULL DEFAULT 0,
    next_key INTEGER DEFAULT 1,
    PRIMARY KEY (database, name)
);

CREATE TABLE IF NOT EXISTS object_indexes (
    database TEXT NOT NULL,
    collection TEXT NOT NULL,
    name TEXT NOT NULL,
    key_path TEXT NOT NULL,
    is_unique INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (database, collection, name)
);

CREATE TABLE IF NOT EXISTS object_records (
    database TEXT NOT NULL,
    collection TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (database, collection, key)
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
