//! Substrate error types

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A uniqueness or primary-key conflict on a write
    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The record or key could not be used (missing key, unsupported key type)
    #[error("Data error: {0}")]
    Data(String),

    #[error("Read-only transaction: {0}")]
    ReadOnly(String),

    /// Deletion refused because handles on the database are still open
    #[error("Blocked: {0}")]
    Blocked(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// True for the conflict class that insert is allowed to swallow.
    pub fn is_constraint(&self) -> bool {
        match self {
            StoreError::Constraint(_) => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }

    pub(crate) fn poisoned() -> Self {
        StoreError::InvalidState("store lock poisoned".to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_classification() {
        assert!(StoreError::Constraint("dup".into()).is_constraint());
        assert!(!StoreError::NotFound("admins".into()).is_constraint());
        assert!(!StoreError::Data("no key".into()).is_constraint());

        let sqlite = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY),
            None,
        );
        assert!(StoreError::Sqlite(sqlite).is_constraint());
    }
}
