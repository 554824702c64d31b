//! Error taxonomy surfaced by the [`crate::store::Store`].

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("database schema version {found} is newer than the build's expected version {expected}")]
    SchemaTooNew { found: i64, expected: i64 },

    #[error("entity not found")]
    NotFound,

    #[error("entity belongs to a different namespace")]
    AccessDenied,

    #[error("version mismatch")]
    VersionMismatch { current_version: i64, current_value: Value },

    #[error("conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
