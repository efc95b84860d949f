//! Storage error types

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Local storage unsupported: {0}")]
    Unsupported(String),

    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Open blocked: another connection holds the database at version {version}")]
    Blocked { version: u32 },

    #[error("Requested version {requested} is lower than the stored version {current}")]
    VersionMismatch { requested: u32, current: u32 },

    #[error("Key {key} already exists in collection '{collection}'")]
    Conflict { collection: String, key: String },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid collection name: {0:?}")]
    InvalidCollection(String),

    #[error("Connection superseded: database is now at version {0}")]
    VersionChanged(u32),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled before commit")]
    Cancelled,

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::Task(err.to_string())
    }
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}
