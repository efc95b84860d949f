//! Collection catalog and the schema-upgrade step
//!
//! The schema version lives in `PRAGMA user_version`. Collections are rows of
//! `nook_collections` and are only inserted while an upgrade transaction is
//! moving the database to a newer version.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::key::{Key, KeyKind};
use crate::Result;

/// Declared shape of a collection: its name, where the key lives in each
/// record and what type that key has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
    #[serde(default = "default_key_kind")]
    pub key_kind: KeyKind,
}

fn default_key_path() -> String {
    "id".to_string()
}

fn default_key_kind() -> KeyKind {
    KeyKind::String
}

impl CollectionSchema {
    /// A collection keyed by a string `id` field.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: default_key_path(),
            key_kind: default_key_kind(),
        }
    }

    pub fn with_key_path(mut self, key_path: impl Into<String>) -> Self {
        self.key_path = key_path.into();
        self
    }

    pub fn with_key_kind(mut self, key_kind: KeyKind) -> Self {
        self.key_kind = key_kind;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.key_path.split('.').any(|segment| segment.trim().is_empty()) {
            return Err(StorageError::InvalidKey(format!(
                "invalid key path {:?} for collection '{}'",
                self.key_path, self.name
            )));
        }
        Ok(())
    }

    /// Pull the key out of a record, walking dotted key paths.
    pub fn extract_key(&self, record: &serde_json::Value) -> Result<Key> {
        if !record.is_object() {
            return Err(StorageError::InvalidKey(format!(
                "records in '{}' must be JSON objects",
                self.name
            )));
        }

        let mut current = record;
        for segment in self.key_path.split('.') {
            current = current.get(segment).ok_or_else(|| {
                StorageError::InvalidKey(format!(
                    "record has no '{}' field required by collection '{}'",
                    self.key_path, self.name
                ))
            })?;
        }

        let key = Key::from_json(current).ok_or_else(|| {
            StorageError::InvalidKey(format!(
                "field '{}' must be a string or integer, got {}",
                self.key_path, current
            ))
        })?;
        self.check_key(&key)?;
        Ok(key)
    }

    pub fn check_key(&self, key: &Key) -> Result<()> {
        if key.kind() != self.key_kind {
            return Err(StorageError::InvalidKey(format!(
                "collection '{}' is keyed by {} values, got {} key {}",
                self.name,
                self.key_kind.as_str(),
                key.kind().as_str(),
                key
            )));
        }
        Ok(())
    }
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.len() > 255 {
        return Err(StorageError::InvalidCollection(name.to_string()));
    }
    Ok(())
}

pub(crate) fn read_version(conn: &Connection) -> Result<u32> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version.max(0) as u32)
}

fn set_version(conn: &Connection, version: u32) -> Result<()> {
    // PRAGMA does not take bound parameters
    conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
    Ok(())
}

fn ensure_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS nook_collections (
            name TEXT PRIMARY KEY,
            key_path TEXT NOT NULL,
            key_kind TEXT NOT NULL,
            created_version INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS nook_records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            record_key NOT NULL,
            value TEXT NOT NULL,
            UNIQUE (collection, record_key),
            FOREIGN KEY (collection) REFERENCES nook_collections(name) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_nook_records_collection ON nook_records(collection, seq);
    "#,
    )?;
    Ok(())
}

/// Move the database from `from` to `to`, creating every declared collection
/// that is not in the catalog yet. Must run inside the upgrade transaction.
pub(crate) fn run_upgrade(
    conn: &Connection,
    from: u32,
    to: u32,
    declared: &[CollectionSchema],
) -> Result<()> {
    tracing::info!(from, to, "Running schema upgrade");

    ensure_tables(conn)?;

    let created_at = Utc::now().to_rfc3339();
    for schema in declared {
        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM nook_collections WHERE name = ?1",
                [&schema.name],
                |row| row.get(0),
            )
            .optional()?;

        if exists.is_some() {
            continue;
        }

        conn.execute(
            "INSERT INTO nook_collections (name, key_path, key_kind, created_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                schema.name,
                schema.key_path,
                schema.key_kind.as_str(),
                to,
                created_at
            ],
        )?;
        tracing::info!(collection = %schema.name, version = to, "Created collection");
    }

    set_version(conn, to)?;
    Ok(())
}

pub(crate) fn load_catalog(conn: &Connection) -> Result<HashMap<String, CollectionSchema>> {
    let table: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'nook_collections'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if table.is_none() {
        return Ok(HashMap::new());
    }

    let mut stmt = conn.prepare("SELECT name, key_path, key_kind FROM nook_collections")?;
    let rows = stmt.query_map([], |row| {
        let name: String = row.get(0)?;
        let key_path: String = row.get(1)?;
        let kind_str: String = row.get(2)?;
        Ok((name, key_path, kind_str))
    })?;

    let mut catalog = HashMap::new();
    for row in rows {
        let (name, key_path, kind_str) = row?;
        let key_kind = kind_str.parse::<KeyKind>().map_err(|e| {
            StorageError::Open(format!("catalog entry for collection '{}': {}", name, e))
        })?;
        catalog.insert(
            name.clone(),
            CollectionSchema {
                name,
                key_path,
                key_kind,
            },
        );
    }

    Ok(catalog)
}
