//! Per-collection record operations
//!
//! Each call acquires the managed connection (creating the collection through
//! a schema upgrade if needed) and runs exactly one transaction on a blocking
//! worker. Reads use deferred transactions, writes take the write lock up
//! front. A failed transaction is dropped uncommitted and SQLite rolls it back.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::{CommitGate, ConnectionHandle, ConnectionManager, TxMode};
use crate::error::{is_unique_violation, StorageError};
use crate::key::Key;
use crate::schema::CollectionSchema;
use crate::Result;

#[derive(Clone)]
pub struct Store {
    manager: ConnectionManager,
    timeout: Option<Duration>,
}

impl Store {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            timeout: None,
        }
    }

    /// Fail any operation that takes longer than `timeout` with
    /// [`StorageError::Timeout`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Insert a new record. A record whose key is already present fails with
    /// [`StorageError::Conflict`] and leaves the stored one untouched.
    pub async fn add<T: Serialize>(&self, collection: &str, record: T) -> Result<T> {
        let value = serde_json::to_value(&record)?;

        let key = self
            .run(collection, TxMode::ReadWrite, move |schema, tx| {
                let key = schema.extract_key(&value)?;
                let json = serde_json::to_string(&value)?;
                match tx.execute(
                    "INSERT INTO nook_records (collection, record_key, value) VALUES (?1, ?2, ?3)",
                    rusqlite::params![schema.name, key, json],
                ) {
                    Ok(_) => Ok(key),
                    Err(e) if is_unique_violation(&e) => Err(StorageError::Conflict {
                        collection: schema.name.clone(),
                        key: key.to_string(),
                    }),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        tracing::debug!(collection, key = %key, "Added record");
        Ok(record)
    }

    /// Insert or replace a record. A replaced record keeps its position in
    /// insertion order.
    pub async fn put<T: Serialize>(&self, collection: &str, record: T) -> Result<T> {
        let value = serde_json::to_value(&record)?;

        let key = self
            .run(collection, TxMode::ReadWrite, move |schema, tx| {
                let key = schema.extract_key(&value)?;
                tx.execute(
                    "INSERT INTO nook_records (collection, record_key, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT (collection, record_key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![schema.name, key, serde_json::to_string(&value)?],
                )?;
                Ok(key)
            })
            .await?;

        tracing::debug!(collection, key = %key, "Stored record");
        Ok(record)
    }

    /// Look up one record. A missing key is `Ok(None)`.
    pub async fn get<T: DeserializeOwned>(
        &self,
        collection: &str,
        key: impl Into<Key>,
    ) -> Result<Option<T>> {
        let key = key.into();

        let raw: Option<String> = self
            .run(collection, TxMode::ReadOnly, move |schema, tx| {
                schema.check_key(&key)?;
                let value = tx
                    .query_row(
                        "SELECT value FROM nook_records WHERE collection = ?1 AND record_key = ?2",
                        rusqlite::params![schema.name, key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;

        raw.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(Into::into)
    }

    /// Every record in the collection, in insertion order.
    pub async fn get_all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        let rows: Vec<String> = self
            .run(collection, TxMode::ReadOnly, |schema, tx| {
                let mut stmt = tx.prepare(
                    "SELECT value FROM nook_records WHERE collection = ?1 ORDER BY seq",
                )?;
                let rows = stmt
                    .query_map([&schema.name], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(rows)
            })
            .await?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(Into::into))
            .collect()
    }

    pub async fn count(&self, collection: &str) -> Result<u64> {
        self.run(collection, TxMode::ReadOnly, |schema, tx| {
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM nook_records WHERE collection = ?1",
                [&schema.name],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    /// Remove one record. Removing a key that is not there still succeeds.
    pub async fn delete(&self, collection: &str, key: impl Into<Key>) -> Result<()> {
        let key = key.into();
        let logged = key.clone();

        let removed = self
            .run(collection, TxMode::ReadWrite, move |schema, tx| {
                schema.check_key(&key)?;
                let removed = tx.execute(
                    "DELETE FROM nook_records WHERE collection = ?1 AND record_key = ?2",
                    rusqlite::params![schema.name, key],
                )?;
                Ok(removed)
            })
            .await?;

        tracing::debug!(collection, key = %logged, removed, "Deleted record");
        Ok(())
    }

    pub async fn clear(&self, collection: &str) -> Result<()> {
        let removed = self
            .run(collection, TxMode::ReadWrite, |schema, tx| {
                Ok(tx.execute(
                    "DELETE FROM nook_records WHERE collection = ?1",
                    [&schema.name],
                )?)
            })
            .await?;

        tracing::debug!(collection, removed, "Cleared collection");
        Ok(())
    }

    async fn run<F, T>(&self, collection: &str, mode: TxMode, op: F) -> Result<T>
    where
        F: Fn(&CollectionSchema, &Transaction<'_>) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let _active = self.manager.track_operation().await;
        let op = Arc::new(op);
        let gate = Arc::new(CommitGate::default());

        let attempt = async {
            let handle = self.manager.ensure_collection(collection).await?;
            match execute(&handle, collection, mode, &gate, Arc::clone(&op)).await {
                Err(StorageError::VersionChanged(version)) => {
                    // Another connection upgraded the file; retry once on a
                    // connection at the new version.
                    tracing::warn!(
                        collection,
                        stale = handle.version(),
                        version,
                        "Connection superseded, reopening"
                    );
                    self.manager.invalidate(&handle).await;
                    let handle = self.manager.ensure_collection(collection).await?;
                    execute(&handle, collection, mode, &gate, op).await
                }
                other => other,
            }
        };

        let Some(limit) = self.timeout else {
            return attempt.await;
        };

        tokio::pin!(attempt);
        tokio::select! {
            result = &mut attempt => result,
            _ = tokio::time::sleep(limit) => {
                if gate.cancel() {
                    tracing::warn!(collection, ?limit, "Operation timed out");
                    Err(StorageError::Timeout(limit))
                } else {
                    // Committed just as the limit passed; report what happened
                    attempt.await
                }
            }
        }
    }
}

async fn execute<F, T>(
    handle: &Arc<ConnectionHandle>,
    collection: &str,
    mode: TxMode,
    gate: &Arc<CommitGate>,
    op: Arc<F>,
) -> Result<T>
where
    F: Fn(&CollectionSchema, &Transaction<'_>) -> Result<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    let handle = Arc::clone(handle);
    let gate = Arc::clone(gate);
    let collection = collection.to_string();
    tokio::task::spawn_blocking(move || {
        handle.transaction(&collection, mode, &gate, |schema, tx| (*op)(schema, tx))
    })
    .await?
}
