//! Database connection lifecycle
//!
//! [`ConnectionManager`] owns the one connection this process intends to keep
//! open. Every open, reopen and schema upgrade is funnelled through its async
//! mutex, so two callers racing to add collections cannot lose an upgrade.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::{is_busy, StorageError};
use crate::schema::{self, CollectionSchema};
use crate::Result;

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long an open or transaction waits on a lock held by another
    /// connection before giving up.
    pub busy_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxMode {
    ReadOnly,
    ReadWrite,
}

impl TxMode {
    fn behavior(self) -> TransactionBehavior {
        match self {
            TxMode::ReadOnly => TransactionBehavior::Deferred,
            TxMode::ReadWrite => TransactionBehavior::Immediate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenRequest {
    /// Whatever version is stored (1 for a new database).
    Current,
    /// Exactly this version; upgrades if newer than the stored one.
    Exact(u32),
    /// One past the stored version.
    Bump,
}

impl OpenRequest {
    fn target(self, stored: u32) -> Result<u32> {
        match self {
            OpenRequest::Current => Ok(stored.max(1)),
            OpenRequest::Exact(0) => Err(StorageError::Open(
                "schema version must be at least 1".to_string(),
            )),
            OpenRequest::Exact(requested) if requested < stored => {
                Err(StorageError::VersionMismatch {
                    requested,
                    current: stored,
                })
            }
            OpenRequest::Exact(requested) => Ok(requested),
            OpenRequest::Bump => Ok(stored + 1),
        }
    }
}

/// An open connection bound to one schema version.
pub struct ConnectionHandle {
    conn: Mutex<Connection>,
    version: u32,
    collections: HashMap<String, CollectionSchema>,
}

impl ConnectionHandle {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run `f` in one transaction scoped to `collection`.
    ///
    /// Fails with [`StorageError::VersionChanged`] if another connection has
    /// upgraded the database since this handle was opened. Read-only
    /// transactions run with `query_only` set, so any write in `f` fails.
    /// Nothing is committed once `gate` has been cancelled.
    pub(crate) fn transaction<F, T>(
        &self,
        collection: &str,
        mode: TxMode,
        gate: &CommitGate,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&CollectionSchema, &Transaction<'_>) -> Result<T>,
    {
        let schema = self
            .collections
            .get(collection)
            .ok_or_else(|| StorageError::InvalidCollection(collection.to_string()))?;

        let mut conn = self.conn.lock();
        if mode == TxMode::ReadOnly {
            conn.pragma_update(None, "query_only", "ON")?;
        }

        let result = self.run_transaction(&mut conn, schema, mode, gate, f);

        if mode == TxMode::ReadOnly {
            conn.pragma_update(None, "query_only", "OFF")?;
        }
        result
    }

    fn run_transaction<F, T>(
        &self,
        conn: &mut Connection,
        schema: &CollectionSchema,
        mode: TxMode,
        gate: &CommitGate,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&CollectionSchema, &Transaction<'_>) -> Result<T>,
    {
        let tx = conn.transaction_with_behavior(mode.behavior())?;

        let on_disk = schema::read_version(&tx)?;
        if on_disk != self.version {
            return Err(StorageError::VersionChanged(on_disk));
        }

        let result = f(schema, &tx)?;
        gate.commit(tx)?;
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Open,
    Cancelled,
    Committed,
}

/// Decides, once, whether an operation's transaction commits or the caller
/// gives up on it. Commit and cancel are mutually exclusive.
#[derive(Debug)]
pub(crate) struct CommitGate {
    state: Mutex<GateState>,
}

impl Default for CommitGate {
    fn default() -> Self {
        Self {
            state: Mutex::new(GateState::Open),
        }
    }
}

impl CommitGate {
    /// Stop a pending commit. Returns `false` if the transaction already
    /// committed, in which case the caller must report its outcome.
    pub(crate) fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if *state == GateState::Committed {
            return false;
        }
        *state = GateState::Cancelled;
        true
    }

    fn commit(&self, tx: Transaction<'_>) -> Result<()> {
        let mut state = self.state.lock();
        if *state == GateState::Cancelled {
            // Dropping the transaction rolls it back
            return Err(StorageError::Cancelled);
        }
        tx.commit()?;
        *state = GateState::Committed;
        Ok(())
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("version", &self.version)
            .field("collections", &self.collection_names())
            .finish()
    }
}

struct ManagerInner {
    path: PathBuf,
    options: ConnectionOptions,
    declared: RwLock<BTreeMap<String, CollectionSchema>>,
    current: tokio::sync::Mutex<Option<Arc<ConnectionHandle>>>,
    /// Held shared by every store operation, exclusively by deletion.
    activity: tokio::sync::RwLock<()>,
}

/// Owner of the process-wide connection to one database file.
///
/// Clones share the same connection and declared collections.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(path: impl Into<PathBuf>, options: ConnectionOptions) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                path: path.into(),
                options,
                declared: RwLock::new(BTreeMap::new()),
                current: tokio::sync::Mutex::new(None),
                activity: tokio::sync::RwLock::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Register a collection to be created by the next schema upgrade.
    /// The first declaration of a name wins.
    pub fn declare(&self, schema: CollectionSchema) -> Result<()> {
        schema.validate()?;
        self.inner
            .declared
            .write()
            .entry(schema.name.clone())
            .or_insert(schema);
        Ok(())
    }

    pub fn declared(&self) -> Vec<CollectionSchema> {
        self.inner.declared.read().values().cloned().collect()
    }

    /// Return the live connection, opening one at the stored version if
    /// needed. A new database is created at version 1 with every declared
    /// collection.
    pub async fn open(&self) -> Result<Arc<ConnectionHandle>> {
        let mut current = self.inner.current.lock().await;
        if let Some(handle) = current.as_ref() {
            return Ok(Arc::clone(handle));
        }

        let handle = self.spawn_open(OpenRequest::Current).await?;
        *current = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Open at exactly `version`, upgrading if it is newer than the stored
    /// version. Asking for an older version fails.
    pub async fn open_version(&self, version: u32) -> Result<Arc<ConnectionHandle>> {
        let mut current = self.inner.current.lock().await;
        if let Some(handle) = current.as_ref() {
            if handle.version() == version {
                return Ok(Arc::clone(handle));
            }
        }

        *current = None;
        let handle = self.spawn_open(OpenRequest::Exact(version)).await?;
        *current = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Make sure `name` exists, bumping the schema version if it does not.
    /// Uses the declared schema for `name` if there is one, otherwise a
    /// string `id` key.
    pub async fn ensure_collection(&self, name: &str) -> Result<Arc<ConnectionHandle>> {
        schema::validate_name(name)?;
        let schema = self
            .inner
            .declared
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| CollectionSchema::new(name));
        self.ensure_schema(schema).await
    }

    pub async fn ensure_schema(&self, schema: CollectionSchema) -> Result<Arc<ConnectionHandle>> {
        let name = schema.name.clone();
        self.declare(schema)?;

        let mut current = self.inner.current.lock().await;
        let handle = match current.as_ref() {
            Some(handle) => Arc::clone(handle),
            None => {
                let handle = self.spawn_open(OpenRequest::Current).await?;
                *current = Some(Arc::clone(&handle));
                handle
            }
        };

        if handle.has_collection(&name) {
            return Ok(handle);
        }

        tracing::info!(
            collection = %name,
            version = handle.version(),
            "Collection missing, upgrading schema"
        );

        // Operations already holding the old handle finish on it; new ones
        // wait on this lock for the upgraded connection.
        *current = None;
        drop(handle);

        let upgraded = self.spawn_open(OpenRequest::Bump).await?;
        *current = Some(Arc::clone(&upgraded));

        if !upgraded.has_collection(&name) {
            return Err(StorageError::InvalidCollection(name));
        }
        Ok(upgraded)
    }

    /// Drop `stale` if it is still the live connection.
    pub(crate) async fn invalidate(&self, stale: &Arc<ConnectionHandle>) {
        let mut current = self.inner.current.lock().await;
        if current
            .as_ref()
            .is_some_and(|handle| Arc::ptr_eq(handle, stale))
        {
            *current = None;
        }
    }

    /// Release the connection. The next operation reopens it.
    pub async fn close(&self) {
        if let Some(handle) = self.inner.current.lock().await.take() {
            tracing::info!(version = handle.version(), "Closed database connection");
        }
    }

    /// Keeps [`delete_database`](Self::delete_database) waiting until the
    /// returned guard is dropped.
    pub(crate) async fn track_operation(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.inner.activity.read().await
    }

    /// Close the connection and remove the database file. Waits for
    /// operations already in flight to finish first.
    pub async fn delete_database(&self) -> Result<()> {
        let _drained = self.inner.activity.write().await;
        let mut current = self.inner.current.lock().await;
        *current = None;

        let path = self.inner.path.clone();
        tokio::task::spawn_blocking(move || remove_database_files(&path)).await??;

        tracing::info!(path = %self.inner.path.display(), "Deleted database");
        Ok(())
    }

    /// Version of the live connection, if one is open.
    pub async fn version(&self) -> Option<u32> {
        self.inner
            .current
            .lock()
            .await
            .as_ref()
            .map(|handle| handle.version())
    }

    pub async fn collection_names(&self) -> Result<Vec<String>> {
        Ok(self.open().await?.collection_names())
    }

    async fn spawn_open(&self, request: OpenRequest) -> Result<Arc<ConnectionHandle>> {
        let path = self.inner.path.clone();
        let options = self.inner.options.clone();
        let declared = self.declared();

        let handle =
            tokio::task::spawn_blocking(move || open_handle(&path, &options, request, &declared))
                .await??;

        tracing::info!(
            path = %self.inner.path.display(),
            version = handle.version(),
            collections = handle.collections.len(),
            "Opened database"
        );
        Ok(Arc::new(handle))
    }
}

fn open_handle(
    path: &Path,
    options: &ConnectionOptions,
    request: OpenRequest,
    declared: &[CollectionSchema],
) -> Result<ConnectionHandle> {
    check_location(path)?;

    let mut conn = Connection::open(path)
        .map_err(|e| StorageError::Open(format!("{}: {}", path.display(), e)))?;
    configure(&conn, options)?;

    let stored = schema::read_version(&conn)?;
    let version = if request.target(stored)? > stored {
        upgrade(&mut conn, request, declared)?
    } else {
        stored
    };

    let collections = schema::load_catalog(&conn)?;
    Ok(ConnectionHandle {
        conn: Mutex::new(conn),
        version,
        collections,
    })
}

/// Runs the upgrade under the write lock. The target is recomputed there
/// since another connection may have upgraded after our first read.
fn upgrade(conn: &mut Connection, request: OpenRequest, declared: &[CollectionSchema]) -> Result<u32> {
    let stored = schema::read_version(conn)?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| blocked_or(e, stored))?;

    let stored = schema::read_version(&tx)?;
    let target = request.target(stored)?;
    if target == stored {
        return Ok(stored);
    }

    schema::run_upgrade(&tx, stored, target, declared)?;
    tx.commit().map_err(|e| blocked_or(e, stored))?;
    Ok(target)
}

fn blocked_or(err: rusqlite::Error, version: u32) -> StorageError {
    if is_busy(&err) {
        tracing::warn!(version, "Schema upgrade blocked by another connection");
        StorageError::Blocked { version }
    } else {
        err.into()
    }
}

fn check_location(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Err(StorageError::Unsupported(format!(
            "{} is a directory",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            return Err(StorageError::Unsupported(format!(
                "directory {} does not exist",
                parent.display()
            )));
        }
    }
    Ok(())
}

fn configure(conn: &Connection, options: &ConnectionOptions) -> Result<()> {
    conn.busy_timeout(options.busy_timeout)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // Switching journal mode needs the write lock; skip it once the file is WAL
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        let _: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    }
    Ok(())
}

fn remove_database_files(path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut file = path.as_os_str().to_owned();
        file.push(suffix);
        match std::fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyKind;

    fn temp_manager() -> (tempfile::TempDir, ConnectionManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConnectionManager::new(dir.path().join("nook.db"), ConnectionOptions::default());
        (dir, manager)
    }

    #[tokio::test]
    async fn test_open_creates_declared_collections() {
        let (_dir, manager) = temp_manager();
        manager.declare(CollectionSchema::new("users")).unwrap();
        manager
            .declare(CollectionSchema::new("posts").with_key_kind(KeyKind::Integer))
            .unwrap();

        let handle = manager.open().await.unwrap();
        assert_eq!(handle.version(), 1);
        assert_eq!(handle.collection_names(), vec!["posts", "users"]);
        assert_eq!(
            handle.collection("posts").map(|s| s.key_kind),
            Some(KeyKind::Integer)
        );

        // Second open reuses the live handle
        let again = manager.open().await.unwrap();
        assert!(Arc::ptr_eq(&handle, &again));
    }

    #[tokio::test]
    async fn test_ensure_collection_bumps_version_once() {
        let (_dir, manager) = temp_manager();
        manager.declare(CollectionSchema::new("users")).unwrap();
        manager.open().await.unwrap();

        let handle = manager.ensure_collection("notes").await.unwrap();
        assert_eq!(handle.version(), 2);
        assert!(handle.has_collection("users"));
        assert!(handle.has_collection("notes"));

        let handle = manager.ensure_collection("notes").await.unwrap();
        assert_eq!(handle.version(), 2);
    }

    #[tokio::test]
    async fn test_ensure_on_fresh_database_uses_first_version() {
        let (_dir, manager) = temp_manager();
        let handle = manager.ensure_collection("users").await.unwrap();
        assert_eq!(handle.version(), 1);
        assert_eq!(handle.collection_names(), vec!["users"]);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_loses_no_upgrade() {
        let (_dir, manager) = temp_manager();
        manager.open().await.unwrap();

        let names = ["alpha", "beta", "gamma", "delta"];
        let results =
            futures_util::future::join_all(names.iter().map(|name| manager.ensure_collection(name)))
                .await;
        for result in results {
            result.unwrap();
        }

        let collections = manager.collection_names().await.unwrap();
        for name in names {
            assert!(collections.iter().any(|c| c == name), "missing {}", name);
        }

        // A fresh manager on the same file sees them too
        let other = ConnectionManager::new(manager.path(), ConnectionOptions::default());
        let reopened = other.open().await.unwrap();
        for name in names {
            assert!(reopened.has_collection(name));
        }
    }

    #[tokio::test]
    async fn test_open_version_rejects_downgrade() {
        let (_dir, manager) = temp_manager();
        manager.open_version(3).await.unwrap();
        assert_eq!(manager.version().await, Some(3));

        let err = manager.open_version(2).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::VersionMismatch {
                requested: 2,
                current: 3
            }
        ));

        // The failed open is terminal for that call only
        assert_eq!(manager.open().await.unwrap().version(), 3);
    }

    #[tokio::test]
    async fn test_missing_directory_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConnectionManager::new(
            dir.path().join("missing").join("nook.db"),
            ConnectionOptions::default(),
        );
        let err = manager.open().await.unwrap_err();
        assert!(matches!(err, StorageError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_upgrade_blocked_by_other_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nook.db");
        let manager = ConnectionManager::new(
            &path,
            ConnectionOptions {
                busy_timeout: Duration::from_millis(50),
            },
        );
        manager.ensure_collection("users").await.unwrap();

        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();

        let err = manager.ensure_collection("posts").await.unwrap_err();
        assert!(matches!(err, StorageError::Blocked { version: 1 }));

        other.execute_batch("ROLLBACK").unwrap();
        let handle = manager.ensure_collection("posts").await.unwrap();
        assert_eq!(handle.version(), 2);
        assert!(handle.has_collection("users"));
    }

    #[tokio::test]
    async fn test_close_then_reopen() {
        let (_dir, manager) = temp_manager();
        manager.ensure_collection("users").await.unwrap();
        manager.close().await;
        assert_eq!(manager.version().await, None);

        let handle = manager.open().await.unwrap();
        assert_eq!(handle.version(), 1);
        assert!(handle.has_collection("users"));
    }

    #[tokio::test]
    async fn test_delete_database() {
        let (_dir, manager) = temp_manager();
        manager.ensure_collection("users").await.unwrap();
        manager.ensure_collection("posts").await.unwrap();
        assert!(manager.path().exists());

        manager.delete_database().await.unwrap();
        assert!(!manager.path().exists());
        assert_eq!(manager.version().await, None);

        // Declared collections come back at version 1
        let handle = manager.open().await.unwrap();
        assert_eq!(handle.version(), 1);
        assert_eq!(handle.collection_names(), vec!["posts", "users"]);
    }

    fn insert_row(schema: &CollectionSchema, tx: &Transaction<'_>) -> Result<()> {
        tx.execute(
            "INSERT INTO nook_records (collection, record_key, value) VALUES (?1, 'k', '{}')",
            [&schema.name],
        )?;
        Ok(())
    }

    fn count_rows(schema: &CollectionSchema, tx: &Transaction<'_>) -> Result<i64> {
        Ok(tx.query_row(
            "SELECT COUNT(*) FROM nook_records WHERE collection = ?1",
            [&schema.name],
            |row| row.get(0),
        )?)
    }

    #[tokio::test]
    async fn test_read_only_transaction_rejects_writes() {
        let (_dir, manager) = temp_manager();
        let handle = manager.ensure_collection("users").await.unwrap();

        let err = handle
            .transaction("users", TxMode::ReadOnly, &CommitGate::default(), insert_row)
            .unwrap_err();
        assert!(matches!(err, StorageError::Sqlite(_)));

        // query_only is lifted again for the next write
        handle
            .transaction("users", TxMode::ReadWrite, &CommitGate::default(), insert_row)
            .unwrap();
        let count = handle
            .transaction("users", TxMode::ReadOnly, &CommitGate::default(), count_rows)
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_cancelled_gate_rolls_back() {
        let (_dir, manager) = temp_manager();
        let handle = manager.ensure_collection("users").await.unwrap();

        let gate = CommitGate::default();
        assert!(gate.cancel());
        let err = handle
            .transaction("users", TxMode::ReadWrite, &gate, insert_row)
            .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));

        let count = handle
            .transaction("users", TxMode::ReadOnly, &CommitGate::default(), count_rows)
            .unwrap();
        assert_eq!(count, 0);

        // Once committed, the outcome stands
        let gate = CommitGate::default();
        handle
            .transaction("users", TxMode::ReadWrite, &gate, insert_row)
            .unwrap();
        assert!(!gate.cancel());
    }

    #[tokio::test]
    async fn test_invalid_collection_name() {
        let (_dir, manager) = temp_manager();
        let err = manager.ensure_collection("").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidCollection(_)));
    }
}
