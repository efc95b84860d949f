//! Application facade
//!
//! [`Nook`] is built once at startup from a [`Config`] and handed to the
//! front end. It owns the connection manager; everything else borrows it.

use nook_storage::{ConnectionManager, Store};

use crate::config::Config;
use crate::users::UserDirectory;
use crate::Result;

pub struct Nook {
    config: Config,
    manager: ConnectionManager,
    store: Store,
    users: UserDirectory,
}

impl Nook {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        // Ensure data directory exists
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager =
            ConnectionManager::new(config.database_path.clone(), config.connection_options());
        for schema in &config.collections {
            manager.declare(schema.clone())?;
        }

        let mut store = Store::new(manager.clone());
        if let Some(timeout) = config.operation_timeout() {
            store = store.with_timeout(timeout);
        }
        let users = UserDirectory::new(store.clone());

        Ok(Self {
            config,
            manager,
            store,
            users,
        })
    }

    /// Open the database, creating it and the configured collections on
    /// first run. Returns the schema version.
    pub async fn initialize(&self) -> Result<u32> {
        let handle = self.manager.open().await?;

        tracing::info!(
            path = %self.config.database_path.display(),
            version = handle.version(),
            collections = ?handle.collection_names(),
            "Initialized database"
        );

        Ok(handle.version())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub async fn delete_database(&self) -> Result<()> {
        self.manager.delete_database().await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.manager.close().await;
    }
}
