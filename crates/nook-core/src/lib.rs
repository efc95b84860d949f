//! Nook Core
//!
//! Wires configuration, logging and the storage layer into one [`Nook`]
//! value that front ends construct at startup and shut down on exit.

mod app;
mod config;
mod error;
mod users;

pub use app::Nook;
pub use config::Config;
pub use error::CoreError;
pub use users::{User, UserDirectory, USERS};

// Re-export the storage API front ends need
pub use nook_storage::{
    CollectionSchema, ConnectionManager, ConnectionOptions, Key, KeyKind, StorageError, Store,
};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
