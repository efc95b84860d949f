//! Nook Storage Layer
//!
//! A single versioned SQLite database holding named collections of JSON
//! records. All opens go through [`ConnectionManager`]; collections are only
//! ever created by a version-bumping schema upgrade. [`Store`] runs one
//! transaction per operation against the managed connection.

mod connection;
mod error;
mod key;
mod schema;
mod store;

pub use connection::{ConnectionHandle, ConnectionManager, ConnectionOptions};
pub use error::StorageError;
pub use key::{Key, KeyKind};
pub use schema::CollectionSchema;
pub use store::Store;

pub type Result<T> = std::result::Result<T, StorageError>;
