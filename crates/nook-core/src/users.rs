//! User records
//!
//! The `users` collection backs the demo front end: a name/email form that
//! adds users and a table listing them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nook_storage::Store;

use crate::error::CoreError;
use crate::Result;

/// Name of the users collection.
pub const USERS: &str = "users";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl User {
    pub fn new(name: String, email: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            email,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::InvalidUser("id cannot be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidUser("name cannot be empty".to_string()));
        }
        if !self.email.contains('@') {
            return Err(CoreError::InvalidUser(format!(
                "'{}' is not an email address",
                self.email
            )));
        }
        Ok(())
    }
}

/// Typed access to the users collection.
#[derive(Clone)]
pub struct UserDirectory {
    store: Store,
}

impl UserDirectory {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create a user with a fresh id.
    pub async fn create(&self, name: String, email: String) -> Result<User> {
        self.add(User::new(name, email)).await
    }

    pub async fn add(&self, user: User) -> Result<User> {
        user.validate()?;
        let user = self.store.add(USERS, user).await?;

        tracing::info!(user_id = %user.id, "Added user");

        Ok(user)
    }

    pub async fn get(&self, id: &str) -> Result<Option<User>> {
        Ok(self.store.get(USERS, id).await?)
    }

    pub async fn list(&self) -> Result<Vec<User>> {
        Ok(self.store.get_all(USERS).await?)
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.store.delete(USERS, id).await?;
        tracing::info!(user_id = %id, "Removed user");
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear(USERS).await?;
        tracing::info!("Cleared users");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nook_storage::{ConnectionManager, ConnectionOptions, StorageError};

    fn temp_directory() -> (tempfile::TempDir, UserDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConnectionManager::new(dir.path().join("nook.db"), ConnectionOptions::default());
        (dir, UserDirectory::new(Store::new(manager)))
    }

    #[test]
    fn test_new_user_gets_id() {
        let a = User::new("A".to_string(), "a@x.com".to_string());
        let b = User::new("A".to_string(), "a@x.com".to_string());
        assert_ne!(a.id, b.id);
        assert!(a.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let mut user = User::new("A".to_string(), "a@x.com".to_string());
        user.name = "  ".to_string();
        assert!(matches!(user.validate(), Err(CoreError::InvalidUser(_))));

        let user = User::new("A".to_string(), "not-an-email".to_string());
        assert!(matches!(user.validate(), Err(CoreError::InvalidUser(_))));
    }

    #[tokio::test]
    async fn test_user_directory() {
        let (_dir, users) = temp_directory();

        let ada = users
            .create("Ada".to_string(), "ada@x.com".to_string())
            .await
            .unwrap();
        let fixed = users
            .add(User {
                id: "1".to_string(),
                name: "A".to_string(),
                email: "a@x.com".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(users.get(&ada.id).await.unwrap(), Some(ada.clone()));
        assert_eq!(users.list().await.unwrap(), vec![ada.clone(), fixed.clone()]);

        // Same id again is a conflict surfaced as an error value
        let err = users.add(fixed.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Storage(StorageError::Conflict { .. })
        ));

        users.remove("1").await.unwrap();
        users.remove("1").await.unwrap();
        assert_eq!(users.list().await.unwrap(), vec![ada]);

        users.clear().await.unwrap();
        assert!(users.list().await.unwrap().is_empty());
    }
}
