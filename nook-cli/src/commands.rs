//! Command handlers

use anyhow::{bail, Context};
use clap::Subcommand;
use serde_json::{json, Value};

use nook_core::{Key, Nook, User};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Open (or create) the database and print its version
    Init,
    /// Add a user
    AddUser {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// Use this id instead of a generated one
        #[arg(long)]
        id: Option<String>,
    },
    /// Show one user
    User { id: String },
    /// List all users
    Users,
    /// Remove a user
    RemoveUser { id: String },
    /// Remove every user
    ClearUsers,
    /// Insert a JSON record; fails if its key exists
    Add { collection: String, record: String },
    /// Insert or replace a JSON record
    Put { collection: String, record: String },
    /// Show one record
    Get { collection: String, key: String },
    /// List a collection in insertion order
    List { collection: String },
    /// Count records in a collection
    Count { collection: String },
    /// Delete one record
    Delete { collection: String, key: String },
    /// Delete every record in a collection
    Clear { collection: String },
    /// List collections and the schema version
    Collections,
    /// Delete the database file
    DeleteDb,
}

/// Run `command`, returning what should be printed.
pub async fn execute(nook: &Nook, command: Command) -> anyhow::Result<Option<Value>> {
    let output = match command {
        Command::Init => {
            let version = nook.initialize().await?;
            Some(json!({
                "path": nook.config().database_path,
                "version": version,
            }))
        }
        Command::AddUser { name, email, id } => {
            let user = match id {
                Some(id) => nook.users().add(User { id, name, email }).await?,
                None => nook.users().create(name, email).await?,
            };
            Some(serde_json::to_value(user)?)
        }
        // A missing user or record is not an error; it prints `null`.
        Command::User { id } => Some(serde_json::to_value(nook.users().get(&id).await?)?),
        Command::Users => Some(serde_json::to_value(nook.users().list().await?)?),
        Command::RemoveUser { id } => {
            nook.users().remove(&id).await?;
            None
        }
        Command::ClearUsers => {
            nook.users().clear().await?;
            None
        }
        Command::Add { collection, record } => {
            let record = parse_record(&record)?;
            Some(nook.store().add(&collection, record).await?)
        }
        Command::Put { collection, record } => {
            let record = parse_record(&record)?;
            Some(nook.store().put(&collection, record).await?)
        }
        Command::Get { collection, key } => {
            let key = parse_key(nook, &collection, &key).await?;
            Some(nook.store().get::<Value>(&collection, key).await?.unwrap_or(Value::Null))
        }
        Command::List { collection } => {
            Some(Value::Array(nook.store().get_all(&collection).await?))
        }
        Command::Count { collection } => Some(json!(nook.store().count(&collection).await?)),
        Command::Delete { collection, key } => {
            let key = parse_key(nook, &collection, &key).await?;
            nook.store().delete(&collection, key).await?;
            None
        }
        Command::Clear { collection } => {
            nook.store().clear(&collection).await?;
            None
        }
        Command::Collections => {
            let handle = nook.manager().open().await?;
            Some(json!({
                "version": handle.version(),
                "collections": handle.collection_names(),
            }))
        }
        Command::DeleteDb => {
            nook.delete_database().await?;
            tracing::info!("Database removed");
            None
        }
    };

    Ok(output)
}

fn parse_record(raw: &str) -> anyhow::Result<Value> {
    let value: Value = serde_json::from_str(raw).context("record is not valid JSON")?;
    if !value.is_object() {
        bail!("record must be a JSON object");
    }
    Ok(value)
}

/// Interpret a command-line key using the collection's declared key kind.
async fn parse_key(nook: &Nook, collection: &str, raw: &str) -> anyhow::Result<Key> {
    let handle = nook.manager().ensure_collection(collection).await?;
    let kind = handle
        .collection(collection)
        .map(|schema| schema.key_kind)
        .context("collection missing after upgrade")?;
    Key::parse_as(raw, kind).map_err(anyhow::Error::msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nook_core::{CollectionSchema, Config, KeyKind};

    fn test_nook(dir: &tempfile::TempDir) -> Nook {
        let mut config = Config::new(dir.path().to_path_buf());
        config
            .collections
            .push(CollectionSchema::new("posts").with_key_kind(KeyKind::Integer));
        Nook::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_record_commands() {
        let dir = tempfile::tempdir().unwrap();
        let nook = test_nook(&dir);

        let init = execute(&nook, Command::Init).await.unwrap().unwrap();
        assert_eq!(init["version"], 1);

        execute(
            &nook,
            Command::Add {
                collection: "posts".to_string(),
                record: r#"{"id": 3, "title": "t"}"#.to_string(),
            },
        )
        .await
        .unwrap();

        let found = execute(
            &nook,
            Command::Get {
                collection: "posts".to_string(),
                key: "3".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(found, Some(json!({"id": 3, "title": "t"})));

        execute(
            &nook,
            Command::Delete {
                collection: "posts".to_string(),
                key: "3".to_string(),
            },
        )
        .await
        .unwrap();
        let listed = execute(
            &nook,
            Command::List {
                collection: "posts".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(listed, Some(json!([])));
    }

    #[tokio::test]
    async fn test_duplicate_add_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let nook = test_nook(&dir);

        let add = || Command::AddUser {
            name: "A".to_string(),
            email: "a@x.com".to_string(),
            id: Some("1".to_string()),
        };
        execute(&nook, add()).await.unwrap();
        let err = execute(&nook, add()).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let users = execute(&nook, Command::Users).await.unwrap().unwrap();
        assert_eq!(users.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_missing_entries_print_null() {
        let dir = tempfile::tempdir().unwrap();
        let nook = test_nook(&dir);

        let user = execute(
            &nook,
            Command::User {
                id: "nobody".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(user, Some(Value::Null));

        let record = execute(
            &nook,
            Command::Get {
                collection: "posts".to_string(),
                key: "99".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(record, Some(Value::Null));
    }

    #[tokio::test]
    async fn test_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let nook = test_nook(&dir);

        assert!(parse_record("[1, 2]").is_err());
        assert!(parse_record("{oops").is_err());

        let err = execute(
            &nook,
            Command::Get {
                collection: "posts".to_string(),
                key: "abc".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not an integer"));
    }
}
