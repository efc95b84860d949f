//! Record keys

use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput};
use serde::{Deserialize, Serialize};

/// Declared type of a collection's key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    String,
    Integer,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::String => "string",
            KeyKind::Integer => "integer",
        }
    }
}

impl std::str::FromStr for KeyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "string" => Ok(KeyKind::String),
            "integer" => Ok(KeyKind::Integer),
            _ => Err(format!("Unknown key kind: {}", s)),
        }
    }
}

/// Value of a record's key field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Integer(i64),
    String(String),
}

impl Key {
    pub fn kind(&self) -> KeyKind {
        match self {
            Key::Integer(_) => KeyKind::Integer,
            Key::String(_) => KeyKind::String,
        }
    }

    /// Parse a key supplied as text (e.g. on a command line) as `kind`.
    pub fn parse_as(raw: &str, kind: KeyKind) -> Result<Self, String> {
        match kind {
            KeyKind::String => Ok(Key::String(raw.to_string())),
            KeyKind::Integer => raw
                .trim()
                .parse::<i64>()
                .map(Key::Integer)
                .map_err(|_| format!("'{}' is not an integer key", raw)),
        }
    }

    pub(crate) fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(Key::String(s.clone())),
            serde_json::Value::Number(n) => n.as_i64().map(Key::Integer),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Integer(n) => write!(f, "{}", n),
            Key::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::String(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::String(value)
    }
}

impl From<&String> for Key {
    fn from(value: &String) -> Self {
        Key::String(value.clone())
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Integer(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Key::Integer(value.into())
    }
}

impl ToSql for Key {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Key::Integer(n) => n.to_sql(),
            Key::String(s) => s.to_sql(),
        }
    }
}
