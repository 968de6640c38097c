//! Collection declarations, record keys and the on-disk schema.

use crate::error::{StoreError, StoreResult};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

const SCHEMA_VERSION: i64 = 1;

/// Primary key of a record within its collection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Int(i64),
    Text(String),
}

impl RecordKey {
    /// Reads a key out of a JSON value. Only integers and non-empty strings
    /// qualify.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RecordKey::Int),
            Value::String(s) if !s.is_empty() => Some(RecordKey::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            RecordKey::Int(i) => Value::from(*i),
            RecordKey::Text(s) => Value::from(s.as_str()),
        }
    }

    pub(crate) fn to_sql(&self) -> SqlValue {
        match self {
            RecordKey::Int(i) => SqlValue::Integer(*i),
            RecordKey::Text(s) => SqlValue::Text(s.clone()),
        }
    }

    pub(crate) fn from_sql(value: SqlValue) -> StoreResult<Self> {
        match value {
            SqlValue::Integer(i) => Ok(RecordKey::Int(i)),
            SqlValue::Text(s) => Ok(RecordKey::Text(s)),
            other => Err(StoreError::Validation(format!(
                "unsupported key type in storage: {other:?}"
            ))),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            RecordKey::Int(i) => Some(*i),
            RecordKey::Text(_) => None,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Int(i) => write!(f, "{i}"),
            RecordKey::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(value: i64) -> Self {
        RecordKey::Int(value)
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        RecordKey::Text(value.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        RecordKey::Text(value)
    }
}

/// A stored record: its key plus the full JSON body (which also carries the
/// key under the collection's key field).
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub key: RecordKey,
    pub body: Value,
}

impl Record {
    /// Deserializes the body into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// An indexed field of a collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub field: String,
    pub unique: bool,
}

/// Declaration of a collection: where its key lives and which fields are
/// indexed. Unique fields are required on every record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    pub key_field: String,
    /// Assign an integer key when a record arrives without one.
    pub auto_key: bool,
    pub indexes: Vec<IndexSpec>,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_field: key_field.into(),
            auto_key: false,
            indexes: Vec::new(),
        }
    }

    pub fn auto_key(mut self) -> Self {
        self.auto_key = true;
        self
    }

    pub fn unique(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(IndexSpec {
            field: field.into(),
            unique: true,
        });
        self
    }

    pub fn index(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(IndexSpec {
            field: field.into(),
            unique: false,
        });
        self
    }

    pub fn unique_fields(&self) -> impl Iterator<Item = &str> {
        self.indexes
            .iter()
            .filter(|i| i.unique)
            .map(|i| i.field.as_str())
    }

    pub fn index_for(&self, field: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|i| i.field == field)
    }
}

/// Converts a JSON scalar into the value stored in the index table.
/// `None` means "not indexable" (null or absent).
pub(crate) fn index_value(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(SqlValue::Integer(i)),
            None => n.as_f64().map(SqlValue::Real),
        },
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => Some(SqlValue::Text(value.to_string())),
    }
}

/// Human-readable form of an index value for diagnostics.
pub(crate) fn display_sql(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "null".to_string(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(r) => r.to_string(),
        SqlValue::Text(s) => format!("'{s}'"),
        SqlValue::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

/// Creates tables on a fresh database and records the schema version.
pub(crate) fn initialize_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            spec_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS records (
            collection TEXT NOT NULL,
            record_key NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (collection, record_key)
        );

        CREATE TABLE IF NOT EXISTS record_index (
            collection TEXT NOT NULL,
            field TEXT NOT NULL,
            index_value,
            record_key NOT NULL,
            is_unique INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (collection, field, record_key)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_record_index_unique
            ON record_index(collection, field, index_value) WHERE is_unique = 1;

        CREATE INDEX IF NOT EXISTS idx_record_index_scan
            ON record_index(collection, field, index_value, record_key);

        CREATE TABLE IF NOT EXISTS sequences (
            collection TEXT PRIMARY KEY,
            next_value INTEGER NOT NULL
        );
        "#,
    )?;

    let current: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .unwrap_or(None);

    if current.is_none() {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )?;
    } else if current.is_some_and(|v| v > SCHEMA_VERSION) {
        return Err(StoreError::Validation(format!(
            "database schema version {} is newer than supported version {SCHEMA_VERSION}",
            current.unwrap_or_default()
        )));
    }

    Ok(())
}
