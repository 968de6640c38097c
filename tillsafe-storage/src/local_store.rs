//! Transactional key-indexed store with field-level uniqueness constraints.
//!
//! Every record lives in a named collection declared with a
//! [`CollectionSpec`]. Unique fields are enforced by a partial unique index in
//! SQLite, so even a logic error cannot persist two records sharing a unique
//! value; it surfaces as [`StoreError::ConstraintViolation`] instead.
//!
//! All operations are async: the SQL runs on the blocking pool behind a
//! single connection mutex, one transaction per operation.

use crate::error::{StoreError, StoreResult};
use crate::query::Query;
use crate::retry::RetryPolicy;
use crate::schema::{self, display_sql, index_value, CollectionSpec, Record, RecordKey};
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Configuration for the local store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Upper bound on the database size. Writes past it fail with
    /// [`StoreError::CapacityExceeded`].
    pub quota_bytes: Option<u64>,

    /// Rows fetched per page by [`Query::stream`].
    pub query_page_size: usize,

    /// Retry policy for transiently aborted transactions.
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            quota_bytes: None,
            query_page_size: 100,
            retry: RetryPolicy::default(),
        }
    }
}

/// Passed to the eviction hook when the quota is reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapacityReport {
    pub collection: String,
    pub quota_bytes: Option<u64>,
    pub used_bytes: u64,
}

/// Caller-visible hook awaited before a [`StoreError::CapacityExceeded`] is
/// returned, so whatever space it frees is available to the caller's next
/// write. It may use the store; the failed write's transaction is closed.
#[async_trait]
pub trait EvictionHook: Send + Sync {
    async fn on_capacity_exceeded(&self, report: &CapacityReport);
}

/// SQLite-backed local store.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    collections: Arc<RwLock<HashMap<String, Arc<CollectionSpec>>>>,
    eviction_hook: Arc<RwLock<Option<Arc<dyn EvictionHook>>>>,
    config: Arc<StoreConfig>,
}

impl LocalStore {
    /// Opens or creates a store at the given path.
    pub fn open(path: &Path, config: StoreConfig) -> StoreResult<Self> {
        let conn = crate::open_sqlite(Some(path), &config)?;
        Self::from_connection(conn, config)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open_in_memory_with(StoreConfig::default())
    }

    /// Opens an in-memory store with explicit configuration.
    pub fn open_in_memory_with(config: StoreConfig) -> StoreResult<Self> {
        let conn = crate::open_sqlite(None, &config)?;
        Self::from_connection(conn, config)
    }

    fn from_connection(conn: Connection, config: StoreConfig) -> StoreResult<Self> {
        schema::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            collections: Arc::new(RwLock::new(HashMap::new())),
            eviction_hook: Arc::new(RwLock::new(None)),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Installs the hook called when the quota is exhausted.
    pub fn set_eviction_hook(&self, hook: Arc<dyn EvictionHook>) -> StoreResult<()> {
        let mut slot = self
            .eviction_hook
            .write()
            .map_err(|_| StoreError::Poisoned)?;
        *slot = Some(hook);
        Ok(())
    }

    /// Declares a collection. Registering the same spec again is a no-op; a
    /// changed spec rebuilds the collection's index rows, which fails with
    /// [`StoreError::ConstraintViolation`] if existing data breaks a new
    /// unique index.
    pub async fn register(&self, spec: CollectionSpec) -> StoreResult<()> {
        if spec.name.is_empty() || spec.key_field.is_empty() {
            return Err(StoreError::Validation(
                "collection name and key field must not be empty".to_string(),
            ));
        }
        let spec = Arc::new(spec);
        let s = spec.clone();
        self.execute("register", &spec.name, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stored: Option<String> = tx
                .query_row(
                    "SELECT spec_json FROM collections WHERE name = ?1",
                    [&s.name],
                    |row| row.get(0),
                )
                .optional()?;
            let json = serde_json::to_string(&*s)?;
            if stored.as_deref() != Some(json.as_str()) {
                tx.execute(
                    "INSERT INTO collections (name, spec_json) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE SET spec_json = excluded.spec_json",
                    params![s.name, json],
                )?;
                if stored.is_some() {
                    let rebuilt = rebuild_indexes(&tx, &s)?;
                    info!("[STORE] Collection '{}' changed, re-indexed {} records", s.name, rebuilt);
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        self.collections
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Returns the declaration of a registered collection.
    pub fn spec(&self, collection: &str) -> StoreResult<Arc<CollectionSpec>> {
        self.collections
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .get(collection)
            .cloned()
            .ok_or_else(|| StoreError::Validation(format!("unknown collection '{collection}'")))
    }

    /// Inserts or updates a record using the constraint-safe upsert: when an
    /// existing record shares any unique field value with `record`, `record`
    /// is merged onto that record's key, whatever key `record` carries.
    pub async fn put(&self, collection: &str, record: Value) -> StoreResult<RecordKey> {
        let spec = self.spec(collection)?;
        self.execute("put", collection, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let key = upsert(&tx, &spec, record.clone())?;
            tx.commit()?;
            Ok(key)
        })
        .await
    }

    /// Upserts several records in one transaction; all or none are written.
    pub async fn put_many(&self, collection: &str, records: Vec<Value>) -> StoreResult<Vec<RecordKey>> {
        let spec = self.spec(collection)?;
        self.execute("put_many", collection, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let keys = records
                .iter()
                .map(|r| upsert(&tx, &spec, r.clone()))
                .collect::<StoreResult<Vec<_>>>()?;
            tx.commit()?;
            Ok(keys)
        })
        .await
    }

    /// Gets a single record by key.
    pub async fn get(&self, collection: &str, key: impl Into<RecordKey>) -> StoreResult<Option<Record>> {
        self.spec(collection)?;
        let name = collection.to_string();
        let key = key.into();
        self.execute("get", collection, move |conn| load_record(conn, &name, &key))
            .await
    }

    /// All records whose indexed `field` equals `value`, ordered by key.
    pub async fn get_by_index(&self, collection: &str, field: &str, value: &Value) -> StoreResult<Vec<Record>> {
        let spec = self.spec(collection)?;
        require_index(&spec, field)?;
        let Some(value) = index_value(value) else {
            return Ok(Vec::new());
        };
        let name = collection.to_string();
        let field = field.to_string();
        self.execute("get_by_index", collection, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT r.record_key, r.body FROM record_index i
                 JOIN records r ON r.collection = i.collection AND r.record_key = i.record_key
                 WHERE i.collection = ?1 AND i.field = ?2 AND i.index_value = ?3
                 ORDER BY r.record_key",
            )?;
            let rows = stmt.query_map(params![name, field, value], raw_row)?;
            collect_records(rows)
        })
        .await
    }

    /// The record holding `value` in a unique field, if any.
    pub async fn find_unique(&self, collection: &str, field: &str, value: &Value) -> StoreResult<Option<Record>> {
        let spec = self.spec(collection)?;
        if !require_index(&spec, field)?.unique {
            return Err(StoreError::Validation(format!(
                "field '{field}' of '{collection}' is not unique"
            )));
        }
        Ok(self.get_by_index(collection, field, value).await?.into_iter().next())
    }

    /// Records in ascending order of an indexed field (ties by key).
    /// Records without a value for the field are not included.
    pub async fn scan_index(&self, collection: &str, field: &str, limit: Option<usize>) -> StoreResult<Vec<Record>> {
        let spec = self.spec(collection)?;
        require_index(&spec, field)?;
        let name = collection.to_string();
        let field = field.to_string();
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.execute("scan_index", collection, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT r.record_key, r.body FROM record_index i
                 JOIN records r ON r.collection = i.collection AND r.record_key = i.record_key
                 WHERE i.collection = ?1 AND i.field = ?2
                 ORDER BY i.index_value, i.record_key
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![name, field, limit], raw_row)?;
            collect_records(rows)
        })
        .await
    }

    /// Deletes a record. Returns false if it did not exist.
    pub async fn delete(&self, collection: &str, key: impl Into<RecordKey>) -> StoreResult<bool> {
        self.spec(collection)?;
        let name = collection.to_string();
        let key = key.into();
        self.execute("delete", collection, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = delete_in_tx(&tx, &name, &key)?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    /// Deletes every record whose indexed `field` is strictly below `bound`.
    /// Used for age-based pruning.
    pub async fn delete_by_index_below(&self, collection: &str, field: &str, bound: &Value) -> StoreResult<usize> {
        let spec = self.spec(collection)?;
        require_index(&spec, field)?;
        let Some(bound) = index_value(bound) else {
            return Ok(0);
        };
        let name = collection.to_string();
        let field = field.to_string();
        self.execute("delete_by_index_below", collection, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let keys = {
                let mut stmt = tx.prepare(
                    "SELECT record_key FROM record_index
                     WHERE collection = ?1 AND field = ?2 AND index_value < ?3",
                )?;
                let rows = stmt.query_map(params![name, field, bound], |row| row.get::<_, SqlValue>(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            let mut removed = 0;
            for raw in keys {
                let key = RecordKey::from_sql(raw)?;
                if delete_in_tx(&tx, &name, &key)? {
                    removed += 1;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    /// Number of records in a collection.
    pub async fn count(&self, collection: &str) -> StoreResult<usize> {
        self.spec(collection)?;
        let name = collection.to_string();
        self.execute("count", collection, move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records WHERE collection = ?1",
                [&name],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }

    /// Removes every record of a collection.
    pub async fn clear(&self, collection: &str) -> StoreResult<usize> {
        self.spec(collection)?;
        let name = collection.to_string();
        self.execute("clear", collection, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM record_index WHERE collection = ?1", [&name])?;
            let removed = tx.execute("DELETE FROM records WHERE collection = ?1", [&name])?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    /// Lazy, restartable query over a collection filtered by `predicate`.
    pub fn query<P>(&self, collection: &str, predicate: P) -> StoreResult<Query>
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.spec(collection)?;
        Ok(Query::new(
            self.clone(),
            collection.to_string(),
            Arc::new(predicate),
            self.config.query_page_size,
        ))
    }

    /// One page of records with keys strictly after `after`, in key order.
    pub(crate) async fn page_after(
        &self,
        collection: &str,
        after: Option<RecordKey>,
        limit: usize,
    ) -> StoreResult<Vec<Record>> {
        let name = collection.to_string();
        let limit = limit.max(1) as i64;
        self.execute("page", collection, move |conn| match &after {
            Some(after) => {
                let mut stmt = conn.prepare(
                    "SELECT record_key, body FROM records
                     WHERE collection = ?1 AND record_key > ?2
                     ORDER BY record_key LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![name, after.to_sql(), limit], raw_row)?;
                collect_records(rows)
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT record_key, body FROM records
                     WHERE collection = ?1 ORDER BY record_key LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![name, limit], raw_row)?;
                collect_records(rows)
            }
        })
        .await
    }

    /// Current database size (page count × page size).
    pub async fn estimated_size_bytes(&self) -> StoreResult<u64> {
        self.execute("size", "", |conn| database_size(conn)).await
    }

    /// Runs one store operation on the blocking pool with transient-abort
    /// retry, then fires the eviction hook if the quota was hit.
    async fn execute<T, F>(&self, label: &str, collection: &str, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> StoreResult<T> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let result = self
            .config
            .retry
            .run(label, || {
                let conn = self.conn.clone();
                let op = op.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
                        op(&mut guard)
                    })
                    .await
                    .map_err(|e| StoreError::TaskJoin(e.to_string()))?
                }
            })
            .await
            .map_err(|e| e.in_collection(collection, self.config.quota_bytes));

        if let Err(StoreError::CapacityExceeded { collection, quota_bytes }) = &result {
            self.notify_capacity_exceeded(collection, *quota_bytes).await;
        }
        result
    }

    async fn notify_capacity_exceeded(&self, collection: &str, quota_bytes: Option<u64>) {
        let conn = self.conn.clone();
        let used_bytes = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            database_size(&guard)
        })
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or(0);

        error!(
            "[STORE] Capacity exceeded writing to '{}' ({} bytes used, quota {:?})",
            collection, used_bytes, quota_bytes
        );

        let hook = match self.eviction_hook.read() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        match hook {
            Some(hook) => {
                hook.on_capacity_exceeded(&CapacityReport {
                    collection: collection.to_string(),
                    quota_bytes,
                    used_bytes,
                })
                .await;
                debug!("[STORE] Eviction hook finished for '{}'", collection);
            }
            None => warn!("[STORE] No eviction hook installed"),
        }
    }
}

fn require_index<'a>(spec: &'a CollectionSpec, field: &str) -> StoreResult<&'a schema::IndexSpec> {
    spec.index_for(field).ok_or_else(|| {
        StoreError::Validation(format!("field '{field}' of '{}' is not indexed", spec.name))
    })
}

/// The constraint-safe upsert. Runs inside the caller's transaction.
fn upsert(conn: &Connection, spec: &CollectionSpec, record: Value) -> StoreResult<RecordKey> {
    let Value::Object(incoming) = record else {
        return Err(StoreError::Validation(format!(
            "records in '{}' must be JSON objects",
            spec.name
        )));
    };

    let mut unique_values = Vec::new();
    for field in spec.unique_fields() {
        let value = incoming.get(field).and_then(index_value).ok_or_else(|| {
            StoreError::Validation(format!(
                "record in '{}' is missing required unique field '{field}'",
                spec.name
            ))
        })?;
        unique_values.push((field, value));
    }

    // If an existing record shares a unique value, always adopt its key.
    let mut adopted: Option<RecordKey> = None;
    for (field, value) in &unique_values {
        let Some(existing) = lookup_unique(conn, &spec.name, field, value)? else {
            continue;
        };
        match &adopted {
            None => adopted = Some(existing),
            Some(key) if *key != existing => {
                error!(
                    "[STORE] Constraint violation in '{}': {} = {} belongs to key {}, but another unique field matched key {}",
                    spec.name, field, display_sql(value), existing, key
                );
                return Err(StoreError::ConstraintViolation {
                    collection: spec.name.clone(),
                    field: field.to_string(),
                    value: display_sql(value),
                });
            }
            Some(_) => {}
        }
    }

    let incoming_key = incoming.get(&spec.key_field).and_then(RecordKey::from_json);
    let key = match adopted {
        Some(existing) => {
            if incoming_key.as_ref().is_some_and(|k| *k != existing) {
                debug!(
                    "[STORE] '{}': merging onto existing key {} (incoming key {:?} discarded)",
                    spec.name, existing, incoming_key
                );
            }
            existing
        }
        None => match incoming_key {
            Some(key) => key,
            None if spec.auto_key => next_sequence(conn, &spec.name)?,
            None => {
                return Err(StoreError::Validation(format!(
                    "record in '{}' is missing key field '{}'",
                    spec.name, spec.key_field
                )));
            }
        },
    };
    if let (true, Some(used)) = (spec.auto_key, key.as_int()) {
        bump_sequence(conn, &spec.name, used)?;
    }

    let mut body = match load_record(conn, &spec.name, &key)? {
        Some(Record {
            body: Value::Object(existing),
            ..
        }) => existing,
        _ => Map::new(),
    };
    for (field, value) in incoming {
        body.insert(field, value);
    }
    body.insert(spec.key_field.clone(), key.to_json());
    let body = Value::Object(body);

    conn.execute(
        "INSERT INTO records (collection, record_key, body) VALUES (?1, ?2, ?3)
         ON CONFLICT(collection, record_key) DO UPDATE SET body = excluded.body",
        params![spec.name, key.to_sql(), body.to_string()],
    )?;
    write_index_rows(conn, spec, &key, &body)?;
    Ok(key)
}

fn write_index_rows(conn: &Connection, spec: &CollectionSpec, key: &RecordKey, body: &Value) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM record_index WHERE collection = ?1 AND record_key = ?2",
        params![spec.name, key.to_sql()],
    )?;
    for index in &spec.indexes {
        let Some(value) = body.get(&index.field).and_then(index_value) else {
            continue;
        };
        let inserted = conn.execute(
            "INSERT INTO record_index (collection, field, index_value, record_key, is_unique)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![spec.name, index.field, value, key.to_sql(), index.unique],
        );
        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                error!(
                    "[STORE] Constraint violation in '{}': {} = {} already taken (writing key {})",
                    spec.name,
                    index.field,
                    display_sql(&value),
                    key
                );
                return Err(StoreError::ConstraintViolation {
                    collection: spec.name.clone(),
                    field: index.field.clone(),
                    value: display_sql(&value),
                });
            }
            return Err(e.into());
        }
    }
    Ok(())
}

fn rebuild_indexes(conn: &Connection, spec: &CollectionSpec) -> StoreResult<usize> {
    conn.execute("DELETE FROM record_index WHERE collection = ?1", [&spec.name])?;
    let records = {
        let mut stmt = conn.prepare("SELECT record_key, body FROM records WHERE collection = ?1")?;
        let rows = stmt.query_map([&spec.name], raw_row)?;
        collect_records(rows)?
    };
    for record in &records {
        write_index_rows(conn, spec, &record.key, &record.body)?;
    }
    Ok(records.len())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn lookup_unique(conn: &Connection, collection: &str, field: &str, value: &SqlValue) -> StoreResult<Option<RecordKey>> {
    let raw: Option<SqlValue> = conn
        .query_row(
            "SELECT record_key FROM record_index
             WHERE collection = ?1 AND field = ?2 AND index_value = ?3 AND is_unique = 1",
            params![collection, field, value],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(RecordKey::from_sql).transpose()
}

fn load_record(conn: &Connection, collection: &str, key: &RecordKey) -> StoreResult<Option<Record>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM records WHERE collection = ?1 AND record_key = ?2",
            params![collection, key.to_sql()],
            |row| row.get(0),
        )
        .optional()?;
    match body {
        Some(body) => Ok(Some(Record {
            key: key.clone(),
            body: serde_json::from_str(&body)?,
        })),
        None => Ok(None),
    }
}

fn delete_in_tx(conn: &Connection, collection: &str, key: &RecordKey) -> StoreResult<bool> {
    conn.execute(
        "DELETE FROM record_index WHERE collection = ?1 AND record_key = ?2",
        params![collection, key.to_sql()],
    )?;
    let removed = conn.execute(
        "DELETE FROM records WHERE collection = ?1 AND record_key = ?2",
        params![collection, key.to_sql()],
    )?;
    Ok(removed > 0)
}

fn next_sequence(conn: &Connection, collection: &str) -> StoreResult<RecordKey> {
    let next: Option<i64> = conn
        .query_row(
            "SELECT next_value FROM sequences WHERE collection = ?1",
            [collection],
            |row| row.get(0),
        )
        .optional()?;
    Ok(RecordKey::Int(next.unwrap_or(1)))
}

fn bump_sequence(conn: &Connection, collection: &str, used: i64) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO sequences (collection, next_value) VALUES (?1, ?2)
         ON CONFLICT(collection) DO UPDATE SET next_value = MAX(next_value, excluded.next_value)",
        params![collection, used.saturating_add(1)],
    )?;
    Ok(())
}

fn database_size(conn: &Connection) -> StoreResult<u64> {
    let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    Ok((pages.max(0) as u64) * (page_size.max(0) as u64))
}

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(SqlValue, String)> {
    Ok((row.get(0)?, row.get(1)?))
}

fn collect_records<I>(rows: I) -> StoreResult<Vec<Record>>
where
    I: Iterator<Item = rusqlite::Result<(SqlValue, String)>>,
{
    rows.map(|row| {
        let (raw_key, body) = row?;
        Ok(Record {
            key: RecordKey::from_sql(raw_key)?,
            body: serde_json::from_str(&body)?,
        })
    })
    .collect()
}
