//! SQLite storage layer for tillsafe.
//!
//! Provides the durable, transactional local store the offline core is built
//! on. Records are JSON objects grouped into declared collections, with
//! field-level unique and secondary indexes.
//!
//! # Architecture
//!
//! - One SQLite connection per store, serialized behind a mutex and driven
//!   from the blocking pool so every public operation is `async`
//! - Each mutating operation is a single `IMMEDIATE` transaction
//! - Unique fields are enforced by the database; `put` adopts the key of the
//!   record already holding a unique value before writing
//! - Transient aborts (lock contention) are retried with a bounded delay table
//! - An optional byte quota turns storage exhaustion into
//!   [`StoreError::CapacityExceeded`] and fires the eviction hook

mod error;
mod local_store;
mod query;
pub mod retry;
mod schema;

pub use error::{StoreError, StoreResult};
pub use local_store::{CapacityReport, EvictionHook, LocalStore, StoreConfig};
pub use query::{Predicate, Query};
pub use retry::RetryPolicy;
pub use schema::{CollectionSpec, IndexSpec, Record, RecordKey};

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Opens a SQLite connection configured for the local store.
///
/// `busy_timeout` is zero so lock contention surfaces immediately as a
/// transient abort and goes through the store's own retry table. With a
/// quota, `max_page_count` is capped so exhaustion is reported by SQLite as
/// `SQLITE_FULL`.
pub fn open_sqlite(path: Option<&Path>, config: &StoreConfig) -> StoreResult<Connection> {
    let conn = match path {
        Some(path) => {
            let conn = Connection::open(path)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn
        }
        None => Connection::open_in_memory()?,
    };
    conn.busy_timeout(Duration::ZERO)?;

    if let Some(quota) = config.quota_bytes {
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        let max_pages = (quota / page_size.max(1) as u64).max(1);
        let applied: i64 = conn.query_row(&format!("PRAGMA max_page_count = {max_pages}"), [], |row| row.get(0))?;
        tracing::debug!("[STORE] Quota {} bytes -> max_page_count {}", quota, applied);
    }

    Ok(conn)
}
