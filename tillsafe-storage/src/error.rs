//! Local store error types.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type for local store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in local store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The transaction was aborted by something unrelated to the data
    /// (lock contention, another connection's write). Retried by the store
    /// itself; when this reaches a caller every attempt failed.
    #[error("transaction aborted after {attempts} attempt(s): {message}")]
    TransientAbort { attempts: u32, message: String },

    /// The storage quota is exhausted. The eviction hook has already been
    /// notified when this reaches a caller.
    #[error("storage capacity exceeded while writing to '{collection}' (quota: {quota_bytes:?} bytes)")]
    CapacityExceeded {
        collection: String,
        quota_bytes: Option<u64>,
    },

    /// A uniqueness rule was violated despite the upsert policy.
    #[error("unique constraint violated in '{collection}': {field} = {value}")]
    ConstraintViolation {
        collection: String,
        field: String,
        value: String,
    },

    /// Malformed caller input; nothing was persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage task failed: {0}")]
    TaskJoin(String),

    #[error("storage connection lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Only transient aborts are worth retrying at the storage layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::TransientAbort { .. })
    }

    /// Attaches collection and quota to a capacity error raised below the
    /// point where either was known.
    pub(crate) fn in_collection(self, name: &str, quota: Option<u64>) -> Self {
        match self {
            StoreError::CapacityExceeded {
                collection,
                quota_bytes,
            } => StoreError::CapacityExceeded {
                collection: if collection.is_empty() {
                    name.to_string()
                } else {
                    collection
                },
                quota_bytes: quota_bytes.or(quota),
            },
            other => other,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::TransientAbort {
                    attempts: 1,
                    message: err.to_string(),
                }
            }
            Some(ErrorCode::DiskFull) => StoreError::CapacityExceeded {
                collection: String::new(),
                quota_bytes: None,
            },
            _ => StoreError::Database(err),
        }
    }
}
