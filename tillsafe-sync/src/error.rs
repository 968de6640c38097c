//! Sync error types.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tillsafe_connectivity::ConnectivityError;
use tillsafe_credentials::CredentialError;
use tillsafe_storage::StoreError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Failures talking to the remote peer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote peer unreachable: {0}")]
    Unreachable(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("connectivity error: {0}")]
    Connectivity(#[from] ConnectivityError),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("queued change not found: {0}")]
    NotFound(String),

    #[error("remote peer not reachable")]
    Offline,

    #[error("no session token available")]
    NoSession,

    #[error("sync engine not running")]
    ChannelClosed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    TaskJoin(String),
}

/// Category stored with each sync error record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failure or timeout for a whole batch.
    Network,
    /// The server rejected an item.
    Rejected,
    /// The server neither accepted nor rejected an item.
    NotAcknowledged,
    /// An item exhausted its attempts.
    DeadLetter,
    /// A pulled record could not be applied.
    Pull,
    Storage,
    ConstraintViolation,
}

impl ErrorKind {
    pub fn for_store_error(err: &StoreError) -> Self {
        match err {
            StoreError::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            _ => ErrorKind::Storage,
        }
    }

    pub fn for_sync_error(err: &SyncError) -> Self {
        match err {
            SyncError::Storage(inner) => Self::for_store_error(inner),
            _ => ErrorKind::Storage,
        }
    }
}
