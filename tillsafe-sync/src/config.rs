//! Sync and runtime configuration.

use crate::backoff::BackoffConfig;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use tillsafe_connectivity::MonitorConfig;
use tillsafe_credentials::CredentialConfig;
use tillsafe_storage::{CollectionSpec, StoreConfig};

/// Configuration for the sync engine and queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Items per push round-trip.
    pub batch_max_items: usize,

    /// Summed payload bytes per push round-trip.
    pub batch_max_bytes: usize,

    /// Batches pushed per cycle before yielding.
    pub max_batches_per_cycle: usize,

    /// Interval between periodic cycles while online (seconds).
    pub sync_interval_secs: u64,

    /// Attempts before a change is dead-lettered.
    pub max_attempts: u32,

    /// Extra attempts granted when a failed change is requeued.
    pub requeue_extra_attempts: u32,

    /// Sync error records older than this are pruned (days).
    pub error_retention_days: u64,

    /// Acknowledged fingerprints older than this are forgotten (days).
    pub fingerprint_retention_days: u64,

    pub backoff: BackoffConfig,

    /// Server collections pulled into the local store each cycle.
    pub pull_collections: Vec<CollectionSpec>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_max_items: 50,
            batch_max_bytes: 512 * 1024,
            max_batches_per_cycle: 20,
            sync_interval_secs: 60,
            max_attempts: 5,
            requeue_extra_attempts: 5,
            error_retention_days: 7,
            fingerprint_retention_days: 30,
            backoff: BackoffConfig::default(),
            pull_collections: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> SyncResult<()> {
        if self.batch_max_items == 0 {
            return Err(SyncError::Config("batch_max_items must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(SyncError::Config("max_attempts must be at least 1".into()));
        }
        if self.sync_interval_secs == 0 {
            return Err(SyncError::Config("sync_interval_secs must be at least 1".into()));
        }
        if self.backoff.jitter_min > self.backoff.jitter_max {
            return Err(SyncError::Config("backoff jitter_min exceeds jitter_max".into()));
        }
        Ok(())
    }
}

/// Everything [`OfflineRuntime`](crate::OfflineRuntime) needs, loadable
/// from one JSON document. Missing sections take their defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub store: StoreConfig,
    pub credentials: CredentialConfig,
    pub monitor: MonitorConfig,
    pub sync: SyncConfig,
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.sync.validate()?;
        Ok(config)
    }
}
