//! Queue records, reports and events.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Priority band of a queued change. Declaration order is drain order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    /// Critical and High items get reserved batch slots.
    pub fn is_urgent(self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    /// Attempts exhausted; kept until requeued.
    Failed,
}

impl ChangeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Failed => "failed",
        }
    }
}

/// A local state change waiting to be pushed to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedChange {
    pub local_id: String,
    pub entity_type: String,
    /// Identity of the domain record, if the host supplied one.
    #[serde(default)]
    pub entity_key: Option<String>,
    pub payload: Value,
    pub priority: Priority,
    pub status: ChangeStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Unix milliseconds.
    pub enqueued_at: i64,
    #[serde(default)]
    pub last_attempt_at: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub idempotency_key: String,
    /// Band, enqueue time and sequence; orders the queue.
    pub sort_key: String,
}

impl QueuedChange {
    /// Key under which the last acknowledged fingerprint is recorded.
    pub fn identity(&self) -> &str {
        self.entity_key.as_deref().unwrap_or(&self.local_id)
    }

    /// Serialized payload size in bytes.
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.payload).map(|v| v.len()).unwrap_or(0)
    }
}

/// A change as submitted by the host.
#[derive(Clone, Debug, PartialEq)]
pub struct NewChange {
    pub entity_type: String,
    pub entity_key: Option<String>,
    pub payload: Value,
    /// Host-chosen deduplication key. Without one every enqueue is a new change.
    pub idempotency_key: Option<String>,
}

impl NewChange {
    pub fn new(entity_type: impl Into<String>, payload: Value) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_key: None,
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.entity_key = Some(key.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub failed: usize,
    /// Pending items per band.
    pub pending_by_priority: BTreeMap<Priority, usize>,
}

/// Append-only audit record of a sync failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorRecord {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub related_change_id: Option<String>,
    pub error_kind: ErrorKind,
    pub message: String,
    /// Unix milliseconds.
    pub occurred_at: i64,
}

/// Outcome of one sync cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncCycleReport {
    /// Items transmitted.
    pub pushed: usize,
    /// Items acknowledged and removed from the queue.
    pub completed: usize,
    /// Items completed locally because the server already has this content.
    pub unchanged: usize,
    /// Items the server rejected.
    pub rejected: usize,
    /// Items whose attempt count was incremented this cycle.
    pub failed_now: usize,
    /// Items that moved to Failed this cycle.
    pub dead_lettered: usize,
    /// Remote records applied to the local store.
    pub pulled: usize,
    pub pull_errors: usize,
    /// Connectivity left Online mid-cycle.
    pub cancelled: bool,
    /// A push round-trip failed as a whole.
    pub transport_failed: bool,
}

impl SyncCycleReport {
    pub fn had_failures(&self) -> bool {
        self.transport_failed || self.failed_now > 0
    }
}

/// Broadcast to sync subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    CycleCompleted(SyncCycleReport),
    CycleFailed { error: String },
    DeadLettered { local_id: String, entity_type: String },
    /// A failed cycle will be retried after `delay`. `attempt` counts
    /// consecutive failed cycles.
    RetryScheduled { attempt: u32, delay: Duration },
}
