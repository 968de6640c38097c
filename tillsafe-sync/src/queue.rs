//! Persistent queue of outgoing changes.

use crate::batch;
use crate::error::{SyncError, SyncResult};
use crate::types::{ChangeStatus, NewChange, Priority, QueueStats, QueuedChange};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tillsafe_storage::{CollectionSpec, LocalStore, Record};
use tracing::{debug, info, warn};

pub const QUEUE_COLLECTION: &str = "queued_changes";

/// Outgoing changes with priority and retry metadata.
#[derive(Clone)]
pub struct SyncQueue {
    store: LocalStore,
    max_attempts: u32,
    requeue_extra_attempts: u32,
    sequence: Arc<AtomicU64>,
}

impl SyncQueue {
    pub fn collection_spec() -> CollectionSpec {
        CollectionSpec::new(QUEUE_COLLECTION, "localId")
            .unique("localId")
            .unique("idempotencyKey")
            .index("sortKey")
            .index("status")
    }

    pub async fn open(store: LocalStore, max_attempts: u32, requeue_extra_attempts: u32) -> SyncResult<Self> {
        store.register(Self::collection_spec()).await?;
        Ok(Self {
            store,
            max_attempts: max_attempts.max(1),
            requeue_extra_attempts,
            sequence: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Enqueues a change. A change carrying an idempotency key that is
    /// still queued is not duplicated; its local id is returned instead.
    pub async fn enqueue(&self, change: NewChange, priority: Priority) -> SyncResult<String> {
        if change.entity_type.trim().is_empty() {
            return Err(SyncError::Validation("entity type must not be empty".into()));
        }
        if let Some(key) = &change.idempotency_key {
            if key.trim().is_empty() {
                return Err(SyncError::Validation("idempotency key must not be empty".into()));
            }
            if let Some(existing) = self
                .store
                .find_unique(QUEUE_COLLECTION, "idempotencyKey", &json!(key))
                .await?
            {
                let existing: QueuedChange = existing.decode()?;
                debug!(
                    "[SYNC] Change {} for {} already queued as {}",
                    key, existing.entity_type, existing.local_id
                );
                return Ok(existing.local_id);
            }
        }

        let now = chrono::Utc::now().timestamp_millis();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let local_id = uuid::Uuid::now_v7().to_string();
        let idempotency_key = change.idempotency_key.unwrap_or_else(|| local_id.clone());
        let queued = QueuedChange {
            local_id,
            entity_type: change.entity_type,
            entity_key: change.entity_key,
            payload: change.payload,
            priority,
            status: ChangeStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            enqueued_at: now,
            last_attempt_at: None,
            last_error: None,
            idempotency_key,
            sort_key: format!("{}-{:013}-{:010}", priority.rank(), now.max(0), seq),
        };

        let key = self
            .store
            .put(QUEUE_COLLECTION, serde_json::to_value(&queued)?)
            .await?;
        debug!(
            "[SYNC] Enqueued {} ({:?}) as {}",
            queued.entity_type, priority, key
        );
        Ok(key.to_string())
    }

    pub async fn get(&self, local_id: &str) -> SyncResult<Option<QueuedChange>> {
        let record = self.store.get(QUEUE_COLLECTION, local_id).await?;
        Ok(record.map(|r| r.decode()).transpose()?)
    }

    /// Pending changes in queue order (band, then enqueue time).
    pub async fn pending(&self) -> SyncResult<Vec<QueuedChange>> {
        let records = self.store.scan_index(QUEUE_COLLECTION, "sortKey", None).await?;
        let mut pending = decode_all(records)?;
        pending.retain(|c| c.status == ChangeStatus::Pending);
        Ok(pending)
    }

    /// Up to `max_items` pending changes totalling at most `max_bytes` of
    /// payload (the first change is always included).
    pub async fn next_batch(&self, max_items: usize, max_bytes: usize) -> SyncResult<Vec<QueuedChange>> {
        self.next_batch_excluding(max_items, max_bytes, &HashSet::new())
            .await
    }

    /// Like [`next_batch`](Self::next_batch), skipping the given local ids.
    pub async fn next_batch_excluding(
        &self,
        max_items: usize,
        max_bytes: usize,
        exclude: &HashSet<String>,
    ) -> SyncResult<Vec<QueuedChange>> {
        let mut pending = self.pending().await?;
        pending.retain(|c| !exclude.contains(&c.local_id));
        Ok(batch::select_batch(&pending, max_items, max_bytes))
    }

    /// Removes an acknowledged change. Returns false if it was not queued.
    pub async fn mark_complete(&self, local_id: &str) -> SyncResult<bool> {
        Ok(self.store.delete(QUEUE_COLLECTION, local_id).await?)
    }

    /// Records a failed attempt. Returns the updated change; its status is
    /// Failed once attempts reach max attempts.
    pub async fn mark_failed(&self, local_id: &str, error: &str) -> SyncResult<QueuedChange> {
        let mut change = self
            .get(local_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(local_id.to_string()))?;

        change.attempts = change.attempts.saturating_add(1);
        change.last_attempt_at = Some(chrono::Utc::now().timestamp_millis());
        change.last_error = Some(error.to_string());
        if change.attempts >= change.max_attempts {
            change.status = ChangeStatus::Failed;
            warn!(
                "[SYNC] Change {} ({}) failed after {} attempts: {}",
                change.local_id, change.entity_type, change.attempts, error
            );
        } else {
            debug!(
                "[SYNC] Change {} attempt {}/{} failed: {}",
                change.local_id, change.attempts, change.max_attempts, error
            );
        }

        self.store
            .put(QUEUE_COLLECTION, serde_json::to_value(&change)?)
            .await?;
        Ok(change)
    }

    /// Moves a failed change back to Pending. Attempts are kept; the
    /// attempt budget grows instead.
    pub async fn requeue_failed(&self, local_id: &str) -> SyncResult<bool> {
        let Some(mut change) = self.get(local_id).await? else {
            return Ok(false);
        };
        if change.status != ChangeStatus::Failed {
            return Ok(false);
        }
        change.status = ChangeStatus::Pending;
        change.max_attempts = change
            .attempts
            .saturating_add(self.requeue_extra_attempts.max(1));
        self.store
            .put(QUEUE_COLLECTION, serde_json::to_value(&change)?)
            .await?;
        info!("[SYNC] Requeued failed change {}", local_id);
        Ok(true)
    }

    pub async fn requeue_all_failed(&self) -> SyncResult<usize> {
        let mut requeued = 0;
        for change in self.failed_items().await? {
            if self.requeue_failed(&change.local_id).await? {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    pub async fn failed_items(&self) -> SyncResult<Vec<QueuedChange>> {
        self.with_status(ChangeStatus::Failed).await
    }

    pub async fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.with_status(ChangeStatus::Pending).await?.len())
    }

    pub async fn failed_count(&self) -> SyncResult<usize> {
        Ok(self.with_status(ChangeStatus::Failed).await?.len())
    }

    pub async fn stats(&self) -> SyncResult<QueueStats> {
        let pending = self.with_status(ChangeStatus::Pending).await?;
        let mut stats = QueueStats {
            pending: pending.len(),
            failed: self.failed_count().await?,
            ..QueueStats::default()
        };
        for change in pending {
            *stats.pending_by_priority.entry(change.priority).or_default() += 1;
        }
        Ok(stats)
    }

    async fn with_status(&self, status: ChangeStatus) -> SyncResult<Vec<QueuedChange>> {
        let records = self
            .store
            .get_by_index(QUEUE_COLLECTION, "status", &json!(status.as_str()))
            .await?;
        decode_all(records)
    }
}

fn decode_all(records: Vec<Record>) -> SyncResult<Vec<QueuedChange>> {
    records
        .iter()
        .map(|r| r.decode().map_err(SyncError::from))
        .collect()
}
