//! Append-only log of sync failures, pruned by age.

use crate::error::{ErrorKind, SyncResult};
use crate::types::SyncErrorRecord;
use serde_json::json;
use tillsafe_storage::{CollectionSpec, LocalStore};
use tracing::debug;

pub const ERRORS_COLLECTION: &str = "sync_errors";

#[derive(Clone)]
pub struct ErrorLog {
    store: LocalStore,
}

impl ErrorLog {
    pub fn collection_spec() -> CollectionSpec {
        CollectionSpec::new(ERRORS_COLLECTION, "id")
            .auto_key()
            .index("occurredAt")
            .index("relatedChangeId")
    }

    pub async fn open(store: LocalStore) -> SyncResult<Self> {
        store.register(Self::collection_spec()).await?;
        Ok(Self { store })
    }

    pub async fn record(&self, related_change_id: Option<&str>, kind: ErrorKind, message: &str) -> SyncResult<i64> {
        let record = SyncErrorRecord {
            id: None,
            related_change_id: related_change_id.map(str::to_string),
            error_kind: kind,
            message: message.to_string(),
            occurred_at: chrono::Utc::now().timestamp_millis(),
        };
        let mut value = serde_json::to_value(&record)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("id");
        }
        let key = self.store.put(ERRORS_COLLECTION, value).await?;
        Ok(key.as_int().unwrap_or_default())
    }

    /// Oldest first.
    pub async fn all(&self) -> SyncResult<Vec<SyncErrorRecord>> {
        let records = self.store.scan_index(ERRORS_COLLECTION, "occurredAt", None).await?;
        records
            .iter()
            .map(|r| r.decode().map_err(Into::into))
            .collect()
    }

    pub async fn for_change(&self, local_id: &str) -> SyncResult<Vec<SyncErrorRecord>> {
        let records = self
            .store
            .get_by_index(ERRORS_COLLECTION, "relatedChangeId", &json!(local_id))
            .await?;
        records
            .iter()
            .map(|r| r.decode().map_err(Into::into))
            .collect()
    }

    pub async fn count(&self) -> SyncResult<usize> {
        Ok(self.store.count(ERRORS_COLLECTION).await?)
    }

    /// Deletes records that occurred before `cutoff_ms`.
    pub async fn prune_before(&self, cutoff_ms: i64) -> SyncResult<usize> {
        let removed = self
            .store
            .delete_by_index_below(ERRORS_COLLECTION, "occurredAt", &json!(cutoff_ms))
            .await?;
        if removed > 0 {
            debug!("[SYNC] Pruned {} old sync error records", removed);
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> SyncResult<usize> {
        Ok(self.store.clear(ERRORS_COLLECTION).await?)
    }
}
