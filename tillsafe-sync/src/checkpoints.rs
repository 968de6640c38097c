//! Pull checkpoints, acknowledged fingerprints and the last sync time.

use crate::error::SyncResult;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tillsafe_storage::{CollectionSpec, LocalStore};
use tracing::debug;

pub const CHECKPOINTS_COLLECTION: &str = "sync_checkpoints";
pub const SENT_FINGERPRINTS_COLLECTION: &str = "sent_fingerprints";

/// Checkpoint row holding the time of the last completed cycle.
const LAST_SYNC_KEY: &str = "@last_sync";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    pub collection: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// Unix milliseconds.
    pub synced_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentFingerprint {
    pub id: String,
    pub entity_type: String,
    pub entity_key: String,
    pub fingerprint: String,
    pub acknowledged_at: i64,
}

#[derive(Clone)]
pub struct Checkpoints {
    store: LocalStore,
}

impl Checkpoints {
    pub async fn open(store: LocalStore) -> SyncResult<Self> {
        store
            .register(CollectionSpec::new(CHECKPOINTS_COLLECTION, "collection"))
            .await?;
        store
            .register(
                CollectionSpec::new(SENT_FINGERPRINTS_COLLECTION, "id")
                    .index("entityType")
                    .index("acknowledgedAt"),
            )
            .await?;
        Ok(Self { store })
    }

    pub async fn get(&self, collection: &str) -> SyncResult<Option<SyncCheckpoint>> {
        let record = self.store.get(CHECKPOINTS_COLLECTION, collection).await?;
        Ok(record.map(|r| r.decode()).transpose()?)
    }

    pub async fn set(&self, collection: &str, fingerprint: Option<&str>) -> SyncResult<()> {
        let checkpoint = SyncCheckpoint {
            collection: collection.to_string(),
            fingerprint: fingerprint.map(str::to_string),
            synced_at: Utc::now().timestamp_millis(),
        };
        self.store
            .put(CHECKPOINTS_COLLECTION, serde_json::to_value(&checkpoint)?)
            .await?;
        Ok(())
    }

    pub async fn mark_synced(&self) -> SyncResult<()> {
        self.set(LAST_SYNC_KEY, None).await
    }

    pub async fn last_sync(&self) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self
            .get(LAST_SYNC_KEY)
            .await?
            .and_then(|c| Utc.timestamp_millis_opt(c.synced_at).single()))
    }

    /// Fingerprint of the last acknowledged version of a record.
    pub async fn sent_fingerprint(&self, entity_type: &str, entity_key: &str) -> SyncResult<Option<String>> {
        let record = self
            .store
            .get(SENT_FINGERPRINTS_COLLECTION, sent_id(entity_type, entity_key))
            .await?;
        Ok(record
            .map(|r| r.decode::<SentFingerprint>())
            .transpose()?
            .map(|s| s.fingerprint))
    }

    pub async fn record_sent(&self, entity_type: &str, entity_key: &str, fingerprint: &str) -> SyncResult<()> {
        self.store
            .put(
                SENT_FINGERPRINTS_COLLECTION,
                json!({
                    "id": sent_id(entity_type, entity_key),
                    "entityType": entity_type,
                    "entityKey": entity_key,
                    "fingerprint": fingerprint,
                    "acknowledgedAt": Utc::now().timestamp_millis(),
                }),
            )
            .await?;
        Ok(())
    }

    /// Forgets fingerprints acknowledged before `cutoff_ms`. A forgotten
    /// record is sent again the next time it is queued unchanged.
    pub async fn prune_sent_before(&self, cutoff_ms: i64) -> SyncResult<usize> {
        let removed = self
            .store
            .delete_by_index_below(SENT_FINGERPRINTS_COLLECTION, "acknowledgedAt", &json!(cutoff_ms))
            .await?;
        if removed > 0 {
            debug!("[SYNC] Pruned {} acknowledged fingerprints", removed);
        }
        Ok(removed)
    }
}

fn sent_id(entity_type: &str, entity_key: &str) -> String {
    format!("{entity_type}:{entity_key}")
}
