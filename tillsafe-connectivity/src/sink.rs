//! Persists the current snapshot as a single record in the local store.

use crate::error::ConnectivityResult;
use crate::state::ConnectivitySnapshot;
use serde_json::Value;
use tillsafe_storage::{CollectionSpec, LocalStore};

pub const SNAPSHOT_COLLECTION: &str = "connectivity_snapshot";
const SNAPSHOT_KEY: &str = "current";

#[derive(Clone)]
pub struct SnapshotSink {
    store: LocalStore,
}

impl SnapshotSink {
    pub async fn open(store: LocalStore) -> ConnectivityResult<Self> {
        store
            .register(CollectionSpec::new(SNAPSHOT_COLLECTION, "id"))
            .await?;
        Ok(Self { store })
    }

    pub async fn save(&self, snapshot: &ConnectivitySnapshot) -> ConnectivityResult<()> {
        let mut record = serde_json::to_value(snapshot).map_err(tillsafe_storage::StoreError::from)?;
        if let Value::Object(map) = &mut record {
            map.insert("id".into(), Value::from(SNAPSHOT_KEY));
        }
        self.store.put(SNAPSHOT_COLLECTION, record).await?;
        Ok(())
    }

    /// The last persisted snapshot, if any.
    pub async fn load(&self) -> ConnectivityResult<Option<ConnectivitySnapshot>> {
        let record = self.store.get(SNAPSHOT_COLLECTION, SNAPSHOT_KEY).await?;
        Ok(record.map(|r| r.decode()).transpose()?)
    }
}
