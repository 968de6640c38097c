use async_trait::async_trait;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tillsafe_storage::{
    CapacityReport, CollectionSpec, EvictionHook, LocalStore, RecordKey, RetryPolicy, StoreConfig,
    StoreError,
};

fn credentials_spec() -> CollectionSpec {
    CollectionSpec::new("cached_credentials", "userId").unique("loginName")
}

async fn credential_store() -> LocalStore {
    let store = LocalStore::open_in_memory().unwrap();
    store.register(credentials_spec()).await.unwrap();
    store
}

// ── Basic CRUD ───────────────────────────────────────────────────

#[tokio::test]
async fn put_and_get() {
    let store = credential_store().await;
    let key = store
        .put("cached_credentials", json!({"userId": 1, "loginName": "alice", "hash": "a"}))
        .await
        .unwrap();
    assert_eq!(key, RecordKey::Int(1));

    let record = store.get("cached_credentials", 1).await.unwrap().unwrap();
    assert_eq!(record.body["loginName"], "alice");
    assert_eq!(record.body["hash"], "a");
}

#[tokio::test]
async fn get_missing_returns_none() {
    let store = credential_store().await;
    assert!(store.get("cached_credentials", 99).await.unwrap().is_none());
}

#[tokio::test]
async fn text_and_integer_keys_are_distinct() {
    let store = LocalStore::open_in_memory().unwrap();
    store.register(CollectionSpec::new("notes", "id")).await.unwrap();
    store.put("notes", json!({"id": 1, "v": "int"})).await.unwrap();
    store.put("notes", json!({"id": "1", "v": "text"})).await.unwrap();

    assert_eq!(store.count("notes").await.unwrap(), 2);
    let int = store.get("notes", 1).await.unwrap().unwrap();
    let text = store.get("notes", "1").await.unwrap().unwrap();
    assert_eq!(int.body["v"], "int");
    assert_eq!(text.body["v"], "text");
}

#[tokio::test]
async fn delete_removes_record_and_frees_unique_value() {
    let store = credential_store().await;
    store
        .put("cached_credentials", json!({"userId": 1, "loginName": "alice"}))
        .await
        .unwrap();
    assert!(store.delete("cached_credentials", 1).await.unwrap());
    assert!(!store.delete("cached_credentials", 1).await.unwrap());

    let key = store
        .put("cached_credentials", json!({"userId": 5, "loginName": "alice"}))
        .await
        .unwrap();
    assert_eq!(key, RecordKey::Int(5));
}

#[tokio::test]
async fn clear_empties_collection() {
    let store = credential_store().await;
    for (id, login) in [(1, "a"), (2, "b"), (3, "c")] {
        store
            .put("cached_credentials", json!({"userId": id, "loginName": login}))
            .await
            .unwrap();
    }
    assert_eq!(store.clear("cached_credentials").await.unwrap(), 3);
    assert_eq!(store.count("cached_credentials").await.unwrap(), 0);
}

// ── Constraint-safe upsert ───────────────────────────────────────

#[tokio::test]
async fn same_key_refresh_keeps_single_record() {
    let store = credential_store().await;
    store
        .put("cached_credentials", json!({"userId": 1, "loginName": "alice", "hash": "hashA"}))
        .await
        .unwrap();
    store
        .put("cached_credentials", json!({"userId": 1, "loginName": "alice", "hash": "hashB"}))
        .await
        .unwrap();

    let all = store
        .get_by_index("cached_credentials", "loginName", &json!("alice"))
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].body["hash"], "hashB");
    assert_eq!(store.count("cached_credentials").await.unwrap(), 1);
}

#[tokio::test]
async fn different_key_adopts_existing_key() {
    let store = credential_store().await;
    store
        .put("cached_credentials", json!({"userId": 1, "loginName": "alice", "hash": "hashA"}))
        .await
        .unwrap();
    let key = store
        .put("cached_credentials", json!({"userId": 2, "loginName": "alice", "hash": "hashB"}))
        .await
        .unwrap();

    assert_eq!(key, RecordKey::Int(1));
    assert_eq!(store.count("cached_credentials").await.unwrap(), 1);
    let record = store.get("cached_credentials", 1).await.unwrap().unwrap();
    assert_eq!(record.body["hash"], "hashB");
    assert_eq!(record.body["userId"], 1);
    assert!(store.get("cached_credentials", 2).await.unwrap().is_none());
}

#[tokio::test]
async fn upsert_merges_fields_onto_existing_record() {
    let store = credential_store().await;
    store
        .put(
            "cached_credentials",
            json!({"userId": 1, "loginName": "alice", "hash": "a", "displayName": "Alice"}),
        )
        .await
        .unwrap();
    store
        .put("cached_credentials", json!({"userId": 7, "loginName": "alice", "hash": "b"}))
        .await
        .unwrap();

    let record = store.get("cached_credentials", 1).await.unwrap().unwrap();
    assert_eq!(record.body["displayName"], "Alice");
    assert_eq!(record.body["hash"], "b");
}

#[tokio::test]
async fn renaming_unique_value_updates_index() {
    let store = credential_store().await;
    store
        .put("cached_credentials", json!({"userId": 1, "loginName": "alice"}))
        .await
        .unwrap();
    store
        .put("cached_credentials", json!({"userId": 1, "loginName": "alicia"}))
        .await
        .unwrap();

    assert!(
        store
            .find_unique("cached_credentials", "loginName", &json!("alice"))
            .await
            .unwrap()
            .is_none()
    );
    let renamed = store
        .find_unique("cached_credentials", "loginName", &json!("alicia"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(renamed.key, RecordKey::Int(1));
}

#[tokio::test]
async fn conflicting_unique_fields_are_a_constraint_violation() {
    let store = LocalStore::open_in_memory().unwrap();
    store
        .register(CollectionSpec::new("devices", "id").unique("serial").unique("label"))
        .await
        .unwrap();
    store
        .put("devices", json!({"id": 1, "serial": "S1", "label": "front"}))
        .await
        .unwrap();
    store
        .put("devices", json!({"id": 2, "serial": "S2", "label": "back"}))
        .await
        .unwrap();

    let err = store
        .put("devices", json!({"id": 3, "serial": "S1", "label": "back"}))
        .await
        .unwrap_err();
    match err {
        StoreError::ConstraintViolation {
            collection,
            field,
            value,
        } => {
            assert_eq!(collection, "devices");
            assert_eq!(field, "label");
            assert_eq!(value, "'back'");
        }
        other => panic!("expected ConstraintViolation, got {other:?}"),
    }
    // Nothing partial was written.
    let first = store.get("devices", 1).await.unwrap().unwrap();
    assert_eq!(first.body["label"], "front");
    assert_eq!(store.count("devices").await.unwrap(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn repeated_saves_leave_one_record_per_login(
        keys in proptest::collection::vec(1i64..6, 1..12),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = credential_store().await;
            for (n, key) in keys.iter().enumerate() {
                store
                    .put("cached_credentials", json!({"userId": key, "loginName": "alice", "hash": n}))
                    .await
                    .unwrap();
            }
            let matching = store
                .get_by_index("cached_credentials", "loginName", &json!("alice"))
                .await
                .unwrap();
            assert_eq!(matching.len(), 1);
            assert_eq!(matching[0].key, RecordKey::Int(keys[0]));
            assert_eq!(matching[0].body["hash"], json!(keys.len() - 1));
        });
    }
}

// ── Validation ───────────────────────────────────────────────────

#[tokio::test]
async fn missing_unique_field_is_rejected() {
    let store = credential_store().await;
    let err = store
        .put("cached_credentials", json!({"userId": 1, "hash": "x"}))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert_eq!(store.count("cached_credentials").await.unwrap(), 0);
}

#[tokio::test]
async fn non_object_record_is_rejected() {
    let store = credential_store().await;
    let err = store.put("cached_credentials", json!([1, 2, 3])).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
}

#[tokio::test]
async fn missing_key_without_auto_key_is_rejected() {
    let store = credential_store().await;
    let err = store
        .put("cached_credentials", json!({"loginName": "bob"}))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
}

#[tokio::test]
async fn unknown_collection_is_rejected() {
    let store = LocalStore::open_in_memory().unwrap();
    let err = store.put("nope", json!({"id": 1})).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
}

#[tokio::test]
async fn lookup_on_unindexed_field_is_rejected() {
    let store = credential_store().await;
    let err = store
        .get_by_index("cached_credentials", "hash", &json!("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
}

#[tokio::test]
async fn put_many_is_all_or_nothing() {
    let store = credential_store().await;
    let err = store
        .put_many(
            "cached_credentials",
            vec![
                json!({"userId": 1, "loginName": "alice"}),
                json!({"userId": 2}),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert_eq!(store.count("cached_credentials").await.unwrap(), 0);
}

// ── Auto keys and indexes ────────────────────────────────────────

#[tokio::test]
async fn auto_key_assigns_increasing_integers() {
    let store = LocalStore::open_in_memory().unwrap();
    store
        .register(CollectionSpec::new("sync_errors", "id").auto_key().index("occurredAt"))
        .await
        .unwrap();

    let a = store.put("sync_errors", json!({"occurredAt": 10})).await.unwrap();
    let b = store.put("sync_errors", json!({"occurredAt": 20})).await.unwrap();
    store.put("sync_errors", json!({"id": 10, "occurredAt": 5})).await.unwrap();
    let c = store.put("sync_errors", json!({"occurredAt": 30})).await.unwrap();

    assert_eq!(a, RecordKey::Int(1));
    assert_eq!(b, RecordKey::Int(2));
    assert_eq!(c, RecordKey::Int(11));
}

#[tokio::test]
async fn scan_index_orders_by_value_then_key() {
    let store = LocalStore::open_in_memory().unwrap();
    store
        .register(CollectionSpec::new("items", "id").index("rank"))
        .await
        .unwrap();
    for (id, rank) in [("c", 2), ("a", 3), ("b", 1), ("d", 2)] {
        store.put("items", json!({"id": id, "rank": rank})).await.unwrap();
    }
    store.put("items", json!({"id": "z"})).await.unwrap();

    let ordered: Vec<String> = store
        .scan_index("items", "rank", None)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.key.to_string())
        .collect();
    assert_eq!(ordered, vec!["b", "c", "d", "a"]);

    let first_two = store.scan_index("items", "rank", Some(2)).await.unwrap();
    assert_eq!(first_two.len(), 2);
}

#[tokio::test]
async fn delete_by_index_below_prunes_old_records() {
    let store = LocalStore::open_in_memory().unwrap();
    store
        .register(CollectionSpec::new("sync_errors", "id").auto_key().index("occurredAt"))
        .await
        .unwrap();
    for at in [100, 200, 300, 400] {
        store.put("sync_errors", json!({"occurredAt": at})).await.unwrap();
    }

    let removed = store
        .delete_by_index_below("sync_errors", "occurredAt", &json!(300))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(store.count("sync_errors").await.unwrap(), 2);
}

#[tokio::test]
async fn changed_spec_rebuilds_indexes() {
    let store = LocalStore::open_in_memory().unwrap();
    store.register(CollectionSpec::new("items", "id")).await.unwrap();
    store.put("items", json!({"id": 1, "sku": "A"})).await.unwrap();
    store.put("items", json!({"id": 2, "sku": "B"})).await.unwrap();

    store
        .register(CollectionSpec::new("items", "id").unique("sku"))
        .await
        .unwrap();
    let found = store.find_unique("items", "sku", &json!("B")).await.unwrap().unwrap();
    assert_eq!(found.key, RecordKey::Int(2));
}

// ── Query ────────────────────────────────────────────────────────

#[tokio::test]
async fn query_streams_matching_records_across_pages() {
    let store = LocalStore::open_in_memory().unwrap();
    store.register(CollectionSpec::new("items", "id")).await.unwrap();
    for id in 1..=25 {
        store.put("items", json!({"id": id, "even": id % 2 == 0})).await.unwrap();
    }

    let query = store
        .query("items", |body| body["even"] == json!(true))
        .unwrap()
        .with_page_size(4);
    let evens = query.collect_all().await.unwrap();
    assert_eq!(evens.len(), 12);
    assert_eq!(evens[0].key, RecordKey::Int(2));
    assert_eq!(evens[11].key, RecordKey::Int(24));
}

#[tokio::test]
async fn query_is_restartable_and_sees_new_records() {
    let store = LocalStore::open_in_memory().unwrap();
    store.register(CollectionSpec::new("items", "id")).await.unwrap();
    store.put("items", json!({"id": 1})).await.unwrap();

    let query = store.query("items", |_| true).unwrap();
    assert_eq!(query.count().await.unwrap(), 1);
    store.put("items", json!({"id": 2})).await.unwrap();
    assert_eq!(query.count().await.unwrap(), 2);
    assert_eq!(query.count().await.unwrap(), 2);
}

// ── Persistence and failure handling ─────────────────────────────

#[tokio::test]
async fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.db");
    {
        let store = LocalStore::open(&path, StoreConfig::default()).unwrap();
        store.register(credentials_spec()).await.unwrap();
        store
            .put("cached_credentials", json!({"userId": 1, "loginName": "alice"}))
            .await
            .unwrap();
    }
    let store = LocalStore::open(&path, StoreConfig::default()).unwrap();
    store.register(credentials_spec()).await.unwrap();
    let found = store
        .find_unique("cached_credentials", "loginName", &json!("alice"))
        .await
        .unwrap();
    assert!(found.is_some());
}

#[tokio::test]
async fn locked_database_surfaces_transient_abort_after_five_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locked.db");
    let config = StoreConfig {
        retry: RetryPolicy {
            delays_ms: vec![5, 5, 5, 5, 5],
            max_attempts: 5,
        },
        ..StoreConfig::default()
    };
    let store = LocalStore::open(&path, config).unwrap();
    store.register(credentials_spec()).await.unwrap();

    let blocker = rusqlite::Connection::open(&path).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

    let err = store
        .put("cached_credentials", json!({"userId": 1, "loginName": "alice"}))
        .await
        .unwrap_err();
    match err {
        StoreError::TransientAbort { attempts, .. } => assert_eq!(attempts, 5),
        other => panic!("expected TransientAbort, got {other:?}"),
    }

    blocker.execute_batch("ROLLBACK").unwrap();
    store
        .put("cached_credentials", json!({"userId": 1, "loginName": "alice"}))
        .await
        .unwrap();
}

#[tokio::test]
async fn transient_lock_is_retried_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contended.db");
    let store = LocalStore::open(&path, StoreConfig::default()).unwrap();
    store.register(credentials_spec()).await.unwrap();

    let blocker = rusqlite::Connection::open(&path).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();
    let release = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(150));
        blocker.execute_batch("COMMIT").unwrap();
    });

    store
        .put("cached_credentials", json!({"userId": 1, "loginName": "alice"}))
        .await
        .unwrap();
    release.join().unwrap();
    assert_eq!(store.count("cached_credentials").await.unwrap(), 1);
}

struct CountingHook(AtomicUsize);

#[async_trait]
impl EvictionHook for CountingHook {
    async fn on_capacity_exceeded(&self, report: &CapacityReport) {
        assert_eq!(report.collection, "blobs");
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn quota_exhaustion_fires_eviction_hook() {
    let store = LocalStore::open_in_memory_with(StoreConfig {
        quota_bytes: Some(96 * 1024),
        ..StoreConfig::default()
    })
    .unwrap();
    store.register(CollectionSpec::new("blobs", "id")).await.unwrap();
    let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
    store.set_eviction_hook(hook.clone()).unwrap();

    let filler = "x".repeat(8 * 1024);
    let mut failure = None;
    for id in 0..64 {
        if let Err(e) = store.put("blobs", json!({"id": id, "data": filler})).await {
            failure = Some(e);
            break;
        }
    }

    match failure {
        Some(StoreError::CapacityExceeded {
            collection,
            quota_bytes,
        }) => {
            assert_eq!(collection, "blobs");
            assert_eq!(quota_bytes, Some(96 * 1024));
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }
    assert_eq!(hook.0.load(Ordering::SeqCst), 1);
}

/// Frees space by emptying the collection that hit the quota.
struct ClearingHook {
    store: LocalStore,
    cleared: AtomicUsize,
}

#[async_trait]
impl EvictionHook for ClearingHook {
    async fn on_capacity_exceeded(&self, report: &CapacityReport) {
        let removed = self.store.clear(&report.collection).await.unwrap();
        self.cleared.fetch_add(removed, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn eviction_finishes_before_the_error_is_returned() {
    let store = LocalStore::open_in_memory_with(StoreConfig {
        quota_bytes: Some(96 * 1024),
        ..StoreConfig::default()
    })
    .unwrap();
    store.register(CollectionSpec::new("blobs", "id")).await.unwrap();
    let hook = Arc::new(ClearingHook {
        store: store.clone(),
        cleared: AtomicUsize::new(0),
    });
    store.set_eviction_hook(hook.clone()).unwrap();

    let filler = "x".repeat(8 * 1024);
    let mut failed_at = None;
    for id in 0..64 {
        if let Err(e) = store.put("blobs", json!({"id": id, "data": filler})).await {
            assert!(matches!(e, StoreError::CapacityExceeded { .. }));
            failed_at = Some(id);
            break;
        }
    }
    let failed_at = failed_at.expect("quota never reached");

    // The hook already ran to completion, so the retry fits.
    assert!(hook.cleared.load(Ordering::SeqCst) > 0);
    assert_eq!(store.count("blobs").await.unwrap(), 0);
    store
        .put("blobs", json!({"id": failed_at, "data": filler}))
        .await
        .unwrap();
    assert_eq!(store.count("blobs").await.unwrap(), 1);
}
