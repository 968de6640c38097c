use pretty_assertions::assert_eq;
use serde_json::json;
use tillsafe_credentials::{
    CredentialCache, CredentialConfig, CredentialError, HashParams, OfflineLoginOutcome,
    CREDENTIALS_COLLECTION,
};
use tillsafe_storage::{LocalStore, StoreConfig};

fn cheap_config() -> CredentialConfig {
    CredentialConfig {
        hash: HashParams {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
            output_len: 32,
        },
    }
}

async fn cache() -> CredentialCache {
    let store = LocalStore::open_in_memory().unwrap();
    CredentialCache::open(store, cheap_config()).await.unwrap()
}

// ── Save / validate ──────────────────────────────────────────────

#[tokio::test]
async fn save_then_validate() {
    let cache = cache().await;
    cache.save("alice", "hashA").await.unwrap();

    assert!(cache.validate("alice", "hashA").await.unwrap());
    assert!(!cache.validate("alice", "hashB").await.unwrap());
}

#[tokio::test]
async fn validate_unknown_login_is_false_not_error() {
    let cache = cache().await;
    assert!(!cache.validate("nobody", "x").await.unwrap());
    assert!(!cache.validate("", "x").await.unwrap());
}

#[tokio::test]
async fn repeated_save_refreshes_in_place() {
    let cache = cache().await;
    let first = cache.save("alice", "hashA").await.unwrap();
    let second = cache.save("alice", "hashB").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(cache.count().await.unwrap(), 1);
    assert!(cache.validate("alice", "hashB").await.unwrap());
    assert!(!cache.validate("alice", "hashA").await.unwrap());
}

#[tokio::test]
async fn server_user_id_change_keeps_existing_record() {
    let cache = cache().await;
    cache.save_user(1, "alice", "hashA").await.unwrap();
    let id = cache.save_user(2, "alice", "hashB").await.unwrap();

    assert_eq!(id, 1);
    assert_eq!(cache.count().await.unwrap(), 1);
    let cached = cache.get("alice").await.unwrap().unwrap();
    assert_eq!(cached.user_id, 1);
    assert_eq!(cached.password_hash, "hashB");

    let by_login = cache
        .store()
        .get_by_index(CREDENTIALS_COLLECTION, "loginName", &json!("alice"))
        .await
        .unwrap();
    assert_eq!(by_login.len(), 1);
}

#[tokio::test]
async fn distinct_logins_get_distinct_records() {
    let cache = cache().await;
    let a = cache.save("alice", "h1").await.unwrap();
    let b = cache.save("bob", "h2").await.unwrap();
    assert_ne!(a, b);
    assert_eq!(cache.count().await.unwrap(), 2);
}

#[tokio::test]
async fn empty_inputs_are_rejected() {
    let cache = cache().await;
    assert!(matches!(
        cache.save("", "hash").await,
        Err(CredentialError::Validation(_))
    ));
    assert!(matches!(
        cache.save("alice", "").await,
        Err(CredentialError::Validation(_))
    ));
    assert_eq!(cache.count().await.unwrap(), 0);
}

#[tokio::test]
async fn forget_removes_credential() {
    let cache = cache().await;
    cache.save("alice", "h").await.unwrap();
    assert!(cache.forget("alice").await.unwrap());
    assert!(!cache.forget("alice").await.unwrap());
    assert!(cache.get("alice").await.unwrap().is_none());
}

// ── Offline login with plaintext ─────────────────────────────────

#[tokio::test]
async fn verify_password_outcomes() {
    let cache = cache().await;
    let phc = cache.hash_password("1234").await.unwrap();
    cache.save("cashier", &phc).await.unwrap();

    assert_eq!(
        cache.verify_password("cashier", "1234").await.unwrap(),
        OfflineLoginOutcome::Granted
    );
    assert_eq!(
        cache.verify_password("cashier", "9999").await.unwrap(),
        OfflineLoginOutcome::Denied
    );
    assert_eq!(
        cache.verify_password("ghost", "1234").await.unwrap(),
        OfflineLoginOutcome::NoCachedCredential
    );
}

#[tokio::test]
async fn non_phc_hash_is_denied() {
    let cache = cache().await;
    cache.save("legacy", "plain-sha-digest").await.unwrap();
    assert_eq!(
        cache.verify_password("legacy", "plain-sha-digest").await.unwrap(),
        OfflineLoginOutcome::Denied
    );
}

#[tokio::test]
async fn credentials_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pos.db");
    {
        let store = LocalStore::open(&path, StoreConfig::default()).unwrap();
        let cache = CredentialCache::open(store, cheap_config()).await.unwrap();
        cache.save_user(42, "alice", "hashA").await.unwrap();
    }
    let store = LocalStore::open(&path, StoreConfig::default()).unwrap();
    let cache = CredentialCache::open(store, cheap_config()).await.unwrap();
    assert!(cache.validate("alice", "hashA").await.unwrap());
    assert_eq!(cache.get("alice").await.unwrap().unwrap().user_id, 42);
}
