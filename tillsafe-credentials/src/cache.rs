//! Credential cache on top of the local store.

use crate::error::{CredentialError, CredentialResult};
use crate::hashing::{self, HashParams};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tillsafe_storage::{CollectionSpec, LocalStore, RecordKey};
use tracing::{debug, info, warn};

/// Collection holding cached credentials.
pub const CREDENTIALS_COLLECTION: &str = "cached_credentials";

/// A credential cached after a successful online login.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCredential {
    pub user_id: i64,
    pub login_name: String,
    pub password_hash: String,
    /// Unix milliseconds.
    pub cached_at: i64,
}

/// Result of an offline login attempt. A missing credential is an expected
/// outcome, not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OfflineLoginOutcome {
    Granted,
    Denied,
    NoCachedCredential,
}

impl OfflineLoginOutcome {
    pub fn is_granted(self) -> bool {
        matches!(self, OfflineLoginOutcome::Granted)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Parameters for hashes produced by [`CredentialCache::hash_password`].
    pub hash: HashParams,
}

/// Hashed authentication material for offline login, one record per login
/// name.
#[derive(Clone)]
pub struct CredentialCache {
    store: LocalStore,
    config: CredentialConfig,
}

impl CredentialCache {
    pub fn collection_spec() -> CollectionSpec {
        CollectionSpec::new(CREDENTIALS_COLLECTION, "userId")
            .auto_key()
            .unique("loginName")
    }

    /// Registers the credential collection and returns the cache.
    pub async fn open(store: LocalStore, config: CredentialConfig) -> CredentialResult<Self> {
        store.register(Self::collection_spec()).await?;
        Ok(Self { store, config })
    }

    /// Caches `password_hash` for `login_name` after an online login. A
    /// repeat save for the same login replaces the hash in place.
    pub async fn save(&self, login_name: &str, password_hash: &str) -> CredentialResult<i64> {
        self.write(None, login_name, password_hash).await
    }

    /// Like [`save`](Self::save) but with the server's user id. If the login
    /// is already cached under another id, the existing id is kept.
    pub async fn save_user(&self, user_id: i64, login_name: &str, password_hash: &str) -> CredentialResult<i64> {
        self.write(Some(user_id), login_name, password_hash).await
    }

    async fn write(&self, user_id: Option<i64>, login_name: &str, password_hash: &str) -> CredentialResult<i64> {
        if login_name.trim().is_empty() {
            return Err(CredentialError::Validation("login name must not be empty".into()));
        }
        if password_hash.is_empty() {
            return Err(CredentialError::Validation("password hash must not be empty".into()));
        }

        let mut record = json!({
            "loginName": login_name,
            "passwordHash": password_hash,
            "cachedAt": chrono::Utc::now().timestamp_millis(),
        });
        if let Some(id) = user_id {
            record["userId"] = json!(id);
        }

        let key = self.store.put(CREDENTIALS_COLLECTION, record).await?;
        let id = key.as_int().ok_or_else(|| {
            CredentialError::Validation(format!("credential stored under non-integer key {key}"))
        })?;
        if user_id.is_some_and(|requested| requested != id) {
            debug!("[AUTH] Credential for '{}' kept existing user id {}", login_name, id);
        }
        info!("[AUTH] Cached credential for '{}'", login_name);
        Ok(id)
    }

    pub async fn get(&self, login_name: &str) -> CredentialResult<Option<CachedCredential>> {
        if login_name.is_empty() {
            return Ok(None);
        }
        let record = self
            .store
            .find_unique(CREDENTIALS_COLLECTION, "loginName", &json!(login_name))
            .await?;
        Ok(record.map(|r| r.decode()).transpose()?)
    }

    /// Compares `candidate_hash` with the cached hash in constant time.
    /// Returns false when nothing is cached for the login.
    pub async fn validate(&self, login_name: &str, candidate_hash: &str) -> CredentialResult<bool> {
        let Some(cached) = self.get(login_name).await? else {
            debug!("[AUTH] No cached credential for '{}'", login_name);
            return Ok(false);
        };
        Ok(hashing::constant_time_eq(
            cached.password_hash.as_bytes(),
            candidate_hash.as_bytes(),
        ))
    }

    /// Verifies a plaintext password against the cached Argon2 hash.
    pub async fn verify_password(&self, login_name: &str, password: &str) -> CredentialResult<OfflineLoginOutcome> {
        let Some(cached) = self.get(login_name).await? else {
            debug!("[AUTH] No cached credential for '{}'", login_name);
            return Ok(OfflineLoginOutcome::NoCachedCredential);
        };

        let password = password.to_string();
        let hash = cached.password_hash;
        let verified = tokio::task::spawn_blocking(move || hashing::verify_password(&password, &hash))
            .await
            .map_err(|e| CredentialError::Hashing(e.to_string()))?;

        if verified {
            info!("[AUTH] Offline login granted for '{}'", login_name);
            Ok(OfflineLoginOutcome::Granted)
        } else {
            warn!("[AUTH] Offline login denied for '{}'", login_name);
            Ok(OfflineLoginOutcome::Denied)
        }
    }

    /// Produces a PHC hash with the configured parameters.
    pub async fn hash_password(&self, password: &str) -> CredentialResult<String> {
        let password = password.to_string();
        let params = self.config.hash.clone();
        tokio::task::spawn_blocking(move || hashing::hash_password(&password, &params))
            .await
            .map_err(|e| CredentialError::Hashing(e.to_string()))?
    }

    /// Removes the cached credential for a login. Returns false if none was
    /// cached.
    pub async fn forget(&self, login_name: &str) -> CredentialResult<bool> {
        let Some(cached) = self.get(login_name).await? else {
            return Ok(false);
        };
        let removed = self
            .store
            .delete(CREDENTIALS_COLLECTION, RecordKey::Int(cached.user_id))
            .await?;
        if removed {
            info!("[AUTH] Forgot cached credential for '{}'", login_name);
        }
        Ok(removed)
    }

    pub async fn count(&self) -> CredentialResult<usize> {
        Ok(self.store.count(CREDENTIALS_COLLECTION).await?)
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }
}
