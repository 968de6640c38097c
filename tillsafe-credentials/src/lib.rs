//! Offline credential cache for tillsafe.
//!
//! After each successful online login the host hands the user's password
//! hash to [`CredentialCache::save`]. While the server is unreachable, the
//! terminal authenticates against this cache instead.
//!
//! - One record per login name, enforced by the local store's unique index
//! - Hash comparison is constant-time
//! - Plaintext verification uses Argon2id PHC strings (m=64 MiB, t=3, p=4
//!   by default)
//! - No lockout or rate limiting here; that belongs to the host

mod cache;
mod error;
pub mod hashing;

pub use cache::{
    CachedCredential, CredentialCache, CredentialConfig, OfflineLoginOutcome,
    CREDENTIALS_COLLECTION,
};
pub use error::{CredentialError, CredentialResult};
pub use hashing::HashParams;
