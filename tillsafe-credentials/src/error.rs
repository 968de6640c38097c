use thiserror::Error;
use tillsafe_storage::StoreError;

pub type CredentialResult<T> = Result<T, CredentialError>;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("invalid credential: {0}")]
    Validation(String),

    #[error("password hashing failed: {0}")]
    Hashing(String),
}
