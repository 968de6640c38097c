use thiserror::Error;
use tillsafe_storage::StoreError;

pub type ConnectivityResult<T> = Result<T, ConnectivityError>;

#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("connectivity monitor not running")]
    ChannelClosed,

    #[error("snapshot storage failed: {0}")]
    Storage(#[from] StoreError),
}
