//! Offline change queue and synchronization engine for tillsafe.
//!
//! Local state changes are queued durably with a priority band and pushed
//! to the coordinating server in batches whenever the connectivity monitor
//! reports Online. Server deltas for configured collections
//! are pulled back into the local store with the store's constraint-safe
//! upsert.
//!
//! # Architecture
//!
//! - [`SyncQueue`] persists changes in the `queued_changes` collection,
//!   ordered by band and enqueue time, with attempt tracking
//! - [`select_batch`](batch::select_batch) reserves 30% of every batch for
//!   Critical/High work and fills the rest oldest-first so low bands are
//!   never starved
//! - [`SyncEngine`] runs one cycle at a time from a `tokio::select!` loop and
//!   backs off exponentially, scaled by measured network quality
//! - [`OfflineRuntime`] wires store, credential cache, monitor and engine
//!   together for the host

pub mod backoff;
pub mod batch;
pub mod checkpoints;
pub mod config;
pub mod engine;
mod error;
pub mod error_log;
pub mod fingerprint;
pub mod queue;
pub mod runtime;
pub mod transport;
pub mod types;

pub use backoff::{Backoff, BackoffConfig, NetworkQuality};
pub use checkpoints::{Checkpoints, SyncCheckpoint};
pub use config::{RuntimeConfig, SyncConfig};
pub use engine::{create_sync_engine, SyncCommand, SyncEngine, SyncHandle, SyncStores};
pub use error::{ErrorKind, NetworkError, SyncError, SyncResult};
pub use error_log::ErrorLog;
pub use queue::SyncQueue;
pub use runtime::OfflineRuntime;
pub use transport::{
    AcceptedItem, PullRequest, PullResponse, PushItem, PushRequest, PushResponse, RejectedItem,
    RemotePeer, SessionTokenSource, StaticToken,
};
pub use types::{
    ChangeStatus, NewChange, Priority, QueueStats, QueuedChange, SyncCycleReport, SyncErrorRecord,
    SyncEvent,
};
