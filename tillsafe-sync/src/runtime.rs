//! Host-facing runtime.
//!
//! [`OfflineRuntime`] opens every component over one [`LocalStore`], spawns
//! the connectivity monitor and sync engine, and exposes the calls a POS host
//! makes: enqueue changes, cache credentials after an online login, fall back
//! to offline login, and observe sync and connectivity state.

use crate::config::RuntimeConfig;
use crate::engine::{create_sync_engine, SyncHandle, SyncStores};
use crate::error::{SyncError, SyncResult};
use crate::error_log::ErrorLog;
use crate::transport::{RemotePeer, SessionTokenSource};
use crate::types::{NewChange, Priority, QueueStats, SyncCycleReport, SyncEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tillsafe_connectivity::{
    create_connectivity_monitor, ConnectivityEvent, ConnectivityHandle, ConnectivitySnapshot,
    NetworkSignal, ReachabilityProbe, SnapshotSink,
};
use tillsafe_credentials::{CredentialCache, OfflineLoginOutcome};
use tillsafe_storage::{CapacityReport, EvictionHook, LocalStore};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Frees space when the store quota is hit by dropping the sync error log.
struct ClearErrorLog {
    errors: ErrorLog,
}

#[async_trait]
impl EvictionHook for ClearErrorLog {
    async fn on_capacity_exceeded(&self, report: &CapacityReport) {
        warn!(
            "[SYNC] Store quota reached writing '{}' ({} bytes used), clearing sync error log",
            report.collection, report.used_bytes
        );
        match self.errors.clear().await {
            Ok(removed) => info!("[SYNC] Cleared {removed} sync error records"),
            Err(e) => error!("[SYNC] Failed to clear sync error log: {e}"),
        }
    }
}

pub struct OfflineRuntime {
    stores: SyncStores,
    credentials: CredentialCache,
    connectivity: ConnectivityHandle,
    sync: SyncHandle,
    monitor_task: JoinHandle<()>,
    engine_task: JoinHandle<()>,
}

impl OfflineRuntime {
    /// Opens the store at `path` and starts the runtime on it.
    pub async fn start_at(
        path: &Path,
        config: RuntimeConfig,
        probe: Arc<dyn ReachabilityProbe>,
        peer: Arc<dyn RemotePeer>,
        tokens: Arc<dyn SessionTokenSource>,
    ) -> SyncResult<Self> {
        let store = LocalStore::open(path, config.store.clone())?;
        Self::start(store, config, probe, peer, tokens).await
    }

    /// Starts the monitor and engine tasks over `store`. Must be called
    /// from within a tokio runtime.
    pub async fn start(
        store: LocalStore,
        config: RuntimeConfig,
        probe: Arc<dyn ReachabilityProbe>,
        peer: Arc<dyn RemotePeer>,
        tokens: Arc<dyn SessionTokenSource>,
    ) -> SyncResult<Self> {
        config.sync.validate()?;

        let credentials = CredentialCache::open(store.clone(), config.credentials.clone()).await?;
        let stores = SyncStores::open(store.clone(), &config.sync).await?;
        let sink = SnapshotSink::open(store.clone()).await?;

        store.set_eviction_hook(Arc::new(ClearErrorLog {
            errors: stores.errors.clone(),
        }))?;

        let (connectivity, monitor) = create_connectivity_monitor(probe, config.monitor.clone());
        let monitor = monitor.with_snapshot_sink(sink);
        let (sync, engine) = create_sync_engine(
            stores.clone(),
            peer,
            tokens,
            connectivity.clone(),
            config.sync.clone(),
        );

        let monitor_task = tokio::spawn(monitor.run());
        let engine_task = tokio::spawn(engine.run());
        info!("[SYNC] Offline runtime started");

        Ok(Self {
            stores,
            credentials,
            connectivity,
            sync,
            monitor_task,
            engine_task,
        })
    }

    /// Queues a local change for the server.
    pub async fn enqueue_change(&self, entity_type: &str, payload: Value, priority: Priority) -> SyncResult<String> {
        self.stores
            .queue
            .enqueue(NewChange::new(entity_type, payload), priority)
            .await
    }

    /// Queues a fully described change, e.g. one with an idempotency key.
    pub async fn enqueue(&self, change: NewChange, priority: Priority) -> SyncResult<String> {
        self.stores.queue.enqueue(change, priority).await
    }

    /// Queues a change to a keyed domain record. Unchanged content is not
    /// retransmitted.
    pub async fn enqueue_keyed_change(
        &self,
        entity_type: &str,
        entity_key: &str,
        payload: Value,
        priority: Priority,
    ) -> SyncResult<String> {
        self.stores
            .queue
            .enqueue(NewChange::new(entity_type, payload).with_key(entity_key), priority)
            .await
    }

    /// Caches the credential after a successful online login.
    pub async fn on_authentication_success(&self, login_name: &str, password_hash: &str) -> SyncResult<()> {
        self.credentials.save(login_name, password_hash).await?;
        Ok(())
    }

    /// Offline login check. Unknown logins are simply `false`.
    pub async fn validate_offline_login(&self, login_name: &str, password: &str) -> SyncResult<bool> {
        Ok(self.offline_login(login_name, password).await?.is_granted())
    }

    pub async fn offline_login(&self, login_name: &str, password: &str) -> SyncResult<OfflineLoginOutcome> {
        Ok(self.credentials.verify_password(login_name, password).await?)
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    pub async fn pending_change_count(&self) -> SyncResult<usize> {
        self.stores.queue.pending_count().await
    }

    pub async fn failed_change_count(&self) -> SyncResult<usize> {
        self.stores.queue.failed_count().await
    }

    pub async fn queue_stats(&self) -> SyncResult<QueueStats> {
        self.stores.queue.stats().await
    }

    /// Moves every dead-lettered change back to Pending.
    pub async fn requeue_failed_changes(&self) -> SyncResult<usize> {
        self.stores.queue.requeue_all_failed().await
    }

    /// Time of the last cycle that ran to completion.
    pub async fn last_sync_timestamp(&self) -> SyncResult<Option<DateTime<Utc>>> {
        self.stores.checkpoints.last_sync().await
    }

    pub fn connectivity(&self) -> ConnectivitySnapshot {
        self.connectivity.snapshot()
    }

    pub fn watch_connectivity(&self) -> watch::Receiver<ConnectivitySnapshot> {
        self.connectivity.watch()
    }

    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.connectivity.subscribe()
    }

    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.subscribe()
    }

    pub async fn sync_now(&self) -> SyncResult<SyncCycleReport> {
        self.sync.sync_now().await
    }

    pub async fn network_signal(&self, signal: NetworkSignal) -> SyncResult<()> {
        Ok(self.connectivity.signal(signal).await?)
    }

    pub fn store(&self) -> &LocalStore {
        &self.stores.store
    }

    pub fn error_log(&self) -> &ErrorLog {
        &self.stores.errors
    }

    /// Stops the engine and monitor and waits for both tasks.
    pub async fn shutdown(self) -> SyncResult<()> {
        let _ = self.sync.shutdown().await;
        let _ = self.connectivity.shutdown().await;
        self.engine_task
            .await
            .map_err(|e| SyncError::TaskJoin(format!("sync engine: {e}")))?;
        self.monitor_task
            .await
            .map_err(|e| SyncError::TaskJoin(format!("connectivity monitor: {e}")))?;
        info!("[SYNC] Offline runtime stopped");
        Ok(())
    }
}
