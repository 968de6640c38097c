//! Synchronization engine.
//!
//! Drains the queue to the remote peer and pulls server deltas into the
//! local store. Runs as a single task:
//! - A cycle starts when connectivity becomes Online, on the periodic
//!   interval, when a backoff delay expires, or on [`SyncHandle::sync_now`]
//! - Each push batch is one round-trip; every item's outcome is applied on
//!   its own, so one bad item never blocks the rest
//! - Connectivity is re-checked between batches; leaving Online ends the cycle
//! - Failures schedule the next cycle with network-aware backoff

use crate::backoff::Backoff;
use crate::checkpoints::Checkpoints;
use crate::config::SyncConfig;
use crate::error::{ErrorKind, NetworkError, SyncError, SyncResult};
use crate::error_log::ErrorLog;
use crate::fingerprint;
use crate::queue::SyncQueue;
use crate::transport::{PullRequest, PushItem, PushRequest, RemotePeer, SessionTokenSource};
use crate::types::{ChangeStatus, QueuedChange, SyncCycleReport, SyncEvent};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tillsafe_connectivity::{ConnectivityHandle, ConnectivityState};
use tillsafe_storage::{LocalStore, StoreError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Commands accepted by the engine loop.
#[derive(Debug)]
pub enum SyncCommand {
    SyncNow {
        reply: oneshot::Sender<SyncResult<SyncCycleReport>>,
    },
    Shutdown,
}

/// Handle for sending commands to the sync engine.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl SyncHandle {
    /// Runs a cycle now and waits for its report.
    pub async fn sync_now(&self) -> SyncResult<SyncCycleReport> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(SyncCommand::SyncNow { reply })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.command_tx
            .send(SyncCommand::Shutdown)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }
}

/// Store-backed state the engine works on.
#[derive(Clone)]
pub struct SyncStores {
    pub store: LocalStore,
    pub queue: SyncQueue,
    pub errors: ErrorLog,
    pub checkpoints: Checkpoints,
}

impl SyncStores {
    /// Registers every collection the engine touches, including the
    /// configured pull collections.
    pub async fn open(store: LocalStore, config: &SyncConfig) -> SyncResult<Self> {
        let queue = SyncQueue::open(store.clone(), config.max_attempts, config.requeue_extra_attempts).await?;
        let errors = ErrorLog::open(store.clone()).await?;
        let checkpoints = Checkpoints::open(store.clone()).await?;
        for spec in &config.pull_collections {
            store.register(spec.clone()).await?;
        }
        Ok(Self {
            store,
            queue,
            errors,
            checkpoints,
        })
    }
}

pub struct SyncEngine {
    stores: SyncStores,
    peer: Arc<dyn RemotePeer>,
    tokens: Arc<dyn SessionTokenSource>,
    connectivity: ConnectivityHandle,
    config: SyncConfig,
    backoff: Backoff,
    command_rx: mpsc::Receiver<SyncCommand>,
    event_tx: broadcast::Sender<SyncEvent>,
}

/// Creates a sync engine and its command handle.
pub fn create_sync_engine(
    stores: SyncStores,
    peer: Arc<dyn RemotePeer>,
    tokens: Arc<dyn SessionTokenSource>,
    connectivity: ConnectivityHandle,
    config: SyncConfig,
) -> (SyncHandle, SyncEngine) {
    let (command_tx, command_rx) = mpsc::channel(32);
    let (event_tx, _) = broadcast::channel(64);

    let handle = SyncHandle {
        command_tx,
        event_tx: event_tx.clone(),
    };
    let engine = SyncEngine {
        stores,
        peer,
        tokens,
        connectivity,
        backoff: Backoff::new(config.backoff.clone()),
        config,
        command_rx,
        event_tx,
    };
    (handle, engine)
}

impl SyncEngine {
    /// Runs the engine event loop until shutdown.
    pub async fn run(mut self) {
        info!("[SYNC] Sync engine started");

        let mut connectivity_rx = self.connectivity.watch();
        let mut was_online = connectivity_rx.borrow_and_update().state == ConnectivityState::Online;
        let mut monitor_alive = true;
        let mut retry_at: Option<Instant> = None;

        let mut sync_interval =
            tokio::time::interval(Duration::from_secs(self.config.sync_interval_secs.max(1)));
        // Skip first immediate tick
        sync_interval.tick().await;

        if was_online {
            retry_at = self.cycle_and_schedule().await;
        }

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(SyncCommand::SyncNow { reply }) => {
                        debug!("[SYNC] Sync requested");
                        let result = self.cycle().await;
                        retry_at = self.schedule_after(&result);
                        let _ = reply.send(result);
                    }
                    Some(SyncCommand::Shutdown) | None => {
                        info!("[SYNC] Sync engine shutting down");
                        break;
                    }
                },

                changed = connectivity_rx.changed(), if monitor_alive => {
                    if changed.is_err() {
                        warn!("[SYNC] Connectivity monitor stopped");
                        monitor_alive = false;
                        continue;
                    }
                    let online = connectivity_rx.borrow_and_update().state == ConnectivityState::Online;
                    if online && !was_online {
                        info!("[SYNC] Connectivity restored, starting sync");
                        retry_at = self.cycle_and_schedule().await;
                    }
                    was_online = online;
                }

                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    debug!("[SYNC] Backoff elapsed (attempt {})", self.backoff.attempts());
                    retry_at = self.cycle_and_schedule().await;
                }

                _ = sync_interval.tick() => {
                    if retry_at.is_none() && self.is_online() {
                        debug!("[SYNC] Sync interval tick");
                        retry_at = self.cycle_and_schedule().await;
                    }
                }
            }
        }

        info!("[SYNC] Sync engine stopped");
    }

    async fn cycle_and_schedule(&mut self) -> Option<Instant> {
        let result = self.cycle().await;
        self.schedule_after(&result)
    }

    /// Runs one cycle and broadcasts its outcome.
    async fn cycle(&mut self) -> SyncResult<SyncCycleReport> {
        let result = self.run_cycle().await;
        let event = match &result {
            Ok(report) => SyncEvent::CycleCompleted(report.clone()),
            Err(e) => {
                warn!("[SYNC] Sync cycle failed: {e}");
                SyncEvent::CycleFailed {
                    error: e.to_string(),
                }
            }
        };
        let _ = self.event_tx.send(event);
        result
    }

    /// Next retry time after a cycle, if one is needed. Offline and
    /// cancelled cycles leave the attempt counter alone; reconnecting
    /// starts the next cycle.
    fn schedule_after(&mut self, result: &SyncResult<SyncCycleReport>) -> Option<Instant> {
        let failed = match result {
            Ok(report) if report.cancelled => return None,
            Ok(report) => report.had_failures(),
            Err(SyncError::Offline) => return None,
            Err(_) => true,
        };
        if !failed {
            self.backoff.on_success();
            return None;
        }
        let latency = self.connectivity.snapshot().measured_latency_ms;
        let delay = self.backoff.on_failure(latency);
        let attempt = self.backoff.attempts();
        info!("[SYNC] Retrying in {:?} (attempt {})", delay, attempt);
        let _ = self.event_tx.send(SyncEvent::RetryScheduled { attempt, delay });
        Some(Instant::now() + delay)
    }

    /// Degraded links count as offline: cycles only run while Online.
    fn is_online(&self) -> bool {
        self.connectivity.state() == ConnectivityState::Online
    }

    /// Pushes pending changes batch by batch, then pulls server deltas.
    pub async fn run_cycle(&mut self) -> SyncResult<SyncCycleReport> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        let token = self
            .tokens
            .session_token()
            .await
            .ok_or(SyncError::NoSession)?;

        let mut report = SyncCycleReport::default();
        let mut attempted: HashSet<String> = HashSet::new();

        for _ in 0..self.config.max_batches_per_cycle.max(1) {
            if !self.is_online() {
                info!("[SYNC] Connectivity left Online, stopping cycle between batches");
                report.cancelled = true;
                break;
            }
            let batch = self
                .stores
                .queue
                .next_batch_excluding(self.config.batch_max_items, self.config.batch_max_bytes, &attempted)
                .await?;
            if batch.is_empty() {
                break;
            }
            attempted.extend(batch.iter().map(|c| c.local_id.clone()));

            if self.push_batch(&token, batch, &mut report).await.is_err() {
                report.transport_failed = true;
                break;
            }
        }

        if !report.cancelled && !report.transport_failed {
            self.pull_all(&token, &mut report).await;
        }

        self.prune_errors().await;

        if !report.cancelled && !report.transport_failed {
            self.stores.checkpoints.mark_synced().await?;
        }

        info!(
            "[SYNC] Cycle done: pushed={} completed={} unchanged={} rejected={} failed={} dead={} pulled={} pull_errors={}{}",
            report.pushed,
            report.completed,
            report.unchanged,
            report.rejected,
            report.failed_now,
            report.dead_lettered,
            report.pulled,
            report.pull_errors,
            if report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }

    /// One push round-trip. `Err` means the batch failed as a whole.
    async fn push_batch(
        &self,
        token: &str,
        batch: Vec<QueuedChange>,
        report: &mut SyncCycleReport,
    ) -> Result<(), NetworkError> {
        let mut to_send: Vec<(QueuedChange, String)> = Vec::with_capacity(batch.len());
        for change in batch {
            let fp = fingerprint::change_fingerprint(&change.entity_type, &change.payload);
            if self.already_acknowledged(&change, &fp).await {
                match self.stores.queue.mark_complete(&change.local_id).await {
                    Ok(_) => {
                        debug!("[SYNC] {} unchanged since last sync, skipped", change.local_id);
                        report.unchanged += 1;
                    }
                    Err(e) => warn!("[SYNC] Failed to complete unchanged {}: {e}", change.local_id),
                }
                continue;
            }
            to_send.push((change, fp));
        }
        if to_send.is_empty() {
            return Ok(());
        }

        let request = PushRequest {
            session_token: token.to_string(),
            items: to_send
                .iter()
                .map(|(change, fp)| PushItem {
                    local_id: change.local_id.clone(),
                    entity_type: change.entity_type.clone(),
                    fingerprint: fp.clone(),
                    payload: change.payload.clone(),
                })
                .collect(),
        };
        report.pushed += to_send.len();
        debug!("[SYNC] Pushing {} changes", to_send.len());

        let response = match self.round_trip(self.peer.push(request)).await {
            Ok(response) => response,
            Err(e) => {
                warn!("[SYNC] Push of {} changes failed: {e}", to_send.len());
                let reason = e.to_string();
                for (change, _) in &to_send {
                    self.fail_item(change, ErrorKind::Network, &reason, report).await;
                }
                return Err(e);
            }
        };

        let accepted: HashMap<&str, &Value> = response
            .accepted
            .iter()
            .map(|a| (a.local_id.as_str(), &a.server_id))
            .collect();
        let rejected: HashMap<&str, &str> = response
            .rejected
            .iter()
            .map(|r| (r.local_id.as_str(), r.reason.as_str()))
            .collect();

        for (change, fp) in &to_send {
            let id = change.local_id.as_str();
            if let Some(server_id) = accepted.get(id) {
                if let Err(e) = self.stores.queue.mark_complete(id).await {
                    error!("[SYNC] Failed to complete acknowledged change {id}: {e}");
                    self.log_error(Some(id), ErrorKind::for_sync_error(&e), &e.to_string())
                        .await;
                    continue;
                }
                if let Some(key) = &change.entity_key {
                    if let Err(e) = self
                        .stores
                        .checkpoints
                        .record_sent(&change.entity_type, key, fp)
                        .await
                    {
                        warn!("[SYNC] Failed to record fingerprint for {id}: {e}");
                    }
                }
                debug!("[SYNC] {id} ({}) acknowledged as {server_id}", change.entity_type);
                report.completed += 1;
            } else if let Some(reason) = rejected.get(id) {
                report.rejected += 1;
                self.fail_item(change, ErrorKind::Rejected, reason, report).await;
            } else {
                self.fail_item(change, ErrorKind::NotAcknowledged, "not acknowledged by server", report)
                    .await;
            }
        }
        Ok(())
    }

    async fn already_acknowledged(&self, change: &QueuedChange, fp: &str) -> bool {
        let Some(key) = &change.entity_key else {
            return false;
        };
        match self
            .stores
            .checkpoints
            .sent_fingerprint(&change.entity_type, key)
            .await
        {
            Ok(previous) => previous.as_deref() == Some(fp),
            Err(e) => {
                warn!("[SYNC] Fingerprint lookup failed for {}: {e}", change.local_id);
                false
            }
        }
    }

    /// Records a failed attempt for one item without touching the others.
    async fn fail_item(&self, change: &QueuedChange, kind: ErrorKind, reason: &str, report: &mut SyncCycleReport) {
        report.failed_now += 1;
        self.log_error(Some(&change.local_id), kind, reason).await;

        match self.stores.queue.mark_failed(&change.local_id, reason).await {
            Ok(updated) if updated.status == ChangeStatus::Failed => {
                report.dead_lettered += 1;
                self.log_error(
                    Some(&change.local_id),
                    ErrorKind::DeadLetter,
                    &format!("gave up after {} attempts: {reason}", updated.attempts),
                )
                .await;
                let _ = self.event_tx.send(SyncEvent::DeadLettered {
                    local_id: updated.local_id,
                    entity_type: updated.entity_type,
                });
            }
            Ok(_) => {}
            Err(e) => error!("[SYNC] Failed to record failure for {}: {e}", change.local_id),
        }
    }

    async fn pull_all(&self, token: &str, report: &mut SyncCycleReport) {
        for spec in &self.config.pull_collections {
            if !self.is_online() {
                report.cancelled = true;
                return;
            }
            let collection = spec.name.as_str();
            let since = match self.stores.checkpoints.get(collection).await {
                Ok(checkpoint) => checkpoint.and_then(|c| c.fingerprint),
                Err(e) => {
                    warn!("[SYNC] Checkpoint read failed for '{collection}': {e}");
                    None
                }
            };

            let request = PullRequest {
                session_token: token.to_string(),
                collection: collection.to_string(),
                since_fingerprint: since,
            };
            let response = match self.round_trip(self.peer.pull(request)).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("[SYNC] Pull of '{collection}' failed: {e}");
                    report.pull_errors += 1;
                    self.log_error(None, ErrorKind::Network, &format!("pull '{collection}': {e}"))
                        .await;
                    continue;
                }
            };

            let mut failed = 0;
            for record in response.records {
                match self.stores.store.put(collection, record).await {
                    Ok(_) => report.pulled += 1,
                    Err(e) => {
                        failed += 1;
                        report.pull_errors += 1;
                        let kind = match e {
                            StoreError::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
                            _ => ErrorKind::Pull,
                        };
                        self.log_error(None, kind, &format!("apply to '{collection}': {e}"))
                            .await;
                    }
                }
            }

            // Keep the old checkpoint if anything failed so the records come back.
            if failed == 0 {
                if let Some(fp) = response.new_fingerprint.as_deref() {
                    if let Err(e) = self.stores.checkpoints.set(collection, Some(fp)).await {
                        warn!("[SYNC] Checkpoint write failed for '{collection}': {e}");
                    }
                }
            }
        }
    }

    async fn prune_errors(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        let cutoff = now - self.config.error_retention_days as i64 * MS_PER_DAY;
        if let Err(e) = self.stores.errors.prune_before(cutoff).await {
            warn!("[SYNC] Error log pruning failed: {e}");
        }
        let cutoff = now - self.config.fingerprint_retention_days as i64 * MS_PER_DAY;
        if let Err(e) = self.stores.checkpoints.prune_sent_before(cutoff).await {
            warn!("[SYNC] Fingerprint pruning failed: {e}");
        }
    }

    async fn log_error(&self, change_id: Option<&str>, kind: ErrorKind, message: &str) {
        if let Err(e) = self.stores.errors.record(change_id, kind, message).await {
            warn!("[SYNC] Failed to record sync error ({message}): {e}");
        }
    }

    /// Bounds a round-trip by the monitor's current probe timeout.
    async fn round_trip<T>(&self, request: impl Future<Output = Result<T, NetworkError>>) -> Result<T, NetworkError> {
        let timeout = self.connectivity.probe_timeout();
        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout(timeout)),
        }
    }
}
