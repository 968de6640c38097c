//! Async connectivity monitor.
//!
//! Drives the [`ConnectivityMachine`] from a probe timer and host network
//! signals. Follows the handle/loop split used by the sync engine: the
//! caller keeps a cloneable [`ConnectivityHandle`] and spawns
//! [`ConnectivityMonitor::run`].

use crate::config::{MonitorConfig, NetworkClass};
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::sink::SnapshotSink;
use crate::state::{
    ConnectivityEvent, ConnectivityMachine, ConnectivitySnapshot, ConnectivityState, MonitorInput,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Host-provided reachability check against the remote peer.
///
/// Returning an error means unreachable; the monitor applies its own
/// timeout around the call.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> anyhow::Result<()>;
}

/// Lower-level network signals from the host platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkSignal {
    Lost,
    Restored,
    ClassChanged(NetworkClass),
}

enum MonitorCommand {
    Signal(NetworkSignal),
    ProbeNow,
    Shutdown,
}

/// Handle for observing and steering a running monitor.
#[derive(Clone)]
pub struct ConnectivityHandle {
    command_tx: mpsc::Sender<MonitorCommand>,
    snapshot_rx: watch::Receiver<ConnectivitySnapshot>,
    event_tx: broadcast::Sender<ConnectivityEvent>,
    config: Arc<MonitorConfig>,
}

impl ConnectivityHandle {
    pub async fn signal(&self, signal: NetworkSignal) -> ConnectivityResult<()> {
        self.send(MonitorCommand::Signal(signal)).await
    }

    /// Requests an immediate probe.
    pub async fn probe_now(&self) -> ConnectivityResult<()> {
        self.send(MonitorCommand::ProbeNow).await
    }

    pub async fn shutdown(&self) -> ConnectivityResult<()> {
        self.send(MonitorCommand::Shutdown).await
    }

    async fn send(&self, cmd: MonitorCommand) -> ConnectivityResult<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| ConnectivityError::ChannelClosed)
    }

    pub fn snapshot(&self) -> ConnectivitySnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn state(&self) -> ConnectivityState {
        self.snapshot_rx.borrow().state
    }

    /// Watch channel carrying the current snapshot.
    pub fn watch(&self) -> watch::Receiver<ConnectivitySnapshot> {
        self.snapshot_rx.clone()
    }

    /// Stream of transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.event_tx.subscribe()
    }

    /// Round-trip timeout for the current network class.
    pub fn probe_timeout(&self) -> Duration {
        self.config.probe_timeout(self.snapshot_rx.borrow().network_class)
    }
}

/// The monitor loop. Consumed by [`run`](Self::run).
pub struct ConnectivityMonitor {
    machine: ConnectivityMachine,
    config: Arc<MonitorConfig>,
    probe: Arc<dyn ReachabilityProbe>,
    command_rx: mpsc::Receiver<MonitorCommand>,
    snapshot_tx: watch::Sender<ConnectivitySnapshot>,
    event_tx: broadcast::Sender<ConnectivityEvent>,
    result_tx: mpsc::Sender<(u64, MonitorInput)>,
    result_rx: mpsc::Receiver<(u64, MonitorInput)>,
    sink: Option<SnapshotSink>,
    /// Bumped whenever an in-flight probe result must be ignored.
    generation: u64,
    in_flight: bool,
}

/// Creates a monitor and its handle. The monitor starts in Probing and
/// probes as soon as it runs.
pub fn create_connectivity_monitor(
    probe: Arc<dyn ReachabilityProbe>,
    config: MonitorConfig,
) -> (ConnectivityHandle, ConnectivityMonitor) {
    let (command_tx, command_rx) = mpsc::channel(32);
    let (result_tx, result_rx) = mpsc::channel(4);
    let (event_tx, _) = broadcast::channel(64);

    let config = Arc::new(config);
    let machine = ConnectivityMachine::new(&config, chrono::Utc::now());
    let (snapshot_tx, snapshot_rx) = watch::channel(machine.snapshot().clone());

    let handle = ConnectivityHandle {
        command_tx,
        snapshot_rx,
        event_tx: event_tx.clone(),
        config: config.clone(),
    };
    let monitor = ConnectivityMonitor {
        machine,
        config,
        probe,
        command_rx,
        snapshot_tx,
        event_tx,
        result_tx,
        result_rx,
        sink: None,
        generation: 0,
        in_flight: false,
    };
    (handle, monitor)
}

impl ConnectivityMonitor {
    /// Persists every snapshot change through `sink`.
    pub fn with_snapshot_sink(mut self, sink: SnapshotSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub async fn run(mut self) {
        info!("[NET] Connectivity monitor started");
        self.publish(None).await;

        let mut next_tick = Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick) => {
                    self.on_tick().await;
                    next_tick = Instant::now() + self.config.probe_interval(self.machine.network_class());
                }
                Some((generation, input)) = self.result_rx.recv() => {
                    if generation != self.generation {
                        debug!("[NET] Discarding stale probe result {input:?}");
                        continue;
                    }
                    self.in_flight = false;
                    self.apply(input).await;
                }
                cmd = self.command_rx.recv() => match cmd {
                    Some(MonitorCommand::Signal(signal)) => {
                        let class_before = self.machine.network_class();
                        self.on_signal(signal).await;
                        if self.machine.network_class() != class_before {
                            next_tick = Instant::now() + self.config.probe_interval(self.machine.network_class());
                        }
                    }
                    Some(MonitorCommand::ProbeNow) => {
                        self.on_tick().await;
                        next_tick = Instant::now() + self.config.probe_interval(self.machine.network_class());
                    }
                    Some(MonitorCommand::Shutdown) | None => {
                        info!("[NET] Connectivity monitor stopping");
                        break;
                    }
                },
            }
        }
    }

    async fn on_tick(&mut self) {
        if self.machine.state() == ConnectivityState::Offline {
            self.apply(MonitorInput::TimerTick).await;
        }
        self.start_probe();
    }

    async fn on_signal(&mut self, signal: NetworkSignal) {
        debug!("[NET] Network signal: {signal:?}");
        match signal {
            NetworkSignal::Lost => {
                // Whatever the in-flight probe reports is now stale.
                self.generation += 1;
                self.in_flight = false;
                self.apply(MonitorInput::NetworkLost).await;
            }
            NetworkSignal::Restored => {
                if self.apply(MonitorInput::NetworkRestored).await {
                    self.start_probe();
                }
            }
            NetworkSignal::ClassChanged(class) => {
                self.apply(MonitorInput::NetworkClassChanged(class)).await;
            }
        }
    }

    fn start_probe(&mut self) {
        if self.in_flight {
            return;
        }
        self.in_flight = true;
        let probe = self.probe.clone();
        let timeout = self.config.probe_timeout(self.machine.network_class());
        let tx = self.result_tx.clone();
        let generation = self.generation;

        tokio::spawn(async move {
            let started = Instant::now();
            let input = match tokio::time::timeout(timeout, probe.probe()).await {
                Ok(Ok(())) => MonitorInput::ProbeSucceeded {
                    latency: started.elapsed(),
                },
                Ok(Err(e)) => {
                    debug!("[NET] Probe failed: {e}");
                    MonitorInput::ProbeFailed
                }
                Err(_) => {
                    debug!("[NET] Probe timed out after {timeout:?}");
                    MonitorInput::ProbeTimedOut
                }
            };
            let _ = tx.send((generation, input)).await;
        });
    }

    /// Applies an input and publishes the result. Returns true on a state
    /// change.
    async fn apply(&mut self, input: MonitorInput) -> bool {
        let event = self.machine.apply(input, chrono::Utc::now());
        let changed = event.is_some();
        self.publish(event).await;
        changed
    }

    async fn publish(&mut self, event: Option<ConnectivityEvent>) {
        let snapshot = self.machine.snapshot().clone();
        self.snapshot_tx.send_replace(snapshot.clone());

        if let Some(event) = event {
            match event.to {
                ConnectivityState::Offline => warn!(
                    "[NET] {:?} -> {:?} ({:?})",
                    event.from, event.to, event.cause
                ),
                _ => info!("[NET] {:?} -> {:?} ({:?})", event.from, event.to, event.cause),
            }
            // No subscribers is fine.
            let _ = self.event_tx.send(event);
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.save(&snapshot).await {
                warn!("[NET] Failed to persist connectivity snapshot: {e}");
            }
        }
    }
}
