//! Shared mocks for sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tillsafe_connectivity::{
    create_connectivity_monitor, ConnectivityHandle, ConnectivityState, MonitorConfig,
    NetworkSignal, ReachabilityProbe,
};
use tillsafe_storage::LocalStore;
use tillsafe_sync::{
    create_sync_engine, AcceptedItem, NetworkError, PullRequest, PullResponse, PushItem,
    PushRequest, PushResponse, RejectedItem, RemotePeer, StaticToken, SyncConfig, SyncEngine,
    SyncHandle, SyncStores,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

// ── Mock probe ───────────────────────────────────────────────────

pub struct FixedProbe {
    pub reachable: bool,
}

#[async_trait]
impl ReachabilityProbe for FixedProbe {
    async fn probe(&self) -> anyhow::Result<()> {
        if self.reachable {
            Ok(())
        } else {
            anyhow::bail!("connection refused")
        }
    }
}

/// Succeeds after a delay the test can raise to make the link look slow.
pub struct LatencyProbe {
    pub delay_ms: AtomicU64,
}

impl LatencyProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delay_ms: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl ReachabilityProbe for LatencyProbe {
    async fn probe(&self) -> anyhow::Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }
}

/// Monitor over a [`LatencyProbe`] that degrades after one probe slower
/// than 10 ms. Waits until Online.
pub async fn latency_monitor() -> (ConnectivityHandle, JoinHandle<()>, Arc<LatencyProbe>) {
    let probe = LatencyProbe::new();
    let config = MonitorConfig {
        slow_latency_threshold_ms: 10,
        slow_probe_count: 1,
        ..MonitorConfig::default()
    };
    let (handle, monitor) = create_connectivity_monitor(probe.clone(), config);
    let task = tokio::spawn(monitor.run());
    let mut rx = handle.watch();
    rx.wait_for(|s| s.state == ConnectivityState::Online).await.unwrap();
    (handle, task, probe)
}

/// Spawns a monitor over a fixed probe and waits for its first verdict.
pub async fn monitor(reachable: bool) -> (ConnectivityHandle, JoinHandle<()>) {
    let (handle, monitor) = create_connectivity_monitor(
        Arc::new(FixedProbe { reachable }),
        MonitorConfig::default(),
    );
    let task = tokio::spawn(monitor.run());
    let expected = if reachable {
        ConnectivityState::Online
    } else {
        ConnectivityState::Offline
    };
    let mut rx = handle.watch();
    rx.wait_for(|s| s.state == expected).await.unwrap();
    (handle, task)
}

// ── Mock peer ────────────────────────────────────────────────────

/// How the peer answers one push.
pub enum PushScript {
    AcceptAll,
    /// Rejects items whose payload `n` is listed; accepts the rest.
    RejectNumbers(Vec<i64>),
    /// Answers with empty lists.
    Ignore,
    Fail(NetworkError),
}

/// What happens to the link once a push has been answered.
pub enum LinkChange {
    /// The host reports the network gone.
    Drop,
    /// Probes turn slow until the monitor reports Degraded.
    Slow(Arc<LatencyProbe>),
}

pub struct MockPeer {
    /// Push answers, in order. Empty means accept everything.
    push_script: Mutex<VecDeque<PushScript>>,
    /// Pull answers per collection. Empty means no records.
    pull_script: Mutex<HashMap<String, VecDeque<Result<PullResponse, NetworkError>>>>,
    pub pushes: Mutex<Vec<PushRequest>>,
    pub pulls: Mutex<Vec<PullRequest>>,
    /// Changes the link after the first push and waits for the monitor to act.
    link_after_push: Mutex<Option<(ConnectivityHandle, LinkChange)>>,
}

impl MockPeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            push_script: Mutex::new(VecDeque::new()),
            pull_script: Mutex::new(HashMap::new()),
            pushes: Mutex::new(Vec::new()),
            pulls: Mutex::new(Vec::new()),
            link_after_push: Mutex::new(None),
        })
    }

    pub async fn script_push(&self, script: PushScript) {
        self.push_script.lock().await.push_back(script);
    }

    pub async fn script_pull(&self, collection: &str, response: Result<PullResponse, NetworkError>) {
        self.pull_script
            .lock()
            .await
            .entry(collection.to_string())
            .or_default()
            .push_back(response);
    }

    pub async fn drop_link_after_push(&self, connectivity: ConnectivityHandle) {
        *self.link_after_push.lock().await = Some((connectivity, LinkChange::Drop));
    }

    pub async fn degrade_link_after_push(&self, connectivity: ConnectivityHandle, probe: Arc<LatencyProbe>) {
        *self.link_after_push.lock().await = Some((connectivity, LinkChange::Slow(probe)));
    }

    /// Local ids of every pushed item, in push order.
    pub async fn pushed_ids(&self) -> Vec<String> {
        self.pushes
            .lock()
            .await
            .iter()
            .flat_map(|p| p.items.iter().map(|i| i.local_id.clone()))
            .collect()
    }

    pub async fn push_count(&self) -> usize {
        self.pushes.lock().await.len()
    }
}

fn number(item: &PushItem) -> Option<i64> {
    item.payload.get("n").and_then(Value::as_i64)
}

#[async_trait]
impl RemotePeer for MockPeer {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, NetworkError> {
        self.pushes.lock().await.push(request.clone());
        let script = self
            .push_script
            .lock()
            .await
            .pop_front()
            .unwrap_or(PushScript::AcceptAll);

        let accept = |item: &PushItem| AcceptedItem {
            local_id: item.local_id.clone(),
            server_id: Value::from(format!("srv-{}", item.local_id)),
        };
        let result = match script {
            PushScript::AcceptAll => Ok(PushResponse {
                accepted: request.items.iter().map(accept).collect(),
                rejected: Vec::new(),
            }),
            PushScript::RejectNumbers(numbers) => {
                let mut response = PushResponse::default();
                for item in &request.items {
                    match number(item) {
                        Some(n) if numbers.contains(&n) => response.rejected.push(RejectedItem {
                            local_id: item.local_id.clone(),
                            reason: format!("item {n} invalid"),
                        }),
                        _ => response.accepted.push(accept(item)),
                    }
                }
                Ok(response)
            }
            PushScript::Ignore => Ok(PushResponse::default()),
            PushScript::Fail(e) => Err(e),
        };

        if let Some((connectivity, change)) = self.link_after_push.lock().await.take() {
            let mut rx = connectivity.watch();
            match change {
                LinkChange::Drop => {
                    connectivity.signal(NetworkSignal::Lost).await.unwrap();
                    rx.wait_for(|s| s.state == ConnectivityState::Offline).await.unwrap();
                }
                LinkChange::Slow(probe) => {
                    probe.delay_ms.store(50, Ordering::SeqCst);
                    connectivity.probe_now().await.unwrap();
                    rx.wait_for(|s| s.state == ConnectivityState::Degraded).await.unwrap();
                }
            }
        }
        result
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse, NetworkError> {
        self.pulls.lock().await.push(request.clone());
        self.pull_script
            .lock()
            .await
            .get_mut(&request.collection)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(PullResponse::default()))
    }
}

// ── Engine harness ───────────────────────────────────────────────

pub struct Harness {
    pub stores: SyncStores,
    pub peer: Arc<MockPeer>,
    pub connectivity: ConnectivityHandle,
    pub handle: SyncHandle,
    pub engine: SyncEngine,
    pub monitor_task: JoinHandle<()>,
}

pub async fn harness(config: SyncConfig, reachable: bool) -> Harness {
    let (connectivity, monitor_task) = monitor(reachable).await;
    harness_on(config, connectivity, monitor_task).await
}

/// Harness over an already running monitor.
pub async fn harness_on(config: SyncConfig, connectivity: ConnectivityHandle, monitor_task: JoinHandle<()>) -> Harness {
    let store = LocalStore::open_in_memory().unwrap();
    let stores = SyncStores::open(store, &config).await.unwrap();
    let peer = MockPeer::new();
    let (handle, engine) = create_sync_engine(
        stores.clone(),
        peer.clone(),
        Arc::new(StaticToken("session-1".into())),
        connectivity.clone(),
        config,
    );
    Harness {
        stores,
        peer,
        connectivity,
        handle,
        engine,
        monitor_task,
    }
}
