//! Network reachability monitor for tillsafe.
//!
//! The monitor owns an explicit state machine (Online, Offline, Probing,
//! Degraded) driven by periodic probes against the remote peer and by
//! lower-level network signals from the host. Current state is published on
//! a `watch` channel; every transition is broadcast as a
//! [`ConnectivityEvent`].
//!
//! Probe cadence follows the network class: 30 s interval / 5 s timeout on
//! fast or unknown links, 60 s / 15 s on slow ones.

pub mod config;
mod error;
mod monitor;
mod sink;
pub mod state;

pub use config::{MonitorConfig, NetworkClass, ProbeProfile};
pub use error::{ConnectivityError, ConnectivityResult};
pub use monitor::{
    create_connectivity_monitor, ConnectivityHandle, ConnectivityMonitor, NetworkSignal,
    ReachabilityProbe,
};
pub use sink::{SnapshotSink, SNAPSHOT_COLLECTION};
pub use state::{
    ConnectivityEvent, ConnectivityMachine, ConnectivitySnapshot, ConnectivityState, MonitorInput,
};
