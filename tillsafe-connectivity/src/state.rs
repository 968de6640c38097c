//! Connectivity state machine.
//!
//! Pure transition table: no timers, no I/O. The async monitor feeds it
//! inputs and publishes whatever transitions come out.
//!
//! | From      | Input                                  | To        |
//! |-----------|----------------------------------------|-----------|
//! | Probing   | ProbeSucceeded                         | Online    |
//! | Probing   | ProbeFailed / ProbeTimedOut / NetworkLost | Offline |
//! | Online    | ProbeFailed / ProbeTimedOut / NetworkLost | Offline |
//! | Online    | N consecutive slow ProbeSucceeded      | Degraded  |
//! | Degraded  | ProbeSucceeded under threshold         | Online    |
//! | Degraded  | ProbeFailed / ProbeTimedOut / NetworkLost | Offline |
//! | Offline   | NetworkRestored / TimerTick            | Probing   |
//! | Offline   | ProbeSucceeded                         | Online    |
//!
//! `NetworkRestored` is only a hint: outside Offline it changes nothing, so a
//! probe timing out in Probing still ends in Offline.

use crate::config::{MonitorConfig, NetworkClass};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
    Probing,
    /// Reachable but slow.
    Degraded,
}

impl ConnectivityState {
    /// Whether the remote peer can be used at all.
    pub fn is_reachable(self) -> bool {
        matches!(self, ConnectivityState::Online | ConnectivityState::Degraded)
    }
}

/// Inputs to the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorInput {
    ProbeSucceeded { latency: Duration },
    ProbeFailed,
    ProbeTimedOut,
    NetworkLost,
    NetworkRestored,
    TimerTick,
    NetworkClassChanged(NetworkClass),
}

/// Current connectivity, as published to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivitySnapshot {
    pub state: ConnectivityState,
    pub last_transition_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub measured_latency_ms: Option<u64>,
    pub network_class: NetworkClass,
}

/// A state change produced by [`ConnectivityMachine::apply`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectivityEvent {
    pub from: ConnectivityState,
    pub to: ConnectivityState,
    pub cause: MonitorInput,
    pub at: DateTime<Utc>,
}

impl ConnectivityEvent {
    /// Event name delivered to the host.
    pub fn name(&self) -> &'static str {
        match self.to {
            ConnectivityState::Online => "connectivity:online",
            ConnectivityState::Offline => "connectivity:offline",
            ConnectivityState::Degraded => "connectivity:degraded",
            ConnectivityState::Probing => "connectivity:probing",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectivityMachine {
    snapshot: ConnectivitySnapshot,
    slow_threshold: Duration,
    slow_probe_count: u32,
    consecutive_slow: u32,
}

impl ConnectivityMachine {
    pub fn new(config: &MonitorConfig, now: DateTime<Utc>) -> Self {
        Self {
            snapshot: ConnectivitySnapshot {
                state: ConnectivityState::Probing,
                last_transition_at: now,
                consecutive_failures: 0,
                measured_latency_ms: None,
                network_class: config.initial_network_class,
            },
            slow_threshold: config.slow_latency_threshold(),
            slow_probe_count: config.slow_probe_count.max(1),
            consecutive_slow: 0,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.snapshot.state
    }

    pub fn snapshot(&self) -> &ConnectivitySnapshot {
        &self.snapshot
    }

    pub fn network_class(&self) -> NetworkClass {
        self.snapshot.network_class
    }

    /// Applies one input. Returns the transition if the state changed.
    pub fn apply(&mut self, input: MonitorInput, now: DateTime<Utc>) -> Option<ConnectivityEvent> {
        use ConnectivityState::*;

        let from = self.snapshot.state;
        let to = match input {
            MonitorInput::ProbeSucceeded { latency } => {
                self.snapshot.consecutive_failures = 0;
                self.snapshot.measured_latency_ms = Some(latency.as_millis() as u64);
                let slow = latency > self.slow_threshold;
                if slow {
                    self.consecutive_slow += 1;
                } else {
                    self.consecutive_slow = 0;
                }
                match from {
                    Probing | Offline => Online,
                    Online if self.consecutive_slow >= self.slow_probe_count => Degraded,
                    Degraded if !slow => Online,
                    other => other,
                }
            }
            MonitorInput::ProbeFailed | MonitorInput::ProbeTimedOut => {
                self.snapshot.consecutive_failures += 1;
                self.consecutive_slow = 0;
                Offline
            }
            MonitorInput::NetworkLost => {
                self.consecutive_slow = 0;
                Offline
            }
            MonitorInput::NetworkRestored | MonitorInput::TimerTick => match from {
                Offline => Probing,
                other => other,
            },
            MonitorInput::NetworkClassChanged(class) => {
                self.snapshot.network_class = class;
                from
            }
        };

        if to == from {
            return None;
        }
        self.snapshot.state = to;
        self.snapshot.last_transition_at = now;
        Some(ConnectivityEvent {
            from,
            to,
            cause: input,
            at: now,
        })
    }
}
