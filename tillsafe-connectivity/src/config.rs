//! Monitor configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coarse class of the underlying network link, as reported by the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    Fast,
    Slow,
    #[default]
    Unknown,
}

/// Probe cadence for one network class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeProfile {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

/// Configuration for the connectivity monitor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Used for [`NetworkClass::Fast`] and [`NetworkClass::Unknown`].
    pub fast: ProbeProfile,

    pub slow: ProbeProfile,

    /// A probe slower than this counts as slow (milliseconds).
    pub slow_latency_threshold_ms: u64,

    /// Consecutive slow probes before Online degrades.
    pub slow_probe_count: u32,

    pub initial_network_class: NetworkClass,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            fast: ProbeProfile {
                interval_secs: 30,
                timeout_secs: 5,
            },
            slow: ProbeProfile {
                interval_secs: 60,
                timeout_secs: 15,
            },
            slow_latency_threshold_ms: 2000,
            slow_probe_count: 3,
            initial_network_class: NetworkClass::Unknown,
        }
    }
}

impl MonitorConfig {
    pub fn profile(&self, class: NetworkClass) -> &ProbeProfile {
        match class {
            NetworkClass::Slow => &self.slow,
            NetworkClass::Fast | NetworkClass::Unknown => &self.fast,
        }
    }

    pub fn probe_interval(&self, class: NetworkClass) -> Duration {
        Duration::from_secs(self.profile(class).interval_secs)
    }

    pub fn probe_timeout(&self, class: NetworkClass) -> Duration {
        Duration::from_secs(self.profile(class).timeout_secs)
    }

    pub fn slow_latency_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_latency_threshold_ms)
    }
}
