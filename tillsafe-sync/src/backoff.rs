//! Exponential backoff scaled by network quality.
//!
//! `delay = min(max, base * 2^attempts * quality * jitter)` where quality is
//! 0.5 on a good link, 1.0 on a fair one and 2.0 on a poor one, and jitter
//! is drawn uniformly from `[jitter_min, jitter_max]`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Network quality derived from measured round-trip latency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    pub fn multiplier(self) -> f64 {
        match self {
            NetworkQuality::Good => 0.5,
            NetworkQuality::Fair => 1.0,
            NetworkQuality::Poor => 2.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_min: f64,
    pub jitter_max: f64,
    /// Latency below this is a good link.
    pub good_latency_ms: u64,
    /// Latency above this is a poor link.
    pub poor_latency_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 3_600_000,
            jitter_min: 0.8,
            jitter_max: 1.2,
            good_latency_ms: 300,
            poor_latency_ms: 2_000,
        }
    }
}

impl BackoffConfig {
    /// Unknown latency counts as fair.
    pub fn quality_for(&self, latency_ms: Option<u64>) -> NetworkQuality {
        match latency_ms {
            Some(ms) if ms < self.good_latency_ms => NetworkQuality::Good,
            Some(ms) if ms > self.poor_latency_ms => NetworkQuality::Poor,
            _ => NetworkQuality::Fair,
        }
    }

    /// Delay for a given attempt count and jitter factor.
    pub fn delay_for(&self, attempts: u32, quality: NetworkQuality, jitter: f64) -> Duration {
        let exp = 2f64.powi(attempts.min(62) as i32);
        let raw = self.base_delay_ms as f64 * exp * quality.multiplier() * jitter;
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Failure counter for the sync loop.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn on_failure(&mut self, latency_ms: Option<u64>) -> Duration {
        let quality = self.config.quality_for(latency_ms);
        let (lo, hi) = (self.config.jitter_min, self.config.jitter_max);
        let jitter = if hi > lo {
            rand::thread_rng().gen_range(lo..=hi)
        } else {
            lo
        };
        let delay = self.config.delay_for(self.attempts, quality, jitter);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn on_success(&mut self) {
        self.attempts = 0;
    }
}
