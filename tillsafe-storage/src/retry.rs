//! Bounded retry of transiently aborted store operations.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delays between attempts, in milliseconds.
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 5] = [100, 200, 500, 1000, 2000];

/// Maximum number of attempts (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Retry policy for [`StoreError::TransientAbort`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before attempt `n + 2` is `delays_ms[n]`; the last entry repeats
    /// if the table is shorter than the attempt budget.
    pub delays_ms: Vec<u64>,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays_ms: DEFAULT_RETRY_DELAYS_MS.to_vec(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        let ms = self
            .delays_ms
            .get(idx)
            .or_else(|| self.delays_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. The last transient error is returned with
    /// its attempt count filled in.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("[STORE] {label} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(StoreError::TransientAbort { message, .. }) => {
                    if attempt >= max_attempts {
                        warn!("[STORE] {label} aborted {attempt} times, giving up: {message}");
                        return Err(StoreError::TransientAbort {
                            attempts: attempt,
                            message,
                        });
                    }
                    let delay = self.delay_after(attempt);
                    warn!(
                        "[STORE] {label} aborted (attempt {attempt}/{max_attempts}), retrying in {delay:?}: {message}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}
