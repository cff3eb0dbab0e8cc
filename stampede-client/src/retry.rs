//! Bounded retry with exponential backoff for coordinator RPCs.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Errors that may be retried.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

/// Retry budget for one RPC kind.
#[derive(Debug, Clone)]
pub struct RpcRetryPolicy {
    /// Attempts including the first try (minimum 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0) applied to each delay.
    pub jitter: f64,
}

impl Default for RpcRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RpcRetryPolicy {
    pub fn from_millis(max_attempts: u32, base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter: 0.2,
        }
    }

    /// Delay before the retry following `attempt` (1-based), doubled per
    /// attempt, capped, jittered.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let multiplier = 2_u64.saturating_pow(exponent) as f64;
        let capped = (self.base_delay.as_secs_f64() * multiplier)
            .min(self.max_delay.as_secs_f64().max(0.0));
        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let swing = (fastrand::f64() * 2.0 - 1.0) * self.jitter;
            (capped * (1.0 + swing)).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}

/// Run `op`, retrying retryable failures until the policy's attempt
/// budget is spent.
pub async fn run_with_retry<F, Fut, T, E>(
    rpc: &str,
    policy: &RpcRetryPolicy,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let budget = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < budget => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    rpc,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "coordinator rpc failed, retrying: {err}"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                debug!(rpc, attempt, "coordinator rpc failed terminally: {err}");
                return Err(err);
            }
        }
    }
}
