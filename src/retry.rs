//! bounded retry with exponential backoff and jitter
//!
//! only errors classified retryable by [`Error::is_retryable`] consume
//! retry budget; everything else surfaces immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::Result;

/// retry policy for network-bound operations
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// total attempts, including the first
    pub max_attempts: u32,
    /// delay before the first retry; doubles each attempt
    pub base_delay: Duration,
    /// hard cap on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// a policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// delay before retrying after `attempt` failures (0-based), jittered
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX));
        let capped = exp.min(self.max_delay);
        // uniform jitter in [0.5, 1.5) avoids synchronized retry storms
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        capped.mul_f64(factor).min(self.max_delay)
    }
}

/// run `op` until it succeeds, a non-retryable error occurs, or the
/// attempt budget is exhausted
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(attempt, ?delay, error = %e, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
