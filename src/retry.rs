//! Bounded retry for individual requests.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::conn::ConnError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
        }
    }

    /// Total attempts, including the first. Never less than one.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn backoff_ms(&self) -> u64 {
        self.backoff_ms
    }

    /// Pause before attempt `attempt` (0-based). Grows linearly.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. `op` receives the 0-based attempt number.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, ConnError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ConnError>>,
    {
        self.run_if(ConnError::is_retryable, op).await
    }

    /// As [`run`](Self::run) with a custom retry classifier.
    pub async fn run_if<T, F, Fut>(
        &self,
        retryable: impl Fn(&ConnError) -> bool,
        mut op: F,
    ) -> Result<T, ConnError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ConnError>>,
    {
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                tokio::time::sleep(self.delay_for_attempt(attempt)).await;
            }
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if retryable(&e) && attempt + 1 < self.max_attempts() => {
                    debug!(attempt, "retrying after {e}");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 80)
    }
}
