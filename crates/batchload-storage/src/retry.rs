use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::{RetryDisposition, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Constant,
    Exponential,
}

/// How long to wait between attempts on transient store errors, and for how long.
///
/// The default waits a constant five seconds and never gives up: the usual
/// cause is too many concurrent connections, which clears on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts including the first. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unlimited(Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn unlimited(delay: Duration) -> Self {
        Self {
            backoff: Backoff::Constant,
            base_delay: delay,
            max_delay: delay,
            max_attempts: None,
        }
    }

    pub fn bounded_exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential,
            base_delay,
            max_delay,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        match self.backoff {
            Backoff::Constant => self.base_delay,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }

    /// Whether another attempt is allowed after `attempts_made` failures.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts_made < max)
    }
}

/// Run `op` until it stops failing with a transient error.
///
/// Only [`RetryDisposition::Retryable`] errors are retried; everything else is
/// returned to the caller on first occurrence.
pub async fn try_until_allowed<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempts = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.disposition() == RetryDisposition::Retryable => {
                attempts += 1;
                if !policy.allows_another(attempts) {
                    return Err(StoreError::ExhaustedRetries {
                        operation,
                        attempts,
                        last: Box::new(err),
                    });
                }
                let delay = policy.delay_for_attempt(attempts as usize - 1);
                warn!(
                    operation,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "waiting on transient error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
