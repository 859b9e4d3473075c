//! Bounded retry for contended writes.
//!
//! Retries only errors that report write contention (a racing create or a
//! stale version); everything else propagates on the first attempt. Delays
//! grow linearly: after attempt `n` (0-based) the wait is `(n + 1) * step`.
//! Uses `backon` to drive the attempts.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, Retryable};
use serde::Deserialize;
use tracing::warn;

/// Errors that may signal transient write contention.
pub trait Contention {
    /// Whether retrying the whole operation may succeed.
    fn is_contention(&self) -> bool;
}

/// Retry limits for contended operations.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    /// Delay unit in milliseconds; the n-th retry waits `n * step_ms`.
    pub step_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            step_ms: 2000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        Duration::from_millis(self.step_ms.saturating_mul(attempt as u64 + 1))
    }

    /// Backoff yielding one delay per retry after the first attempt.
    pub fn backoff(&self) -> LinearBackoff {
        LinearBackoff {
            policy: self.clone(),
        }
    }
}

/// `backon` builder for linear delays.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    policy: RetryPolicy,
}

impl BackoffBuilder for LinearBackoff {
    type Backoff = LinearDelays;

    fn build(self) -> Self::Backoff {
        LinearDelays {
            retries: self.policy.max_attempts.saturating_sub(1),
            attempt: 0,
            policy: self.policy,
        }
    }
}

/// Iterator of linear delays, one per remaining retry.
#[derive(Debug, Clone)]
pub struct LinearDelays {
    policy: RetryPolicy,
    retries: usize,
    attempt: usize,
}

impl Iterator for LinearDelays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.retries {
            return None;
        }
        let delay = self.policy.delay_for_attempt(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}

/// Run `operation`, retrying contention errors per `policy`.
///
/// The last error propagates once attempts are exhausted.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Contention + std::fmt::Display,
{
    operation
        .retry(policy.backoff())
        .when(|e: &E| e.is_contention())
        .notify(|e: &E, delay: Duration| {
            warn!(error = %e, delay_ms = delay.as_millis() as u64, "Write contention, retrying");
        })
        .await
}
