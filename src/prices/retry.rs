//! Retry policy and a generic "attempt with policy" helper.
//!
//! The helper never logs; callers inspect the returned attempt count and
//! error and decide what to report.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;

/// How long to wait before each retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// The n-th retry waits `n × step`.
    Linear(Duration),
    Fixed(Duration),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Per-attempt timeout; an attempt that exceeds it counts as failed.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn linear(max_attempts: u32, step: Duration, timeout: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear(step),
            timeout,
        }
    }

    /// Single attempt, no waiting.
    pub fn once(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            timeout,
        }
    }

    /// Delay before the given retry (1 = first retry).
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Linear(step) => step * retry,
            Backoff::Fixed(d) => d,
            Backoff::None => Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(3, Duration::from_secs(1), Duration::from_secs(8))
    }
}

/// Result of running an operation under a policy.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    /// Attempts actually made, first one included.
    pub attempts: u32,
}

impl<T> Attempted<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted.
/// `op` receives the 1-based attempt number.
pub async fn attempt_with_policy<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            let delay = policy.delay_before_retry(attempt - 1);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        match tokio::time::timeout(policy.timeout, op(attempt)).await {
            Ok(Ok(value)) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Ok(Err(e)) => last_error = Some(e),
            Err(_) => last_error = Some(anyhow!("timed out after {}ms", policy.timeout.as_millis())),
        }
    }

    Attempted {
        result: Err(last_error.unwrap_or_else(|| anyhow!("no attempts made"))),
        attempts: max_attempts,
    }
}
