//! Retry and polling policies for provider calls.
//!
//! Transient failures are retried with exponential backoff; a rate limit's
//! `retry_after` is a floor on the next delay. Pending operations are polled
//! with a growing interval until they finish or the poll timeout elapses.
//! Every sleep observes the run's cancellation token.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::ProviderError;

use super::types::{Completion, PendingOperation, Provider, ProviderResult, ProvisionedResource};

/// Exponential backoff for retryable provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first call included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Growth factor between retries.
    pub multiplier: f64,
}

/// Polling schedule for pending operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Delay before the first poll.
    pub initial_interval: Duration,
    /// Upper bound on the poll interval.
    pub max_interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Sets the number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the initial and maximum delay.
    #[must_use]
    pub const fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay = self.initial_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay)
    }

    /// Delay before retrying after `error`.
    #[must_use]
    pub fn delay_for(&self, retry: u32, error: &ProviderError) -> Duration {
        let backoff = self.backoff(retry);
        match error.retry_delay_secs() {
            Some(secs) => backoff.max(Duration::from_secs(secs)),
            None => backoff,
        }
    }

    /// Runs `call` until it succeeds, fails permanently or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the last error, or [`ProviderError::Cancelled`] if `cancel`
    /// fires during a backoff.
    pub async fn run<T, F, Fut>(&self, what: &str, cancel: &CancelToken, mut call: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.delay_for(attempt, &e);
                    warn!("{what} failed (attempt {attempt}/{attempts}), retrying in {delay:?}: {e}");
                    sleep_or_cancel(delay, cancel, what).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl PollPolicy {
    /// Sets the intervals and timeout.
    #[must_use]
    pub const fn new(initial_interval: Duration, max_interval: Duration, timeout: Duration) -> Self {
        Self {
            initial_interval,
            max_interval,
            timeout,
        }
    }

    /// Polls `operation` until it finishes.
    ///
    /// Each poll is itself retried under `retry`.
    ///
    /// # Errors
    ///
    /// - [`ProviderError::Timeout`] when the operation outlives the timeout
    /// - [`ProviderError::Cancelled`] when `cancel` fires
    /// - any non-retryable error returned by the provider
    pub async fn wait(
        &self,
        provider: &dyn Provider,
        retry: &RetryPolicy,
        mut operation: PendingOperation,
        cancel: &CancelToken,
    ) -> ProviderResult<Option<ProvisionedResource>> {
        let started = Instant::now();
        let mut interval = self.initial_interval;
        let label = operation
            .provider_id
            .clone()
            .unwrap_or_else(|| operation.token.clone());

        loop {
            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                return Err(ProviderError::Timeout {
                    provider_id: label,
                    waited_secs: elapsed.as_secs(),
                });
            }

            sleep_or_cancel(interval.min(self.timeout - elapsed), cancel, &label).await?;

            let current = operation.clone();
            match retry
                .run(&format!("poll {label}"), cancel, || provider.poll(&current))
                .await?
            {
                Completion::Done(result) => {
                    debug!("Operation {} completed after {:?}", current.token, started.elapsed());
                    return Ok(result);
                }
                Completion::Pending(next) => {
                    debug!("Operation {} still pending", next.token);
                    operation = next;
                }
            }

            interval = (interval * 2).min(self.max_interval.max(self.initial_interval));
        }
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancelToken, what: &str) -> ProviderResult<()> {
    if cancel.is_cancelled() {
        return Err(ProviderError::Cancelled {
            provider_id: what.to_string(),
        });
    }
    tokio::select! {
        () = tokio::time::sleep(delay) => Ok(()),
        () = cancel.cancelled() => Err(ProviderError::Cancelled {
            provider_id: what.to_string(),
        }),
    }
}
