//! Guard around external calls
//!
//! Model requests and capability discovery go through [`CallGuard::call`];
//! capability invocations use [`CallGuard::call_when`] with a narrower retry
//! rule. Both apply a per-attempt timeout with exponential backoff between
//! attempts and return promptly when the run is cancelled.

use crate::error::PipelineError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Upper bound of any delay
    pub max_backoff: Duration,
    /// Growth factor between delays
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Create policy
    #[inline]
    #[must_use]
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
            multiplier: 2.0,
        }
    }

    /// Single attempt, no retry
    #[inline]
    #[must_use]
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before attempt `failed_attempt + 1`
    #[must_use]
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exponent = i32::try_from(failed_attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(8))
    }
}

/// Timeout + retry + cancellation decorator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallGuard {
    timeout: Duration,
    retry: RetryPolicy,
}

impl CallGuard {
    #[inline]
    #[must_use]
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Self {
        Self { timeout, retry }
    }

    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[inline]
    #[must_use]
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `op` under the guard
    ///
    /// `op` receives the 1-based attempt number. Non-retryable errors are
    /// returned immediately; retryable ones are retried until the attempt
    /// budget is spent.
    ///
    /// # Errors
    /// The last error of `op`, `PipelineError::Timeout` when the final
    /// attempt timed out, or `PipelineError::Cancelled`.
    pub async fn call<T, F, Fut>(
        &self,
        target: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        self.call_when(target, cancel, PipelineError::is_retryable, op)
            .await
    }

    /// Run `op` under the guard, retrying only errors accepted by `retry_if`
    ///
    /// Timeouts are passed to `retry_if` like any other error, so calls with
    /// side effects can refuse to repeat an attempt that may have landed.
    ///
    /// # Errors
    /// Same as [`CallGuard::call`].
    pub async fn call_when<T, F, Fut, R>(
        &self,
        target: &str,
        cancel: &CancellationToken,
        retry_if: R,
        mut op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
        R: Fn(&PipelineError) -> bool,
    {
        let mut attempt = 1;
        loop {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PipelineError::Cancelled),
                result = tokio::time::timeout(self.timeout, op(attempt)) => result,
            };

            let error = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => PipelineError::Timeout {
                    target: target.to_string(),
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                },
            };

            if !retry_if(&error) || attempt >= self.retry.max_attempts {
                return Err(error);
            }

            let delay = self.retry.backoff_for(attempt);
            tracing::warn!(
                target_call = target,
                attempt,
                max_attempts = self.retry.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "external call failed, retrying"
            );
            metrics::counter!("scenecraft_call_retries_total", "target" => target.to_string())
                .increment(1);

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PipelineError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

impl Default for CallGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(600), RetryPolicy::default())
    }
}
