//! Retry with exponential backoff and jitter, raced against cancellation.
//!
//! The wait before attempt `k + 1` (k counted from 0) is
//! `base_delay · 2^k` plus a uniform random jitter in `[0, max_jitter]`.
//! With the defaults (1 s base, 250 ms jitter, 3 attempts) a request that
//! keeps failing waits roughly 1 s then 2 s before giving up.

use crate::cancel::CancelToken;
use crate::config::ProcessorConfig;
use crate::error::{BatchError, ErrorClass};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How a retried operation ended.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success(T),
    /// Every attempt failed with a retryable error.
    PartialFailure { error: BatchError, attempts: u32 },
    /// A non-retryable error; no further attempts were made.
    FatalFailure(BatchError),
    Cancelled,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success(_))
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
    pub min_http_error_code: u16,
}

impl RetryPolicy {
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_jitter: Duration::from_millis(config.retry_max_jitter_ms),
            min_http_error_code: config.min_http_error_code,
        }
    }

    /// Backoff before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.base_delay.saturating_mul(1u32 << exp);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        base + Duration::from_millis(jitter)
    }

    /// Run `op` until it succeeds, fails fatally, runs out of attempts or
    /// `cancel` fires. `op` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancelToken, op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BatchError>>,
    {
        self.execute_notify(cancel, op, |_, _, _| {}).await
    }

    /// Like [`execute`](Self::execute), calling `on_retry(attempt, delay,
    /// &error)` before each backoff sleep.
    pub async fn execute_notify<T, F, Fut, R>(
        &self,
        cancel: &CancelToken,
        mut op: F,
        mut on_retry: R,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BatchError>>,
        R: FnMut(u32, Duration, &BatchError),
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return RetryOutcome::Cancelled;
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return RetryOutcome::Cancelled,
                r = op(attempt) => r,
            };

            let error = match result {
                Ok(value) => return RetryOutcome::Success(value),
                Err(e) if e.is_cancelled() => return RetryOutcome::Cancelled,
                Err(e) => e,
            };

            if error.class(self.min_http_error_code) == ErrorClass::Fatal {
                debug!(attempt, %error, "fatal error, not retrying");
                return RetryOutcome::FatalFailure(error);
            }
            if attempt >= self.max_attempts {
                warn!(attempts = attempt, %error, "retries exhausted");
                return RetryOutcome::PartialFailure {
                    error,
                    attempts: attempt,
                };
            }

            let delay = match &error {
                BatchError::RateLimited {
                    retry_after_secs: Some(secs),
                } => Duration::from_secs(*secs).max(self.delay_for(attempt)),
                _ => self.delay_for(attempt),
            };
            warn!(
                attempt,
                max = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "retrying after backoff"
            );
            on_retry(attempt, delay, &error);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return RetryOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
