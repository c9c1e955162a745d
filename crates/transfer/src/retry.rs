//! Bounded retry with a fixed backoff.
//!
//! Only errors that report themselves as [`Transient`] are retried. Any
//! other error ends the call on the attempt that produced it.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Classifies an error as temporary (worth retrying) or permanent.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Retry policy for a single remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Values below 1 act as 1.
    pub max_attempts: u32,
    /// Fixed wait between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

/// Why a retried call gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// Every attempt failed with a transient error.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        source: E,
    },

    /// A permanent error; no further attempts were made.
    #[error("{operation} failed on attempt {attempt}: {source}")]
    Fatal {
        operation: String,
        attempt: u32,
        source: E,
    },

    /// Cancelled while waiting to retry.
    #[error("{operation} cancelled after {attempt} attempts")]
    Cancelled { operation: String, attempt: u32 },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Fatal { attempt, .. } | RetryError::Cancelled { attempt, .. } => *attempt,
        }
    }

    /// The last underlying error, if any.
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Fatal { source, .. } => Some(source),
            RetryError::Cancelled { .. } => None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempt budget
    /// is spent.
    ///
    /// `op` is invoked afresh for every attempt, so it must rebuild the
    /// request from state it does not mutate.
    pub async fn call<T, E, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + Transient + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(RetryError::Fatal {
                    operation: operation.to_string(),
                    attempt,
                    source: err,
                });
            }

            if attempt >= max_attempts {
                warn!(operation, attempts = attempt, error = %err, "retries exhausted");
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }

            warn!(
                operation,
                attempt,
                max_attempts,
                delay_ms = self.delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        operation: operation.to_string(),
                        attempt,
                    });
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
    }
}
