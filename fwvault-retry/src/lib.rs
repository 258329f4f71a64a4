//! Unified retry and backoff logic for fwvault
//!
//! This crate provides the retry policy shared by the execution engine
//! (device transport calls) and the artifact store (publish retries).
//! Callers classify their own errors through [`RetryableError`]; the loop
//! only decides whether to sleep and try again.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::Future;
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Terminal outcome of a retried operation that never succeeded
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("Operation '{operation}' exhausted {attempts} attempts: {source}")]
    Exhausted {
        operation: &'static str,
        attempts: usize,
        source: E,
    },
    #[error("Permanent error in '{operation}' on attempt {attempts}: {source}")]
    Permanent {
        operation: &'static str,
        attempts: usize,
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up
    pub fn attempts(&self) -> usize {
        match self {
            Self::Exhausted { attempts, .. } | Self::Permanent { attempts, .. } => *attempts,
        }
    }

    /// The error returned by the last attempt
    pub fn last_error(&self) -> &E {
        match self {
            Self::Exhausted { source, .. } | Self::Permanent { source, .. } => source,
        }
    }

    pub fn into_last_error(self) -> E {
        match self {
            Self::Exhausted { source, .. } | Self::Permanent { source, .. } => source,
        }
    }
}

/// Successful result together with the attempt that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: usize,
}

/// Result type for retry operations
pub type RetryResult<T, E> = std::result::Result<Retried<T>, RetryError<E>>;

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Attempt cap plus exponential delay shape
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one. Zero is treated as one.
    pub max_attempts: usize,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Jitter applied to each delay (0.0 disables it)
    pub randomization_factor: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.randomization_factor = 0.0;
        self
    }

    /// Build the delay generator for one retry sequence
    ///
    /// The attempt cap bounds the sequence, so no elapsed-time limit is set.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_elapsed_time(None)
            .build()
    }

    fn attempt_cap(&self) -> usize {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        default_backoff_policy()
    }
}

/// Default backoff policy for general operations
pub fn default_backoff_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(5),
        multiplier: 2.0,
        randomization_factor: 0.1,
    }
}

/// Backoff policy for device transport calls (slow links, busy management planes)
pub fn transport_backoff_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(60),
        multiplier: 2.0,
        randomization_factor: 0.2,
    }
}

/// Backoff policy for artifact storage writes: one retry, short delay
pub fn storage_backoff_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_secs(1),
        multiplier: 2.0,
        randomization_factor: 0.0,
    }
}

/// Execute an operation with the given policy
pub async fn with_backoff<F, Fut, T, E>(
    op_name: &'static str,
    policy: &RetryPolicy,
    f: F,
) -> RetryResult<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Display,
{
    with_backoff_notify(op_name, policy, f, |_, _, _| {}).await
}

/// Execute an operation with the given policy, calling `notify` before each delay
///
/// `notify` receives the failed attempt number, its error and the delay about
/// to be slept.
pub async fn with_backoff_notify<F, Fut, T, E, N>(
    op_name: &'static str,
    policy: &RetryPolicy,
    mut f: F,
    mut notify: N,
) -> RetryResult<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Display,
    N: FnMut(usize, &E, Duration),
{
    let cap = policy.attempt_cap();
    let mut delays = policy.backoff();
    let mut attempt = 1;

    loop {
        debug!("Attempting operation '{}' (attempt {})", op_name, attempt);

        match f(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        "Operation '{}' succeeded after {} attempts",
                        op_name, attempt
                    );
                }
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(err) if err.is_permanent() => {
                warn!(
                    "Operation '{}' failed permanently on attempt {}: {}",
                    op_name, attempt, err
                );
                return Err(RetryError::Permanent {
                    operation: op_name,
                    attempts: attempt,
                    source: err,
                });
            }
            Err(err) => {
                if attempt >= cap {
                    warn!(
                        "Operation '{}' gave up after {} attempts: {}",
                        op_name, attempt, err
                    );
                    return Err(RetryError::Exhausted {
                        operation: op_name,
                        attempts: attempt,
                        source: err,
                    });
                }

                let delay = delays.next_backoff().unwrap_or(policy.max_interval);
                warn!(
                    "Operation '{}' failed on attempt {}, retrying in {:?}: {}",
                    op_name, attempt, delay, err
                );
                notify(attempt, &err, delay);

                #[cfg(feature = "async-rt")]
                tokio::time::sleep(delay).await;

                #[cfg(not(feature = "async-rt"))]
                std::thread::sleep(delay);

                attempt += 1;
            }
        }
    }
}
