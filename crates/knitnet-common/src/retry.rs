//! Retry utilities with exponential backoff and jitter.
//!
//! Two shapes are provided:
//!
//! - [`retry_with_backoff`] / [`retry_with_backoff_if`] re-run a fallible
//!   operation until it succeeds or the attempt budget runs out. The ledger
//!   commit path uses the filtered variant so only stale-version conflicts
//!   are retried.
//! - [`wait_with_backoff`] polls a condition a fixed number of times with a
//!   growing, jittered delay and fails with [`Error::Timeout`]. This is the
//!   shape used while waiting for a cluster credential or a node patch.
//!
//! # Example
//!
//! ```ignore
//! use knitnet_common::retry::{wait_with_backoff, Backoff};
//!
//! let token = wait_with_backoff(&Backoff::credential_wait(), "credential", || async {
//!     source.fetch("cluster-east").await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Budget for optimistic-concurrency conflicts on a shared object.
    ///
    /// Short delays: a conflict means another writer just finished, so the
    /// next read is very likely to be fresh.
    pub fn on_conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries every error until success or until `max_attempts` is exhausted,
/// in which case the last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, |_| true, operation).await
}

/// Like [`retry_with_backoff`], but only errors accepted by `should_retry`
/// are retried. Any other error is returned immediately.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jittered_delay = jittered(delay, 0.5..1.5);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Bounded exponential backoff for polling loops.
///
/// The condition is polled `steps` times. Between polls the caller sleeps
/// `duration * (1 + r)` with `r` drawn from `[0, jitter)`, after which
/// `duration` grows by `factor` up to `cap`.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Number of polls before giving up
    pub steps: u32,
    /// Base delay before the second poll
    pub duration: Duration,
    /// Growth factor applied to the base delay after each poll
    pub factor: f64,
    /// Random extra fraction of the base delay added to each sleep
    pub jitter: f64,
    /// Ceiling for the base delay
    pub cap: Duration,
}

impl Backoff {
    /// Waiting for a broker-issued cluster credential (roughly two minutes).
    pub fn credential_wait() -> Self {
        Self {
            steps: 10,
            duration: Duration::from_secs(5),
            factor: 1.2,
            jitter: 1.0,
            cap: Duration::from_secs(60),
        }
    }

    /// Retrying a node label patch that races with the kubelet.
    pub fn node_label() -> Self {
        Self {
            steps: 10,
            duration: Duration::from_secs(1),
            factor: 1.2,
            jitter: 1.0,
            cap: Duration::from_secs(10),
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        Duration::from_secs_f64((current.as_secs_f64() * self.factor).min(self.cap.as_secs_f64()))
    }
}

/// Poll `condition` under `backoff` until it yields a value.
///
/// `Ok(None)` means "not yet" and is polled again; `Err` aborts the wait
/// immediately. Running out of steps fails with [`Error::Timeout`].
pub async fn wait_with_backoff<F, Fut, T>(
    backoff: &Backoff,
    operation_name: &str,
    mut condition: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let steps = backoff.steps.max(1);
    let mut delay = backoff.duration;

    for attempt in 1..=steps {
        if let Some(value) = condition().await? {
            debug!(operation = %operation_name, attempt, "Condition satisfied");
            return Ok(value);
        }
        if attempt == steps {
            break;
        }

        let sleep_for = jittered(delay, 1.0..1.0 + backoff.jitter);
        debug!(
            operation = %operation_name,
            attempt,
            delay_ms = sleep_for.as_millis(),
            "Condition not yet satisfied, waiting"
        );
        tokio::time::sleep(sleep_for).await;
        delay = backoff.next_delay(delay);
    }

    warn!(operation = %operation_name, attempts = steps, "Gave up waiting");
    Err(Error::Timeout {
        operation: operation_name.to_string(),
        attempts: steps,
    })
}

fn jittered(delay: Duration, range: std::ops::Range<f64>) -> Duration {
    let factor = if range.is_empty() {
        range.start
    } else {
        rand::thread_rng().gen_range(range)
    };
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
