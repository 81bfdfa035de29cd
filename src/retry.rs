//! Retry utilities with exponential backoff and jitter.
//!
//! Every remote call the orchestrator makes goes through this module: a
//! per-attempt timeout from [`with_timeout`], and bounded retries from
//! [`retry_with_backoff`]. Errors that [`Retryable`] classifies as
//! non-retryable (authorization failures, malformed requests) are returned
//! on the first attempt.
//!
//! # Example
//!
//! ```ignore
//! use dormant::retry::{retry_with_backoff, with_timeout, RetryConfig};
//!
//! let deployment = retry_with_backoff(&RetryConfig::default(), "get_workload", || {
//!     with_timeout(call_timeout, "get_workload", access.get_workload(&workload))
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use crate::error::Retryable;
use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    #[serde(rename = "initialDelayMs", with = "millis")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(rename = "maxDelayMs", with = "millis")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
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

    /// Delay schedule for this config
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_delay, self.max_delay, self.backoff_multiplier)
    }
}

/// Jittered exponential delay schedule.
///
/// Each call to `next` yields the current delay scaled by a 0.5x-1.5x
/// jitter, then grows the base delay by the multiplier up to the cap.
#[derive(Clone, Debug)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Create a schedule starting at `initial` and capped at `max`
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            delay: initial,
            max_delay: max,
            multiplier,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);

        // A multiplier that yields a negative or non-finite delay pins to the cap.
        self.delay = Duration::try_from_secs_f64(self.delay.as_secs_f64() * self.multiplier)
            .map_or(self.max_delay, |d| d.min(self.max_delay));

        Some(jittered)
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries up to `max_attempts` (0 = forever) while the error is retryable.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
///
/// # Returns
/// The result of the operation, or the last error if retries are exhausted or
/// the error is not retryable.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
{
    let mut attempt = 0u32;
    let mut backoff = config.backoff();

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed with non-retryable error"
                );
                return Err(e);
            }
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

                let delay = backoff.next().unwrap_or(config.max_delay);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Run a remote call with a deadline, mapping expiry to a retryable timeout error
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    operation_name: &str,
    fut: Fut,
) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "{} did not complete within {:?}",
            operation_name, timeout
        ))),
    }
}

/// Poll until a condition is met or timeout is reached
///
/// Repeatedly calls `check_fn` at a fixed interval until it returns
/// `Ok(true)`. Fatal errors stop polling immediately; other errors are
/// treated as "not yet".
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = std::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("Polling condition not yet met, retrying..."),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => trace!("Polling check returned error (retrying): {}", e),
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(Error::timeout(timeout_msg));
        }

        tokio::time::sleep(poll_interval.min(timeout - elapsed)).await;
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
