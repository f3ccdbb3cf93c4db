//! Exponential backoff for transport calls made by the tester.
//!
//! Only transient runner errors are retried. Permanent errors (dispatch rejected,
//! workflow not found) are returned immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::RunnerError;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,

    /// Cap for exponential growth.
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,

    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// 4 retries with 2s, 4s, 8s, 16s delays.
    pub const DEFAULT: Self = Self {
        max_retries: 4,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
    };

    /// No waiting between attempts. For tests.
    pub const IMMEDIATE: Self = Self {
        max_retries: 2,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff_multiplier: 1.0,
    };

    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Delay for the given retry attempt (0-indexed):
    /// `initial_delay * backoff_multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped_secs.max(0.0)).unwrap_or(self.max_delay)
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt))
    }

    pub fn total_max_wait(&self) -> Duration {
        self.delays().sum()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A transport call the tester could not complete. Never escapes the tester: it is
/// logged and turned into an INCONCLUSIVE verdict.
#[derive(Debug, Error)]
pub enum AdapterTransportError {
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        last_error: RunnerError,
    },

    #[error("{operation} was rejected: {error}")]
    Rejected {
        operation: &'static str,
        error: RunnerError,
    },

    #[error("{operation} was cancelled")]
    Cancelled { operation: &'static str },
}

/// Scale a delay by a random factor in `[0.9, 1.1]` so parallel pollers spread out.
pub fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor: f64 = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
}

/// Run `op` until it succeeds, fails permanently, exhausts `config`, or `cancel` fires
/// during a backoff sleep.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &'static str,
    cancel: Option<&CancellationToken>,
    mut op: F,
) -> Result<T, AdapterTransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RunnerError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_transient() => {
                return Err(AdapterTransportError::Rejected { operation, error });
            }
            Err(error) if attempt >= config.max_retries => {
                return Err(AdapterTransportError::Exhausted {
                    operation,
                    attempts: attempt + 1,
                    last_error: error,
                });
            }
            Err(error) => {
                let delay = jittered(config.delay_for_attempt(attempt));
                warn!(operation, attempt = attempt + 1, ?delay, %error, "transient error, retrying");
                attempt += 1;

                match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = token.cancelled() => {
                                debug!(operation, "retry cancelled");
                                return Err(AdapterTransportError::Cancelled { operation });
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
        }
    }
}

/// Serde adapter storing a `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
