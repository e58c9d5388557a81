//! Backoff and retry utilities.
//!
//! One policy type serves both the REST dispatcher (a small bounded number of
//! attempts) and the gateway reconnect loop (unbounded attempts with a wider
//! cap). Delays grow exponentially from `initial_backoff`, are capped at
//! `max_backoff`, and are then spread by a proportional jitter.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth, before jitter.
    pub max_backoff: Duration,
    /// Fraction of the delay applied as symmetric jitter (`0.2` means ±20%).
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    /// Bounded policy for REST requests: the first attempt plus three retries.
    pub fn rest() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            jitter_ratio: 0.2,
        }
    }

    /// Unbounded policy for gateway reconnects: base 1s, cap 30s, ±20%.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter_ratio: 0.2,
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based: attempt `1` yields roughly `initial_backoff`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        apply_jitter(self.base_delay(attempt), self.jitter_ratio, attempt)
    }

    /// The capped exponential delay for `attempt` without jitter.
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff.min(self.max_backoff);
        for _ in 1..attempt {
            if delay >= self.max_backoff {
                break;
            }
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::rest()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number. `should_retry` decides whether a
/// given error is worth another attempt; non-retryable errors and the error of
/// the last permitted attempt are returned as-is.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

fn apply_jitter(delay: Duration, ratio: f64, attempt: usize) -> Duration {
    if delay.is_zero() || !ratio.is_finite() || ratio <= 0.0 {
        return delay;
    }

    let ratio = ratio.min(1.0);
    // Maps the mixed seed onto [-1.0, 1.0].
    let unit = (jitter_seed(attempt) % 2001) as f64 / 1000.0 - 1.0;
    let factor = 1.0 + ratio * unit;
    delay.mul_f64(factor.max(0.0))
}

fn jitter_seed(attempt: usize) -> u64 {
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    now_nanos ^ (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
