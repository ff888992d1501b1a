//! Bounded retry with exponential backoff for contact store requests.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

/// Retry policy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Creates a fixed-interval policy.
    pub fn fixed(max_attempts: usize, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: interval,
            max_backoff: interval,
            multiplier: 1.0,
        }
    }

    /// Creates a policy that never retries.
    pub fn none() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    /// Delay to wait before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);

        // Overflow and non-finite growth saturate at the cap.
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Returns `true` if another attempt may follow attempt `attempt` (0-based).
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_multiplier() -> f64 {
    2.0
}

/// Runs `op` until it succeeds, fails with an error `retryable` rejects, or
/// the policy is exhausted. `on_error` sees every failed attempt (0-based).
///
/// Returns the last error when giving up.
pub async fn with_retry<F, Fut, T, E, R, H>(
    policy: &RetryPolicy,
    retryable: R,
    mut on_error: H,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    H: FnMut(usize, &E),
{
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                on_error(attempt, &e);
                if !retryable(&e) || !policy.should_retry(attempt) {
                    return Err(e);
                }

                attempt += 1;
                let delay = policy.delay_for_attempt(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
