use std::future::Future;
use std::time::Duration;

use tracing::warn;

use vendflow_core::config::RetryConfig;
use vendflow_core::error::TaskError;

/// Bounded exponential backoff for stages wrapping external calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Retries without sleeping in between. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::none()
        }
    }

    /// Delay before the attempt following failed attempt number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let ms = base.min(self.max_backoff.as_millis() as f64);
        let ms = if self.jitter {
            // Add jitter: 0.8x to 1.2x
            ms * (0.8 + rand::random::<f64>() * 0.4)
        } else {
            ms
        };
        Duration::from_millis(ms as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

/// Outcome of a retried call: the final result and how many attempts it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, TaskError>,
    pub attempts: u32,
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted. `on_retry` observes each retried failure.
pub async fn with_retry<T, F, Fut, R>(
    policy: &RetryPolicy,
    mut call: F,
    mut on_retry: R,
) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TaskError>>,
    R: FnMut(u32, &TaskError),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt + 1,
                }
            }
            Err(e) => {
                if e.is_retryable() && attempt + 1 < max_attempts {
                    let backoff = policy.backoff(attempt);
                    warn!(
                        task = %e.task,
                        attempt = attempt + 1,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying task"
                    );
                    on_retry(attempt + 1, &e);
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                    attempt += 1;
                    continue;
                }
                return Retried {
                    result: Err(e),
                    attempts: attempt + 1,
                };
            }
        }
    }
}
