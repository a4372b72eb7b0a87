//! Bounded exponential backoff around a single outbound attempt.

use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::domain::error::DeliveryError;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: NonZeroU32,
    pub base_delay: Duration,
    /// Upper bound for computed backoff. Explicit retry-after values are not capped.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: NonZeroU32::new(DEFAULT_MAX_ATTEMPTS).unwrap_or(NonZeroU32::MIN),
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed `attempt` (1-based): `base * 2^(attempt - 1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: DeliveryError },
    #[error(transparent)]
    Fatal(DeliveryError),
    #[error("deadline reached after {attempts} attempts: {last}")]
    DeadlineExceeded { attempts: u32, last: DeliveryError },
}

impl RetryError {
    /// Collapse into the delivery taxonomy for reporting.
    pub fn into_delivery_error(self) -> DeliveryError {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal(error) => error,
            RetryError::DeadlineExceeded { .. } => DeliveryError::deadline("retry"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails for good, or runs out of attempts.
    ///
    /// `op` receives the 1-based attempt number. A retry whose sleep would end
    /// at or after `deadline` is not started.
    pub async fn execute<T, F, Fut>(
        &self,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DeliveryError>>,
    {
        let max_attempts = self.policy.max_attempts.get();
        let mut attempt = 1;

        loop {
            let error = match op(attempt).await {
                Ok(value) => {
                    counter!("courier_retry_attempt_total", "outcome" => "success").increment(1);
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                counter!("courier_retry_attempt_total", "outcome" => "fatal").increment(1);
                return Err(RetryError::Fatal(error));
            }

            if attempt >= max_attempts {
                counter!("courier_retry_attempt_total", "outcome" => "exhausted").increment(1);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = error
                .retry_after()
                .unwrap_or_else(|| self.policy.backoff(attempt));

            if deadline.is_some_and(|deadline| Instant::now() + delay >= deadline) {
                counter!("courier_retry_attempt_total", "outcome" => "deadline").increment(1);
                return Err(RetryError::DeadlineExceeded {
                    attempts: attempt,
                    last: error,
                });
            }

            counter!("courier_retry_attempt_total", "outcome" => "retry").increment(1);
            debug!(
                target = "courier::retry",
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after retryable failure"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }
}
