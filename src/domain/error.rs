use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for acknowledgments and follow-up deliveries.
///
/// Duplicate actions are not represented here: they short-circuit through
/// the idempotency guard as ordinary control flow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("deadline exceeded during {stage}")]
    DeadlineExceeded { stage: &'static str },
    #[error("rate limited (global: {global}, retry after: {retry_after:?})")]
    RateLimited {
        retry_after: Option<Duration>,
        global: bool,
    },
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("permanent delivery failure (status {status:?}): {message}")]
    Permanent { status: Option<u16>, message: String },
}

impl DeliveryError {
    pub fn deadline(stage: &'static str) -> Self {
        Self::DeadlineExceeded { stage }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Permanent {
            status,
            message: message.into(),
        }
    }

    /// Rate limits and server-class failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::RateLimited { .. } | DeliveryError::Transient(_)
        )
    }

    /// Explicit wait requested by the platform, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_deadline(&self) -> bool {
        matches!(self, DeliveryError::DeadlineExceeded { .. })
    }
}
