//! Failure reporting for actions that could not be serviced in full.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::error;

use crate::domain::error::DeliveryError;
use crate::domain::tokens::TokenState;
use crate::domain::types::{ActionId, DeliveryKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    Acknowledge,
    Handler,
    Finalize,
    Append,
    SoftDeadline,
    Cancelled,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureStage::Acknowledge => "acknowledge",
            FailureStage::Handler => "handler",
            FailureStage::Finalize => "finalize",
            FailureStage::Append => "append",
            FailureStage::SoftDeadline => "soft_deadline",
            FailureStage::Cancelled => "cancelled",
        }
    }
}

impl From<DeliveryKind> for FailureStage {
    fn from(kind: DeliveryKind) -> Self {
        match kind {
            DeliveryKind::Finalize => FailureStage::Finalize,
            DeliveryKind::Append => FailureStage::Append,
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureCause {
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("cancelled")]
    Cancelled,
}

impl FailureCause {
    /// Whether the action ran out of time (or was cut short) rather than failing outright.
    pub fn is_expiry(&self) -> bool {
        match self {
            FailureCause::Delivery(error) => error.is_deadline(),
            FailureCause::Cancelled => true,
            FailureCause::Handler(_) => false,
        }
    }
}

/// Everything needed to tell which stage of an action overran or failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub action_id: ActionId,
    pub stage: FailureStage,
    pub last_state: TokenState,
    pub elapsed: Duration,
    pub cause: FailureCause,
    /// Deliveries dropped before the action ended.
    pub dropped: u32,
}

pub trait FailureSink: Send + Sync {
    fn report(&self, report: FailureReport);
}

/// Default sink: one ERROR event per report.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFailureSink;

impl FailureSink for TracingFailureSink {
    fn report(&self, report: FailureReport) {
        error!(
            target = "courier::failures",
            action_id = %report.action_id,
            stage = report.stage.as_str(),
            state = report.last_state.as_str(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            dropped = report.dropped,
            error = %report.cause,
            "Action could not be fully serviced"
        );
    }
}
