//! Wire types shared between the Courier server and the systems that feed it.
//!
//! The platform delivers an [`InboundAction`] for every user interaction. The
//! server answers with a [`DispatchReceipt`], and the terminal state of each
//! action is summarised as an [`ActionOutcome`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// A single externally triggered event that must be acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundAction {
    /// Platform-assigned identifier, unique per interaction.
    pub action_id: String,
    /// Name of the registered handler that services this action.
    pub handler: String,
    /// Capability token authorising the acknowledgment and follow-ups.
    pub token: String,
    /// Handler-specific input.
    #[serde(default)]
    pub payload: Value,
    /// When the platform emitted the action, if it says so.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub received_at: Option<OffsetDateTime>,
}

/// Message body sent back to the platform.
///
/// Only `content` is interpreted here; every other field is passed through
/// untouched so presentation layers can attach whatever the platform accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl MessagePayload {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// How an action was (or will be) acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    Immediate,
    Deferred,
}

/// Terminal result of servicing one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// All deliveries were attempted; `errors` counts the ones that were dropped.
    Complete { errors: u32 },
    /// The token ran out of time or was cancelled.
    Expired { stage: String },
    /// The handler or acknowledgment failed and no response was produced.
    Failed { stage: String, reason: String },
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Complete { errors: 0 })
    }
}

/// Response to an inbound action submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchReceipt {
    Accepted {
        action_id: String,
        ack: AckMode,
    },
    /// The action id was seen before; `outcome` is absent while it is still running.
    Duplicate {
        action_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<ActionOutcome>,
    },
}

/// Sizes of the bounded in-memory stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub tokens: usize,
    pub idempotency_records: usize,
    pub queued_deliveries: usize,
    pub buckets: usize,
    pub request_scopes: usize,
    pub views: usize,
}
