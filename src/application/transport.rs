//! Outbound port to the interactive platform.

use async_trait::async_trait;
use courier_api_types::MessagePayload;

use crate::domain::error::DeliveryError;
use crate::domain::types::{BucketMetadata, Credential};

/// Result of one outbound call together with the bucket state it reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportReply {
    pub metadata: BucketMetadata,
    pub result: Result<(), DeliveryError>,
}

impl TransportReply {
    pub fn delivered(metadata: BucketMetadata) -> Self {
        Self {
            metadata,
            result: Ok(()),
        }
    }

    pub fn failed(metadata: BucketMetadata, error: DeliveryError) -> Self {
        Self {
            metadata,
            result: Err(error),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Answer the action with its final payload.
    async fn ack_immediate(&self, credential: &Credential, payload: &MessagePayload)
    -> TransportReply;

    /// Answer with a placeholder; the real response follows later.
    async fn ack_deferred(&self, credential: &Credential) -> TransportReply;

    /// Send a follow-up. With `edit` set the deferred placeholder is replaced.
    async fn deliver_follow_up(
        &self,
        credential: &Credential,
        payload: &MessagePayload,
        edit: bool,
    ) -> TransportReply;
}
