#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier::application::buckets::{BucketConfig, BucketTracker};
use courier::application::coordinator::{
    CoordinatorConfig, CoordinatorParts, InteractionCoordinator,
};
use courier::application::failures::{FailureReport, FailureSink};
use courier::application::handlers::HandlerRegistry;
use courier::application::idempotency::IdempotencyGuard;
use courier::application::retry::{RetryPolicy, RetryScheduler};
use courier::application::transport::{Transport, TransportReply};
use courier::cache::{CacheConfig, MaterializedViewCache, RequestCache};
use courier::domain::error::DeliveryError;
use courier::domain::types::{BucketMetadata, Credential};
use courier::infra::documents::MemoryDocumentStore;
use courier_api_types::{InboundAction, MessagePayload};
use serde_json::Value;
use tokio::time::{Instant, sleep};

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub kind: &'static str,
    pub action_id: String,
    pub content: Option<String>,
    pub at: Instant,
}

/// Transport that records every call and answers from a per-kind script,
/// falling back to success.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<Call>>,
    script: Mutex<HashMap<&'static str, VecDeque<TransportReply>>>,
    stalls: Mutex<HashMap<&'static str, Duration>>,
}

impl RecordingTransport {
    pub fn script(&self, kind: &'static str, reply: TransportReply) {
        self.script
            .lock()
            .expect("script lock")
            .entry(kind)
            .or_default()
            .push_back(reply);
    }

    pub fn fail(&self, kind: &'static str, error: DeliveryError) {
        self.script(kind, TransportReply::failed(BucketMetadata::default(), error));
    }

    /// Hold every `kind` call for `delay` after recording it.
    pub fn stall(&self, kind: &'static str, delay: Duration) {
        self.stalls.lock().expect("stalls lock").insert(kind, delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.calls().into_iter().map(|call| call.kind).collect()
    }

    async fn record(
        &self,
        kind: &'static str,
        credential: &Credential,
        payload: Option<&MessagePayload>,
    ) -> TransportReply {
        let (reply, stall) = self.answer(kind, credential, payload);
        if let Some(delay) = stall {
            sleep(delay).await;
        }
        reply
    }

    fn answer(
        &self,
        kind: &'static str,
        credential: &Credential,
        payload: Option<&MessagePayload>,
    ) -> (TransportReply, Option<Duration>) {
        self.calls.lock().expect("calls lock").push(Call {
            kind,
            action_id: credential.action_id.to_string(),
            content: payload.and_then(|payload| payload.content.clone()),
            at: Instant::now(),
        });
        let reply = self
            .script
            .lock()
            .expect("script lock")
            .get_mut(kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| TransportReply::delivered(BucketMetadata::default()));
        let stall = self.stalls.lock().expect("stalls lock").get(kind).copied();
        (reply, stall)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn ack_immediate(
        &self,
        credential: &Credential,
        payload: &MessagePayload,
    ) -> TransportReply {
        self.record("ack_immediate", credential, Some(payload)).await
    }

    async fn ack_deferred(&self, credential: &Credential) -> TransportReply {
        self.record("ack_deferred", credential, None).await
    }

    async fn deliver_follow_up(
        &self,
        credential: &Credential,
        payload: &MessagePayload,
        edit: bool,
    ) -> TransportReply {
        let kind = if edit { "finalize" } else { "append" };
        self.record(kind, credential, Some(payload)).await
    }
}

#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<FailureReport>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().expect("reports lock").clone()
    }
}

impl FailureSink for RecordingSink {
    fn report(&self, report: FailureReport) {
        self.reports.lock().expect("reports lock").push(report);
    }
}

pub struct Harness {
    pub coordinator: InteractionCoordinator,
    pub transport: Arc<RecordingTransport>,
    pub sink: Arc<RecordingSink>,
    pub documents: Arc<MemoryDocumentStore>,
}

pub fn harness(handlers: HandlerRegistry) -> Harness {
    harness_with(handlers, BucketConfig::default())
}

pub fn harness_with(handlers: HandlerRegistry, buckets: BucketConfig) -> Harness {
    harness_config(handlers, buckets, CoordinatorConfig::default())
}

pub fn harness_config(
    handlers: HandlerRegistry,
    buckets: BucketConfig,
    config: CoordinatorConfig,
) -> Harness {
    let transport = Arc::new(RecordingTransport::default());
    let sink = Arc::new(RecordingSink::default());
    let documents = Arc::new(MemoryDocumentStore::new());

    let coordinator = InteractionCoordinator::new(CoordinatorParts {
        config,
        handlers,
        transport: transport.clone(),
        tracker: Arc::new(BucketTracker::new(buckets)),
        retry: RetryScheduler::new(RetryPolicy::default()),
        idempotency: Arc::new(IdempotencyGuard::new(Duration::from_secs(15 * 60))),
        requests: Arc::new(RequestCache::new(documents.clone())),
        views: Arc::new(MaterializedViewCache::new(CacheConfig::default())),
        view_source: documents.clone(),
        sink: sink.clone(),
    });

    Harness {
        coordinator,
        transport,
        sink,
        documents,
    }
}

pub fn action(action_id: &str, handler: &str, payload: Value) -> InboundAction {
    InboundAction {
        action_id: action_id.to_string(),
        handler: handler.to_string(),
        token: format!("token-{action_id}"),
        payload,
        received_at: None,
    }
}

/// Let spawned tasks run without moving the paused clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
