//! Interaction response coordinator.
//!
//! `dispatch` is the single entry point for inbound actions. It passes the
//! idempotency guard, issues the capability token, picks the acknowledgment
//! path and runs the handler on its own task. Everything the handler produces
//! reaches the platform through the delivery queue, except the final payload
//! of an immediate acknowledgment, which travels with the acknowledgment.

use std::sync::Arc;
use std::time::Duration;

use courier_api_types::{AckMode, ActionOutcome, DispatchReceipt, HealthReport, InboundAction, MessagePayload};
use futures::FutureExt;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, debug, info, info_span, warn};

use super::buckets::BucketTracker;
use super::context::ActionContext;
use super::delivery::{DeliveryFn, DeliveryQueue, DeliveryRequest};
use super::failures::{FailureCause, FailureSink, FailureStage};
use super::handlers::{ActionHandler, HandlerError, HandlerRegistry, Reply, ResponseMode};
use super::idempotency::{IdempotencyGuard, Registration};
use super::repos::ViewSource;
use super::retry::RetryScheduler;
use super::tokens::{AckClaim, ActionTicket, DeliverySlot, TokenStore};
use super::transport::Transport;
use crate::cache::{MaterializedViewCache, RequestCache};
use crate::domain::error::DeliveryError;
use crate::domain::tokens::{Deadlines, TokenState, TransitionError};
use crate::domain::types::{ActionId, BucketKey, Credential, DeliveryKind, Priority};

const DEFAULT_ACK_SAFETY_MARGIN: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("no handler registered as `{0}`")]
    UnknownHandler(String),
    #[error("action `{0}` already has a token")]
    AlreadyIssued(ActionId),
    #[error("no live token for action `{0}`")]
    UnknownToken(ActionId),
    #[error("action `{0}` was already acknowledged")]
    AlreadyAcknowledged(ActionId),
    #[error("action `{0}` was already finalized")]
    AlreadyFinalized(ActionId),
    #[error("action `{0}` has no primary response yet")]
    NotDeferred(ActionId),
    #[error("action `{0}` accepts no further deliveries")]
    Closed(ActionId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("acknowledgment failed: {0}")]
    Acknowledgment(DeliveryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub deadlines: Deadlines,
    /// Slack kept between the immediate path's cutoff and the hard deadline.
    pub ack_safety_margin: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            deadlines: Deadlines::default(),
            ack_safety_margin: DEFAULT_ACK_SAFETY_MARGIN,
        }
    }
}

/// Collaborators the coordinator is assembled from.
pub struct CoordinatorParts {
    pub config: CoordinatorConfig,
    pub handlers: HandlerRegistry,
    pub transport: Arc<dyn Transport>,
    pub tracker: Arc<BucketTracker>,
    pub retry: RetryScheduler,
    pub idempotency: Arc<IdempotencyGuard<ActionOutcome>>,
    pub requests: Arc<RequestCache>,
    pub views: Arc<MaterializedViewCache>,
    pub view_source: Arc<dyn ViewSource>,
    pub sink: Arc<dyn FailureSink>,
}

#[derive(Debug)]
pub enum Dispatch {
    Started { ticket: ActionTicket, ack: AckMode },
    /// The action id was seen before; the handler did not run again.
    Duplicate { outcome: Option<ActionOutcome> },
}

impl Dispatch {
    pub fn receipt(&self, action_id: &str) -> DispatchReceipt {
        match self {
            Dispatch::Started { ack, .. } => DispatchReceipt::Accepted {
                action_id: action_id.to_string(),
                ack: *ack,
            },
            Dispatch::Duplicate { outcome } => DispatchReceipt::Duplicate {
                action_id: action_id.to_string(),
                outcome: outcome.clone(),
            },
        }
    }

    pub fn ticket(self) -> Option<ActionTicket> {
        match self {
            Dispatch::Started { ticket, .. } => Some(ticket),
            Dispatch::Duplicate { .. } => None,
        }
    }
}

enum Ack {
    Immediate(MessagePayload),
    Deferred,
}

impl Ack {
    fn mode(&self) -> AckMode {
        match self {
            Ack::Immediate(_) => AckMode::Immediate,
            Ack::Deferred => AckMode::Deferred,
        }
    }
}

type HandlerTask = JoinHandle<Result<Reply, HandlerError>>;

struct HandlerFailure {
    cause: FailureCause,
}

struct Inner {
    config: CoordinatorConfig,
    handlers: HandlerRegistry,
    transport: Arc<dyn Transport>,
    tracker: Arc<BucketTracker>,
    retry: RetryScheduler,
    tokens: Arc<TokenStore>,
    queue: DeliveryQueue,
    idempotency: Arc<IdempotencyGuard<ActionOutcome>>,
    requests: Arc<RequestCache>,
    views: Arc<MaterializedViewCache>,
    view_source: Arc<dyn ViewSource>,
}

#[derive(Clone)]
pub struct InteractionCoordinator {
    inner: Arc<Inner>,
}

impl InteractionCoordinator {
    pub fn new(parts: CoordinatorParts) -> Self {
        let tokens = Arc::new(TokenStore::new(parts.sink));
        let queue = DeliveryQueue::new(parts.tracker.clone(), parts.retry.clone(), tokens.clone());
        Self {
            inner: Arc::new(Inner {
                config: parts.config,
                handlers: parts.handlers,
                transport: parts.transport,
                tracker: parts.tracker,
                retry: parts.retry,
                tokens,
                queue,
                idempotency: parts.idempotency,
                requests: parts.requests,
                views: parts.views,
                view_source: parts.view_source,
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Accept an inbound action. The handler runs on its own task; the
    /// returned ticket resolves once the action retires.
    pub fn dispatch(&self, action: InboundAction) -> Result<Dispatch, CoordinatorError> {
        let inner = &self.inner;
        let registered = inner
            .handlers
            .get(&action.handler)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownHandler(action.handler.clone()))?;
        let action_id = ActionId::new(action.action_id.clone());

        if let Registration::Duplicate { result } = inner.idempotency.check_and_register(&action_id) {
            return Ok(Dispatch::Duplicate { outcome: result });
        }

        let issued_at = issued_at(action.received_at);
        let credential = Credential::new(action_id.clone(), action.token.clone());
        let ticket = inner
            .tokens
            .issue(credential, issued_at, inner.config.deadlines)?;

        let ack = self.plan(registered.mode, issued_at);
        info!(
            target = "courier::coordinator",
            action_id = %action_id,
            handler = %action.handler,
            ack = ?ack,
            "Action accepted"
        );

        let idempotency = inner.idempotency.clone();
        let watcher = ticket.clone();
        tokio::spawn(async move {
            let id = watcher.action_id().clone();
            let outcome = watcher.wait().await;
            idempotency.record_result(&id, outcome);
        });

        let span = info_span!("action", action_id = %action_id, handler = %action.handler);
        let coordinator = self.clone();
        tokio::spawn(
            async move {
                coordinator
                    .run_action(action, action_id, registered.handler, ack)
                    .await;
            }
            .instrument(span),
        );

        Ok(Dispatch::Started { ticket, ack })
    }

    /// Send an extra message for a live action.
    pub fn append(&self, action_id: &ActionId, payload: MessagePayload) -> Result<(), CoordinatorError> {
        self.inner
            .tokens
            .append(action_id, payload, |slot| self.enqueue(slot))
    }

    /// Expire the action and drop its queued deliveries. Idempotent; returns
    /// whether the action was still live.
    pub fn cancel(&self, action_id: &ActionId) -> bool {
        let live = self
            .inner
            .tokens
            .terminate(action_id, FailureStage::Cancelled, FailureCause::Cancelled);
        self.inner.queue.cancel(action_id);
        live
    }

    /// Expire every action past its soft deadline.
    pub fn expire_due(&self) -> usize {
        let expired = self.inner.tokens.expire_due(Instant::now());
        for action_id in &expired {
            self.inner.queue.cancel(action_id);
        }
        expired.len()
    }

    pub fn sweep_idempotency(&self) -> usize {
        self.inner.idempotency.sweep(Instant::now())
    }

    pub fn sweep_buckets(&self) -> usize {
        self.inner.tracker.sweep_idle()
    }

    pub fn token_state(&self, action_id: &ActionId) -> Option<TokenState> {
        self.inner.tokens.state(action_id)
    }

    pub fn tracker(&self) -> &Arc<BucketTracker> {
        &self.inner.tracker
    }

    pub fn queued_deliveries(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn health(&self) -> HealthReport {
        let inner = &self.inner;
        HealthReport {
            tokens: inner.tokens.len(),
            idempotency_records: inner.idempotency.len(),
            queued_deliveries: inner.queue.len(),
            buckets: inner.tracker.len(),
            request_scopes: inner.requests.len(),
            views: inner.views.len(),
        }
    }

    fn plan(&self, mode: ResponseMode, issued_at: Instant) -> AckMode {
        match mode {
            ResponseMode::Deferred => AckMode::Deferred,
            ResponseMode::Immediate { estimate } => {
                let hard_deadline = issued_at + self.inner.config.deadlines.hard;
                let remaining = hard_deadline.saturating_duration_since(Instant::now());
                if estimate + self.inner.config.ack_safety_margin <= remaining {
                    AckMode::Immediate
                } else {
                    AckMode::Deferred
                }
            }
        }
    }

    async fn run_action(
        &self,
        action: InboundAction,
        action_id: ActionId,
        handler: Arc<dyn ActionHandler>,
        ack: AckMode,
    ) {
        let inner = &self.inner;
        let scope = inner.requests.begin(&action_id);
        let ctx = ActionContext::new(
            Arc::new(action),
            scope.cache(),
            inner.views.clone(),
            inner.view_source.clone(),
            self.clone(),
        );
        let task: HandlerTask = tokio::spawn(async move { handler.handle(ctx).await }.in_current_span());

        match ack {
            AckMode::Immediate => self.run_immediate(&action_id, task).await,
            AckMode::Deferred => self.run_deferred(&action_id, task).await,
        }
        drop(scope);
    }

    async fn run_immediate(&self, action_id: &ActionId, mut task: HandlerTask) {
        let Some(hard_deadline) = self.inner.tokens.hard_deadline(action_id) else {
            task.abort();
            return;
        };
        let margin = self.inner.config.ack_safety_margin;
        let cutoff = hard_deadline.checked_sub(margin).unwrap_or(hard_deadline);

        match timeout_at(cutoff, &mut task).await {
            Ok(joined) => match flatten(joined) {
                Ok(reply) => self.respond_immediate(action_id, reply).await,
                Err(failure) => self.fail(action_id, failure),
            },
            Err(_) => {
                warn!(
                    target = "courier::coordinator",
                    action_id = %action_id,
                    margin_ms = margin.as_millis() as u64,
                    "Handler overran its estimate; falling back to deferred acknowledgment"
                );
                self.run_deferred(action_id, task).await;
            }
        }
    }

    async fn run_deferred(&self, action_id: &ActionId, mut task: HandlerTask) {
        if self.acknowledge(action_id, Ack::Deferred).await.is_err() {
            task.abort();
            return;
        }
        let (Some(ticket), Some(soft_deadline)) = (
            self.inner.tokens.ticket(action_id),
            self.inner.tokens.soft_deadline(action_id),
        ) else {
            task.abort();
            return;
        };

        let joined = tokio::select! {
            joined = timeout_at(soft_deadline, &mut task) => joined,
            _ = ticket.wait() => {
                debug!(
                    target = "courier::coordinator",
                    action_id = %action_id,
                    "Action retired while its handler was running"
                );
                task.abort();
                return;
            }
        };

        let result = match joined {
            Ok(joined) => flatten(joined),
            Err(_) => {
                task.abort();
                Err(HandlerFailure {
                    cause: FailureCause::Delivery(DeliveryError::deadline("handler")),
                })
            }
        };
        match result {
            Ok(reply) => self.respond_deferred(action_id, reply),
            Err(failure) => self.fail(action_id, failure),
        }
    }

    async fn respond_immediate(&self, action_id: &ActionId, reply: Reply) {
        let Reply { content, follow_ups } = reply;
        if self.acknowledge(action_id, Ack::Immediate(content)).await.is_err() {
            return;
        }
        self.append_all(action_id, follow_ups);
    }

    fn respond_deferred(&self, action_id: &ActionId, reply: Reply) {
        let Reply { content, follow_ups } = reply;
        if let Err(error) = self
            .inner
            .tokens
            .finalize(action_id, content, |slot| self.enqueue(slot))
        {
            debug!(
                target = "courier::coordinator",
                action_id = %action_id,
                error = %error,
                "Finalize skipped"
            );
            return;
        }
        self.append_all(action_id, follow_ups);
    }

    fn append_all(&self, action_id: &ActionId, follow_ups: Vec<MessagePayload>) {
        for payload in follow_ups {
            if let Err(error) = self.append(action_id, payload) {
                debug!(
                    target = "courier::coordinator",
                    action_id = %action_id,
                    error = %error,
                    "Follow-up skipped"
                );
                return;
            }
        }
        if let Err(error) = self.inner.tokens.seal(action_id) {
            debug!(
                target = "courier::coordinator",
                action_id = %action_id,
                error = %error,
                "Seal skipped"
            );
        }
    }

    fn fail(&self, action_id: &ActionId, failure: HandlerFailure) {
        self.inner
            .tokens
            .terminate(action_id, FailureStage::Handler, failure.cause);
        self.inner.queue.cancel(action_id);
    }

    /// Send the one acknowledgment the token allows, retrying within the hard deadline.
    async fn acknowledge(&self, action_id: &ActionId, ack: Ack) -> Result<(), CoordinatorError> {
        let inner = &self.inner;
        let claim = inner.tokens.claim_ack(action_id)?;
        let bucket = BucketKey::callback(action_id);

        let sent = inner
            .retry
            .execute(Some(claim.hard_deadline), |_| self.send_ack(&claim, &bucket, &ack))
            .await;

        match sent {
            Ok(()) => {
                debug!(
                    target = "courier::coordinator",
                    action_id = %action_id,
                    mode = ?ack.mode(),
                    "Acknowledged"
                );
                match ack {
                    Ack::Deferred => inner.tokens.acknowledged_deferred(action_id),
                    Ack::Immediate(_) => inner
                        .tokens
                        .acknowledged_immediate(action_id, |slot| self.enqueue(slot)),
                }
            }
            Err(error) => {
                let error = error.into_delivery_error();
                inner.tokens.terminate(
                    action_id,
                    FailureStage::Acknowledge,
                    FailureCause::Delivery(error.clone()),
                );
                inner.queue.cancel(action_id);
                Err(CoordinatorError::Acknowledgment(error))
            }
        }
    }

    async fn send_ack(
        &self,
        claim: &AckClaim,
        bucket: &BucketKey,
        ack: &Ack,
    ) -> Result<(), DeliveryError> {
        let inner = &self.inner;
        inner
            .tracker
            .acquire(bucket, claim.hard_deadline, "acknowledge")
            .await?;

        let call = async {
            match ack {
                Ack::Immediate(payload) => {
                    inner
                        .transport
                        .ack_immediate(&claim.credential, payload)
                        .await
                }
                Ack::Deferred => inner.transport.ack_deferred(&claim.credential).await,
            }
        };
        let reply = timeout_at(claim.hard_deadline, call)
            .await
            .map_err(|_| DeliveryError::deadline("acknowledge"))?;
        inner.tracker.observe(bucket, &reply.metadata);
        reply.result
    }

    fn enqueue(&self, slot: DeliverySlot) {
        let DeliverySlot {
            credential,
            bucket,
            deadline,
            kind,
            payload,
        } = slot;
        let action_id = credential.action_id.clone();
        let transport = self.inner.transport.clone();
        let edit = kind.is_edit();

        let deliver: DeliveryFn = Arc::new(move || {
            let transport = transport.clone();
            let credential = credential.clone();
            let payload = payload.clone();
            async move {
                transport
                    .deliver_follow_up(&credential, &payload, edit)
                    .await
            }
            .boxed()
        });

        self.inner.queue.enqueue(DeliveryRequest {
            action_id,
            bucket,
            kind,
            priority: match kind {
                DeliveryKind::Finalize => Priority::HIGH,
                DeliveryKind::Append => Priority::NORMAL,
            },
            deadline,
            deliver,
        });
    }
}

fn flatten(
    joined: Result<Result<Reply, HandlerError>, tokio::task::JoinError>,
) -> Result<Reply, HandlerFailure> {
    match joined {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(error)) => Err(HandlerFailure {
            cause: FailureCause::Handler(error.to_string()),
        }),
        Err(join_error) => Err(HandlerFailure {
            cause: FailureCause::Handler(if join_error.is_panic() {
                "handler panicked".to_string()
            } else {
                "handler task was cancelled".to_string()
            }),
        }),
    }
}

/// Token clock start: the platform's emit time when known, otherwise now.
fn issued_at(received_at: Option<OffsetDateTime>) -> Instant {
    let now = Instant::now();
    let Some(received_at) = received_at else {
        return now;
    };
    match Duration::try_from(OffsetDateTime::now_utc() - received_at) {
        Ok(age) => now.checked_sub(age).unwrap_or(now),
        Err(_) => now,
    }
}
