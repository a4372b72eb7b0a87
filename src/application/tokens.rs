//! Live capability tokens and the bookkeeping around their deliveries.
//!
//! The store owns every token from issue until it retires. Retiring removes
//! the entry and publishes the terminal [`ActionOutcome`] to the action's
//! ticket, so the map only ever holds live actions.

use std::sync::Arc;

use courier_api_types::{ActionOutcome, MessagePayload};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use super::coordinator::CoordinatorError;
use super::delivery::DeliveryObserver;
use super::failures::{FailureCause, FailureReport, FailureSink, FailureStage};
use crate::domain::error::DeliveryError;
use crate::domain::tokens::{CapabilityToken, Deadlines, TokenState};
use crate::domain::types::{ActionId, BucketKey, Credential, DeliveryKind};

/// Everything needed to queue one delivery for a token.
#[derive(Debug, Clone)]
pub struct DeliverySlot {
    pub credential: Credential,
    pub bucket: BucketKey,
    pub deadline: Instant,
    pub kind: DeliveryKind,
    pub payload: MessagePayload,
}

/// What the caller needs to send an acknowledgment.
#[derive(Debug, Clone)]
pub struct AckClaim {
    pub credential: Credential,
    pub hard_deadline: Instant,
}

/// Handle to the eventual outcome of one action.
#[derive(Debug, Clone)]
pub struct ActionTicket {
    action_id: ActionId,
    outcome: watch::Receiver<Option<ActionOutcome>>,
}

impl ActionTicket {
    pub fn action_id(&self) -> &ActionId {
        &self.action_id
    }

    /// Outcome if the action already retired.
    pub fn outcome(&self) -> Option<ActionOutcome> {
        self.outcome.borrow().clone()
    }

    /// Resolve once the action retires.
    pub async fn wait(mut self) -> ActionOutcome {
        if let Ok(outcome) = self.outcome.wait_for(Option::is_some).await {
            if let Some(outcome) = outcome.as_ref() {
                return outcome.clone();
            }
        }
        self.outcome
            .borrow()
            .clone()
            .unwrap_or_else(|| ActionOutcome::Failed {
                stage: "abandoned".to_string(),
                reason: "token store dropped the action".to_string(),
            })
    }
}

struct TokenEntry {
    token: CapabilityToken,
    ack_claimed: bool,
    /// The primary response is out or queued; appends may go straight to the queue.
    primary_sent: bool,
    /// No further appends will be added by the handler side.
    sealed: bool,
    outstanding: u32,
    errors: u32,
    first_failure: Option<(FailureStage, DeliveryError)>,
    held: Vec<MessagePayload>,
    outcome: watch::Sender<Option<ActionOutcome>>,
}

impl TokenEntry {
    fn slot(&self, kind: DeliveryKind, payload: MessagePayload) -> DeliverySlot {
        DeliverySlot {
            credential: self.token.credential().clone(),
            bucket: BucketKey::follow_up(self.token.action_id()),
            deadline: self.token.soft_deadline(),
            kind,
            payload,
        }
    }

    fn release_held(&mut self, enqueue: &mut dyn FnMut(DeliverySlot)) {
        for payload in std::mem::take(&mut self.held) {
            self.outstanding += 1;
            enqueue(self.slot(DeliveryKind::Append, payload));
        }
    }

    fn ready_to_complete(&self) -> bool {
        self.sealed && self.outstanding == 0 && !self.token.state().is_terminal()
    }
}

pub struct TokenStore {
    entries: DashMap<ActionId, TokenEntry>,
    sink: Arc<dyn FailureSink>,
}

impl TokenStore {
    pub fn new(sink: Arc<dyn FailureSink>) -> Self {
        Self {
            entries: DashMap::new(),
            sink,
        }
    }

    /// Register a PENDING token for a new action.
    pub fn issue(
        &self,
        credential: Credential,
        issued_at: Instant,
        deadlines: Deadlines,
    ) -> Result<ActionTicket, CoordinatorError> {
        let action_id = credential.action_id.clone();
        match self.entries.entry(action_id.clone()) {
            Entry::Occupied(_) => Err(CoordinatorError::AlreadyIssued(action_id)),
            Entry::Vacant(vacant) => {
                let (outcome, receiver) = watch::channel(None);
                vacant.insert(TokenEntry {
                    token: CapabilityToken::issue(credential, issued_at, deadlines),
                    ack_claimed: false,
                    primary_sent: false,
                    sealed: false,
                    outstanding: 0,
                    errors: 0,
                    first_failure: None,
                    held: Vec::new(),
                    outcome,
                });
                debug!(
                    target = "courier::tokens",
                    action_id = %action_id,
                    "Token issued"
                );
                Ok(ActionTicket {
                    action_id,
                    outcome: receiver,
                })
            }
        }
    }

    /// A ticket for an action that is still live.
    pub fn ticket(&self, action_id: &ActionId) -> Option<ActionTicket> {
        self.entries.get(action_id).map(|entry| ActionTicket {
            action_id: action_id.clone(),
            outcome: entry.outcome.subscribe(),
        })
    }

    pub fn state(&self, action_id: &ActionId) -> Option<TokenState> {
        self.entries.get(action_id).map(|entry| entry.token.state())
    }

    pub fn hard_deadline(&self, action_id: &ActionId) -> Option<Instant> {
        self.entries
            .get(action_id)
            .map(|entry| entry.token.hard_deadline())
    }

    pub fn soft_deadline(&self, action_id: &ActionId) -> Option<Instant> {
        self.entries
            .get(action_id)
            .map(|entry| entry.token.soft_deadline())
    }

    /// Reserve the single acknowledgment a token may send.
    pub fn claim_ack(&self, action_id: &ActionId) -> Result<AckClaim, CoordinatorError> {
        let mut entry = self.live(action_id)?;
        if entry.ack_claimed || entry.token.state() != TokenState::Pending {
            return Err(CoordinatorError::AlreadyAcknowledged(action_id.clone()));
        }
        entry.ack_claimed = true;
        Ok(AckClaim {
            credential: entry.token.credential().clone(),
            hard_deadline: entry.token.hard_deadline(),
        })
    }

    /// The final payload went out with the acknowledgment itself. Appends
    /// buffered so far are released to the queue.
    pub fn acknowledged_immediate(
        &self,
        action_id: &ActionId,
        mut enqueue: impl FnMut(DeliverySlot),
    ) -> Result<(), CoordinatorError> {
        let mut entry = self.live(action_id)?;
        entry.token.transition(TokenState::AckedImmediate)?;
        entry.primary_sent = true;
        entry.release_held(&mut enqueue);
        Ok(())
    }

    pub fn acknowledged_deferred(&self, action_id: &ActionId) -> Result<(), CoordinatorError> {
        let mut entry = self.live(action_id)?;
        entry.token.transition(TokenState::AckedDeferred)?;
        Ok(())
    }

    /// Queue the single edit of the deferred placeholder, then any appends that
    /// were waiting for it.
    pub fn finalize(
        &self,
        action_id: &ActionId,
        payload: MessagePayload,
        mut enqueue: impl FnMut(DeliverySlot),
    ) -> Result<(), CoordinatorError> {
        let mut entry = self.live(action_id)?;
        if entry.primary_sent {
            return Err(CoordinatorError::AlreadyFinalized(action_id.clone()));
        }
        if !matches!(
            entry.token.state(),
            TokenState::AckedDeferred | TokenState::Delivering
        ) {
            return Err(CoordinatorError::NotDeferred(action_id.clone()));
        }

        entry.primary_sent = true;
        entry.outstanding += 1;
        enqueue(entry.slot(DeliveryKind::Finalize, payload));
        entry.release_held(&mut enqueue);
        Ok(())
    }

    /// Queue an extra message, or hold it until the primary response is queued.
    pub fn append(
        &self,
        action_id: &ActionId,
        payload: MessagePayload,
        mut enqueue: impl FnMut(DeliverySlot),
    ) -> Result<(), CoordinatorError> {
        let mut entry = self.live(action_id)?;
        if entry.sealed {
            return Err(CoordinatorError::Closed(action_id.clone()));
        }
        if entry.primary_sent {
            entry.outstanding += 1;
            enqueue(entry.slot(DeliveryKind::Append, payload));
        } else {
            entry.held.push(payload);
        }
        Ok(())
    }

    /// The handler side is done; the token retires once its queue drains.
    pub fn seal(&self, action_id: &ActionId) -> Result<(), CoordinatorError> {
        {
            let mut entry = self.live(action_id)?;
            if !entry.primary_sent {
                return Err(CoordinatorError::NotDeferred(action_id.clone()));
            }
            entry.sealed = true;
        }
        self.retire_if_done(action_id);
        Ok(())
    }

    /// Stop the action for good: remove it, publish the outcome and report once.
    ///
    /// Returns `false` if the action had already retired.
    pub fn terminate(&self, action_id: &ActionId, stage: FailureStage, cause: FailureCause) -> bool {
        let Some((_, mut entry)) = self.entries.remove(action_id) else {
            return false;
        };

        let last_state = entry.token.state();
        let expired = cause.is_expiry();
        let (next, outcome) = if expired {
            (
                TokenState::Expired,
                ActionOutcome::Expired {
                    stage: stage.as_str().to_string(),
                },
            )
        } else {
            (
                TokenState::Complete,
                ActionOutcome::Failed {
                    stage: stage.as_str().to_string(),
                    reason: cause.to_string(),
                },
            )
        };
        if entry.token.transition(next).is_err() {
            // Complete is unreachable from here; the token can still expire.
            let _ = entry.token.transition(TokenState::Expired);
        }

        self.sink.report(FailureReport {
            action_id: action_id.clone(),
            stage,
            last_state,
            elapsed: entry.token.elapsed(Instant::now()),
            cause,
            dropped: entry.errors,
        });
        entry.outcome.send_replace(Some(outcome));
        true
    }

    /// Expire every token past its soft deadline; returns the affected actions.
    pub fn expire_due(&self, now: Instant) -> Vec<ActionId> {
        let due: Vec<ActionId> = self
            .entries
            .iter()
            .filter(|entry| entry.token.is_past_soft(now))
            .map(|entry| entry.key().clone())
            .collect();

        due.into_iter()
            .filter(|action_id| {
                self.terminate(
                    action_id,
                    FailureStage::SoftDeadline,
                    FailureCause::Delivery(DeliveryError::deadline("soft_deadline")),
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live(
        &self,
        action_id: &ActionId,
    ) -> Result<RefMut<'_, ActionId, TokenEntry>, CoordinatorError> {
        self.entries
            .get_mut(action_id)
            .ok_or_else(|| CoordinatorError::UnknownToken(action_id.clone()))
    }

    fn retire_if_done(&self, action_id: &ActionId) {
        let Some((_, mut entry)) = self
            .entries
            .remove_if(action_id, |_, entry| entry.ready_to_complete())
        else {
            return;
        };

        let last_state = entry.token.state();
        if let Err(error) = entry.token.transition(TokenState::Complete) {
            debug!(target = "courier::tokens", action_id = %action_id, %error, "Unexpected completion");
        }
        let elapsed = entry.token.elapsed(Instant::now());

        if let Some((stage, error)) = entry.first_failure.take() {
            self.sink.report(FailureReport {
                action_id: action_id.clone(),
                stage,
                last_state,
                elapsed,
                cause: FailureCause::Delivery(error),
                dropped: entry.errors,
            });
        }

        info!(
            target = "courier::tokens",
            action_id = %action_id,
            errors = entry.errors,
            elapsed_ms = elapsed.as_millis() as u64,
            "Action complete"
        );
        entry.outcome.send_replace(Some(ActionOutcome::Complete {
            errors: entry.errors,
        }));
    }
}

impl DeliveryObserver for TokenStore {
    fn admit(&self, action_id: &ActionId, _kind: DeliveryKind) -> bool {
        let Some(mut entry) = self.entries.get_mut(action_id) else {
            return false;
        };
        if entry.token.is_past_soft(Instant::now()) {
            return false;
        }
        match entry.token.state() {
            TokenState::AckedImmediate | TokenState::AckedDeferred => {
                entry.token.transition(TokenState::Delivering).is_ok()
            }
            TokenState::Delivering => true,
            _ => false,
        }
    }

    fn delivered(&self, action_id: &ActionId, _kind: DeliveryKind) {
        if let Some(mut entry) = self.entries.get_mut(action_id) {
            entry.outstanding = entry.outstanding.saturating_sub(1);
        }
        self.retire_if_done(action_id);
    }

    fn dropped(&self, action_id: &ActionId, kind: DeliveryKind, error: DeliveryError) {
        if error.is_deadline() {
            self.terminate(action_id, kind.into(), FailureCause::Delivery(error));
            return;
        }
        if let Some(mut entry) = self.entries.get_mut(action_id) {
            entry.outstanding = entry.outstanding.saturating_sub(1);
            entry.errors += 1;
            if entry.first_failure.is_none() {
                entry.first_failure = Some((kind.into(), error));
            }
        }
        self.retire_if_done(action_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<FailureReport>>,
    }

    impl RecordingSink {
        fn reports(&self) -> Vec<FailureReport> {
            self.reports.lock().expect("reports lock").clone()
        }
    }

    impl FailureSink for RecordingSink {
        fn report(&self, report: FailureReport) {
            self.reports.lock().expect("reports lock").push(report);
        }
    }

    fn store() -> (TokenStore, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (TokenStore::new(sink.clone()), sink)
    }

    fn issue(store: &TokenStore, id: &str) -> ActionTicket {
        store
            .issue(
                Credential::new(ActionId::from(id), "secret"),
                Instant::now(),
                Deadlines::default(),
            )
            .expect("fresh action id")
    }

    fn kinds(slots: &[DeliverySlot]) -> Vec<DeliveryKind> {
        slots.iter().map(|slot| slot.kind).collect()
    }

    #[tokio::test]
    async fn appends_wait_for_the_finalize() {
        let (store, _) = store();
        let id = ActionId::from("a");
        issue(&store, "a");
        store.claim_ack(&id).expect("first claim");
        store.acknowledged_deferred(&id).expect("deferred ack");

        let mut queued = Vec::new();
        store
            .append(&id, MessagePayload::text("early"), |slot| queued.push(slot))
            .expect("append accepted");
        assert!(queued.is_empty(), "append held until finalize");

        store
            .finalize(&id, MessagePayload::text("final"), |slot| queued.push(slot))
            .expect("finalize accepted");
        store
            .append(&id, MessagePayload::text("late"), |slot| queued.push(slot))
            .expect("append accepted");

        assert_eq!(
            kinds(&queued),
            vec![
                DeliveryKind::Finalize,
                DeliveryKind::Append,
                DeliveryKind::Append
            ]
        );
        assert_eq!(queued[1].payload.content.as_deref(), Some("early"));
        assert_eq!(queued[0].bucket, BucketKey::follow_up(&id));
    }

    #[tokio::test]
    async fn second_finalize_and_second_ack_are_rejected() {
        let (store, _) = store();
        let id = ActionId::from("a");
        issue(&store, "a");

        store.claim_ack(&id).expect("first claim");
        assert!(matches!(
            store.claim_ack(&id),
            Err(CoordinatorError::AlreadyAcknowledged(_))
        ));

        store.acknowledged_deferred(&id).expect("deferred ack");
        store
            .finalize(&id, MessagePayload::text("one"), |_| {})
            .expect("first finalize");
        assert!(matches!(
            store.finalize(&id, MessagePayload::text("two"), |_| {}),
            Err(CoordinatorError::AlreadyFinalized(_))
        ));
    }

    #[tokio::test]
    async fn token_retires_after_last_delivery() {
        let (store, sink) = store();
        let id = ActionId::from("a");
        let ticket = issue(&store, "a");
        store.claim_ack(&id).expect("claim");
        store.acknowledged_deferred(&id).expect("deferred ack");
        store
            .finalize(&id, MessagePayload::text("final"), |_| {})
            .expect("finalize");
        store.seal(&id).expect("seal");

        assert!(store.admit(&id, DeliveryKind::Finalize));
        assert_eq!(store.state(&id), Some(TokenState::Delivering));
        assert!(ticket.outcome().is_none());

        store.delivered(&id, DeliveryKind::Finalize);
        assert!(store.is_empty());
        assert_eq!(ticket.wait().await, ActionOutcome::Complete { errors: 0 });
        assert!(sink.reports().is_empty());
    }

    #[tokio::test]
    async fn dropped_append_completes_with_errors_and_reports_once() {
        let (store, sink) = store();
        let id = ActionId::from("a");
        let ticket = issue(&store, "a");
        store.claim_ack(&id).expect("claim");
        store.acknowledged_deferred(&id).expect("deferred ack");
        store
            .finalize(&id, MessagePayload::text("final"), |_| {})
            .expect("finalize");
        for text in ["one", "two"] {
            store
                .append(&id, MessagePayload::text(text), |_| {})
                .expect("append");
        }
        store.seal(&id).expect("seal");

        store.delivered(&id, DeliveryKind::Finalize);
        store.dropped(&id, DeliveryKind::Append, DeliveryError::transient("503"));
        store.dropped(&id, DeliveryKind::Append, DeliveryError::transient("504"));

        assert_eq!(ticket.wait().await, ActionOutcome::Complete { errors: 2 });
        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].stage, FailureStage::Append);
        assert_eq!(reports[0].dropped, 2);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let (store, sink) = store();
        let id = ActionId::from("a");
        let ticket = issue(&store, "a");

        assert!(store.terminate(&id, FailureStage::Cancelled, FailureCause::Cancelled));
        assert!(!store.terminate(&id, FailureStage::Cancelled, FailureCause::Cancelled));

        assert_eq!(
            ticket.wait().await,
            ActionOutcome::Expired {
                stage: "cancelled".to_string()
            }
        );
        assert_eq!(sink.reports().len(), 1);
        assert!(matches!(
            store.append(&id, MessagePayload::text("late"), |_| {}),
            Err(CoordinatorError::UnknownToken(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_past_soft_deadline_expire() {
        let (store, sink) = store();
        let ticket = issue(&store, "old");
        tokio::time::advance(Duration::from_secs(60)).await;
        issue(&store, "young");

        let soft = Deadlines::default().soft;
        let expired = store.expire_due(Instant::now() + soft - Duration::from_secs(30));

        assert_eq!(expired, vec![ActionId::from("old")]);
        assert_eq!(store.len(), 1);
        assert!(!store.admit(&ActionId::from("old"), DeliveryKind::Append));
        assert_eq!(
            ticket.wait().await,
            ActionOutcome::Expired {
                stage: "soft_deadline".to_string()
            }
        );
        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].last_state, TokenState::Pending);
    }

    #[tokio::test]
    async fn deadline_drop_expires_the_token() {
        let (store, sink) = store();
        let id = ActionId::from("a");
        let ticket = issue(&store, "a");
        store.claim_ack(&id).expect("claim");
        store.acknowledged_deferred(&id).expect("deferred ack");
        store
            .finalize(&id, MessagePayload::text("final"), |_| {})
            .expect("finalize");

        store.dropped(
            &id,
            DeliveryKind::Finalize,
            DeliveryError::deadline("finalize"),
        );

        assert_eq!(
            ticket.wait().await,
            ActionOutcome::Expired {
                stage: "finalize".to_string()
            }
        );
        assert_eq!(sink.reports().len(), 1);
    }
}
