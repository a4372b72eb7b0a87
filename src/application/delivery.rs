//! Rate-limit aware delivery queue.
//!
//! Jobs are grouped into lanes by bucket. Each non-empty lane has exactly one
//! worker task that drains it sequentially: reserve a bucket slot, run the
//! attempt, feed the reported metadata back to the tracker, and retry through
//! the [`RetryScheduler`]. A token's jobs always leave its lane in the order
//! they were enqueued; priority only reorders jobs of different tokens.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use metrics::{counter, gauge};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use super::buckets::BucketTracker;
use super::retry::RetryScheduler;
use super::transport::TransportReply;
use crate::domain::error::DeliveryError;
use crate::domain::types::{ActionId, BucketKey, DeliveryKind, Priority};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "application::delivery";
// Stage used when the observer refuses an attempt; such jobs end silently.
const INACTIVE: &str = "inactive";

/// One outbound call; invoked once per attempt.
pub type DeliveryFn = Arc<dyn Fn() -> BoxFuture<'static, TransportReply> + Send + Sync>;

pub struct DeliveryRequest {
    pub action_id: ActionId,
    /// Every request of one action must use the same bucket.
    pub bucket: BucketKey,
    pub kind: DeliveryKind,
    pub priority: Priority,
    /// No attempt starts at or after this instant.
    pub deadline: Instant,
    pub deliver: DeliveryFn,
}

/// Callbacks into whoever owns the tokens the jobs belong to.
pub trait DeliveryObserver: Send + Sync {
    /// Called before every attempt; `false` drops the job without reporting.
    fn admit(&self, action_id: &ActionId, kind: DeliveryKind) -> bool;
    fn delivered(&self, action_id: &ActionId, kind: DeliveryKind);
    fn dropped(&self, action_id: &ActionId, kind: DeliveryKind, error: DeliveryError);
}

struct QueuedJob {
    seq: u64,
    request: DeliveryRequest,
    enqueued_at: Instant,
}

#[derive(Default)]
struct QueueState {
    lanes: HashMap<BucketKey, VecDeque<QueuedJob>>,
    next_seq: u64,
    len: usize,
}

impl QueueState {
    /// Highest priority among the per-token heads of `bucket`; earlier first on ties.
    fn take_next(&mut self, bucket: &BucketKey) -> Option<QueuedJob> {
        let jobs = self.lanes.get_mut(bucket)?;

        let mut seen: Vec<&ActionId> = Vec::new();
        let mut best: Option<(usize, Priority, u64)> = None;
        for (index, job) in jobs.iter().enumerate() {
            if seen.contains(&&job.request.action_id) {
                continue;
            }
            seen.push(&job.request.action_id);

            let candidate = (index, job.request.priority, job.seq);
            best = match best {
                Some((_, priority, seq))
                    if priority > candidate.1 || (priority == candidate.1 && seq < candidate.2) =>
                {
                    best
                }
                _ => Some(candidate),
            };
        }

        let (index, _, _) = best?;
        let job = jobs.remove(index)?;
        self.len -= 1;
        Some(job)
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    tracker: Arc<BucketTracker>,
    retry: RetryScheduler,
    observer: Arc<dyn DeliveryObserver>,
}

#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    pub fn new(
        tracker: Arc<BucketTracker>,
        retry: RetryScheduler,
        observer: Arc<dyn DeliveryObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                tracker,
                retry,
                observer,
            }),
        }
    }

    /// Queue `request` behind earlier jobs of the same action.
    ///
    /// Must be called from within a Tokio runtime; a worker is spawned when
    /// the request's lane was idle.
    pub fn enqueue(&self, request: DeliveryRequest) {
        let bucket = request.bucket.clone();
        let (spawn_worker, len) = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "enqueue");
            let seq = state.next_seq;
            state.next_seq += 1;
            state.len += 1;

            let job = QueuedJob {
                seq,
                request,
                enqueued_at: Instant::now(),
            };
            let spawn_worker = match state.lanes.get_mut(&bucket) {
                Some(lane) => {
                    lane.push_back(job);
                    false
                }
                None => {
                    state.lanes.insert(bucket.clone(), VecDeque::from([job]));
                    true
                }
            };
            (spawn_worker, state.len)
        };
        gauge!("courier_delivery_queue_len").set(len as f64);

        if spawn_worker {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.drain(bucket).await });
        }
    }

    /// Drop every queued job of `action_id`. A job already being attempted is
    /// stopped by the observer refusing its next attempt.
    pub fn cancel(&self, action_id: &ActionId) -> usize {
        let (removed, len) = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "cancel");
            let mut removed = 0;
            for jobs in state.lanes.values_mut() {
                let before = jobs.len();
                jobs.retain(|job| &job.request.action_id != action_id);
                removed += before - jobs.len();
            }
            state.len -= removed;
            (removed, state.len)
        };
        if removed > 0 {
            gauge!("courier_delivery_queue_len").set(len as f64);
            counter!("courier_delivery_total", "result" => "expired").increment(removed as u64);
            debug!(
                target = "courier::delivery",
                action_id = %action_id,
                removed,
                "Dropped queued deliveries"
            );
        }
        removed
    }

    /// Jobs waiting in any lane, excluding the ones currently being attempted.
    pub fn len(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "len").len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of lanes with a live worker.
    pub fn active_lanes(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "active_lanes")
            .lanes
            .len()
    }
}

impl QueueInner {
    async fn drain(self: Arc<Self>, bucket: BucketKey) {
        loop {
            let job = {
                let mut state = mutex_lock(&self.state, SOURCE, "drain");
                match state.take_next(&bucket) {
                    Some(job) => {
                        gauge!("courier_delivery_queue_len").set(state.len as f64);
                        job
                    }
                    None => {
                        state.lanes.remove(&bucket);
                        return;
                    }
                }
            };
            self.run(job).await;
        }
    }

    async fn run(&self, job: QueuedJob) {
        let QueuedJob {
            request,
            enqueued_at,
            ..
        } = job;
        let action_id = &request.action_id;
        let kind = request.kind;

        let result = self
            .retry
            .execute(Some(request.deadline), |attempt| {
                self.attempt(&request, attempt)
            })
            .await;

        match result {
            Ok(()) => {
                counter!("courier_delivery_total", "result" => "delivered").increment(1);
                debug!(
                    target = "courier::delivery",
                    action_id = %action_id,
                    kind = kind.as_str(),
                    bucket = %request.bucket,
                    elapsed_ms = enqueued_at.elapsed().as_millis() as u64,
                    "Delivery sent"
                );
                self.observer.delivered(action_id, kind);
            }
            Err(error) => {
                let error = error.into_delivery_error();
                if error == DeliveryError::deadline(INACTIVE) {
                    counter!("courier_delivery_total", "result" => "expired").increment(1);
                    return;
                }
                let result = if error.is_deadline() {
                    "expired"
                } else {
                    "dropped"
                };
                counter!("courier_delivery_total", "result" => result).increment(1);
                warn!(
                    target = "courier::delivery",
                    action_id = %action_id,
                    kind = kind.as_str(),
                    bucket = %request.bucket,
                    elapsed_ms = enqueued_at.elapsed().as_millis() as u64,
                    error = %error,
                    "Delivery dropped"
                );
                self.observer.dropped(action_id, kind, error);
            }
        }
    }

    async fn attempt(&self, request: &DeliveryRequest, attempt: u32) -> Result<(), DeliveryError> {
        if !self.observer.admit(&request.action_id, request.kind) {
            return Err(DeliveryError::deadline(INACTIVE));
        }

        let stage = request.kind.as_str();
        let waited = self
            .tracker
            .acquire(&request.bucket, request.deadline, stage)
            .await?;
        if !waited.is_zero() && !self.observer.admit(&request.action_id, request.kind) {
            return Err(DeliveryError::deadline(INACTIVE));
        }

        debug!(
            target = "courier::delivery",
            action_id = %request.action_id,
            kind = stage,
            attempt,
            wait_ms = waited.as_millis() as u64,
            "Attempting delivery"
        );

        let reply = timeout_at(request.deadline, (request.deliver)())
            .await
            .map_err(|_| DeliveryError::deadline(stage))?;
        self.tracker.observe(&request.bucket, &reply.metadata);
        reply.result
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;
    use std::time::Duration;

    use futures::FutureExt;
    use tokio::sync::mpsc;

    use super::*;
    use crate::application::buckets::BucketConfig;
    use crate::application::retry::RetryPolicy;
    use crate::domain::types::BucketMetadata;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
        refused: Mutex<Vec<ActionId>>,
    }

    impl RecordingObserver {
        fn events(&self) -> Vec<String> {
            self.events.lock().expect("events lock").clone()
        }
    }

    impl DeliveryObserver for RecordingObserver {
        fn admit(&self, action_id: &ActionId, _kind: DeliveryKind) -> bool {
            !self.refused.lock().expect("refused lock").contains(action_id)
        }

        fn delivered(&self, action_id: &ActionId, kind: DeliveryKind) {
            self.events
                .lock()
                .expect("events lock")
                .push(format!("delivered {action_id} {}", kind.as_str()));
        }

        fn dropped(&self, action_id: &ActionId, kind: DeliveryKind, error: DeliveryError) {
            self.events
                .lock()
                .expect("events lock")
                .push(format!("dropped {action_id} {} {error}", kind.as_str()));
        }
    }

    fn queue(observer: Arc<RecordingObserver>) -> (DeliveryQueue, Arc<BucketTracker>) {
        let tracker = Arc::new(BucketTracker::new(BucketConfig {
            route_limit: NonZeroU32::new(100).expect("non-zero"),
            ..BucketConfig::default()
        }));
        let retry = RetryScheduler::new(RetryPolicy {
            max_attempts: NonZeroU32::new(3).expect("non-zero"),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        });
        (
            DeliveryQueue::new(tracker.clone(), retry, observer),
            tracker,
        )
    }

    fn recording(
        tx: &mpsc::UnboundedSender<(String, Instant)>,
        label: &str,
        reply: TransportReply,
    ) -> DeliveryFn {
        let tx = tx.clone();
        let label = label.to_string();
        Arc::new(move || {
            let _ = tx.send((label.clone(), Instant::now()));
            let reply = reply.clone();
            async move { reply }.boxed()
        })
    }

    fn request(
        action: &str,
        bucket: &BucketKey,
        kind: DeliveryKind,
        priority: Priority,
        deliver: DeliveryFn,
    ) -> DeliveryRequest {
        DeliveryRequest {
            action_id: ActionId::from(action),
            bucket: bucket.clone(),
            kind,
            priority,
            deadline: Instant::now() + Duration::from_secs(60),
            deliver,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_of_one_action_leave_in_order() {
        let observer = Arc::new(RecordingObserver::default());
        let (queue, _) = queue(observer.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bucket = BucketKey::follow_up(&ActionId::from("a"));
        let ok = TransportReply::delivered(BucketMetadata::default());

        queue.enqueue(request(
            "a",
            &bucket,
            DeliveryKind::Finalize,
            Priority::LOW,
            recording(&tx, "finalize", ok.clone()),
        ));
        queue.enqueue(request(
            "a",
            &bucket,
            DeliveryKind::Append,
            Priority::HIGH,
            recording(&tx, "append-1", ok.clone()),
        ));
        queue.enqueue(request(
            "a",
            &bucket,
            DeliveryKind::Append,
            Priority::HIGH,
            recording(&tx, "append-2", ok),
        ));
        settle().await;

        let mut order = Vec::new();
        while let Ok((label, _)) = rx.try_recv() {
            order.push(label);
        }
        assert_eq!(order, vec!["finalize", "append-1", "append-2"]);
        assert!(queue.is_empty());
        assert_eq!(queue.active_lanes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn priority_reorders_across_actions_sharing_a_bucket() {
        let observer = Arc::new(RecordingObserver::default());
        let (queue, tracker) = queue(observer);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bucket = BucketKey::new("follow_up", "shared");
        let ok = TransportReply::delivered(BucketMetadata::default());

        // Hold the lane so every job is queued before the worker picks one.
        tracker.observe(
            &bucket,
            &BucketMetadata {
                remaining: Some(0),
                reset_after: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        );

        queue.enqueue(request(
            "low",
            &bucket,
            DeliveryKind::Finalize,
            Priority::LOW,
            recording(&tx, "low", ok.clone()),
        ));
        settle().await;
        queue.enqueue(request(
            "normal",
            &bucket,
            DeliveryKind::Finalize,
            Priority::NORMAL,
            recording(&tx, "normal", ok.clone()),
        ));
        queue.enqueue(request(
            "high",
            &bucket,
            DeliveryKind::Finalize,
            Priority::HIGH,
            recording(&tx, "high", ok),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut order = Vec::new();
        while let Ok((label, _)) = rx.try_recv() {
            order.push(label);
        }
        // `low` was already taken by the worker when the others arrived.
        assert_eq!(order, vec!["low", "high", "normal"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_delays_the_first_attempt() {
        let observer = Arc::new(RecordingObserver::default());
        let (queue, tracker) = queue(observer.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bucket = BucketKey::follow_up(&ActionId::from("c"));

        tracker.observe(
            &bucket,
            &BucketMetadata {
                remaining: Some(0),
                reset_after: Some(Duration::from_millis(2_000)),
                ..Default::default()
            },
        );

        let started = Instant::now();
        queue.enqueue(request(
            "c",
            &bucket,
            DeliveryKind::Finalize,
            Priority::NORMAL,
            recording(
                &tx,
                "finalize",
                TransportReply::delivered(BucketMetadata::default()),
            ),
        ));

        let (label, sent_at) = rx.recv().await.expect("delivery attempted");
        assert_eq!(label, "finalize");
        assert_eq!(sent_at - started, Duration::from_millis(2_000));
        settle().await;
        assert!(rx.try_recv().is_err(), "exactly one attempt");
        assert_eq!(observer.events(), vec!["delivered c finalize"]);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_dropped_and_reported() {
        let observer = Arc::new(RecordingObserver::default());
        let (queue, _) = queue(observer.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let bucket = BucketKey::follow_up(&ActionId::from("d"));

        queue.enqueue(request(
            "d",
            &bucket,
            DeliveryKind::Append,
            Priority::NORMAL,
            recording(
                &tx,
                "append",
                TransportReply::failed(
                    BucketMetadata::default(),
                    DeliveryError::permanent(Some(404), "unknown message"),
                ),
            ),
        ));
        settle().await;

        let events = observer.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("dropped d append"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_queued_jobs_and_refused_jobs_stay_silent() {
        let observer = Arc::new(RecordingObserver::default());
        let (queue, tracker) = queue(observer.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bucket = BucketKey::follow_up(&ActionId::from("e"));
        let ok = TransportReply::delivered(BucketMetadata::default());

        tracker.observe(
            &bucket,
            &BucketMetadata {
                remaining: Some(0),
                reset_after: Some(Duration::from_millis(500)),
                ..Default::default()
            },
        );
        for label in ["first", "second", "third"] {
            queue.enqueue(request(
                "e",
                &bucket,
                DeliveryKind::Append,
                Priority::NORMAL,
                recording(&tx, label, ok.clone()),
            ));
        }
        settle().await;

        // The worker holds `first` while it waits on the bucket.
        assert_eq!(queue.cancel(&ActionId::from("e")), 2);
        assert_eq!(queue.cancel(&ActionId::from("e")), 0);
        observer
            .refused
            .lock()
            .expect("refused lock")
            .push(ActionId::from("e"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert!(observer.events().is_empty());
        assert!(queue.is_empty());
    }
}
