//! Rate-limit bucket accounting.
//!
//! Every reservation passes two checks: the global bucket shared by all
//! outbound calls, and the bucket of the specific route. Local counts are
//! only a prediction; whatever the platform reports through
//! [`BucketTracker::observe`] replaces them.

use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use metrics::histogram;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::domain::error::DeliveryError;
use crate::domain::types::{BucketKey, BucketMetadata};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "application::buckets";

const DEFAULT_ROUTE_LIMIT: u32 = 5;
const DEFAULT_ROUTE_WINDOW: Duration = Duration::from_millis(5_000);
const DEFAULT_GLOBAL_LIMIT: u32 = 50;
const DEFAULT_GLOBAL_WINDOW: Duration = Duration::from_millis(1_000);
const DEFAULT_IDLE_EVICTION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct BucketConfig {
    /// Quota assumed for a route bucket until the platform reports one.
    pub route_limit: NonZeroU32,
    pub route_window: Duration,
    pub global_limit: NonZeroU32,
    pub global_window: Duration,
    /// How long past its reset an untouched route bucket is kept.
    pub idle_eviction: Duration,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            route_limit: NonZeroU32::new(DEFAULT_ROUTE_LIMIT).unwrap_or(NonZeroU32::MIN),
            route_window: DEFAULT_ROUTE_WINDOW,
            global_limit: NonZeroU32::new(DEFAULT_GLOBAL_LIMIT).unwrap_or(NonZeroU32::MIN),
            global_window: DEFAULT_GLOBAL_WINDOW,
            idle_eviction: DEFAULT_IDLE_EVICTION,
        }
    }
}

#[derive(Debug, Clone)]
struct BucketState {
    limit: u32,
    remaining: u32,
    window: Duration,
    reset_at: Instant,
    bucket_id: Option<String>,
}

impl BucketState {
    fn fresh(limit: u32, window: Duration, now: Instant) -> Self {
        Self {
            limit,
            remaining: limit,
            window,
            reset_at: now + window,
            bucket_id: None,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now >= self.reset_at {
            self.remaining = self.limit;
            self.reset_at = now + self.window;
        }
    }

    fn wait(&self, now: Instant) -> Duration {
        if self.remaining > 0 {
            Duration::ZERO
        } else {
            self.reset_at.saturating_duration_since(now)
        }
    }

    fn snapshot(&self, now: Instant) -> BucketSnapshot {
        BucketSnapshot {
            limit: self.limit,
            remaining: self.remaining,
            reset_in: self.reset_at.saturating_duration_since(now),
            bucket_id: self.bucket_id.clone(),
        }
    }
}

/// Point-in-time view of one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub reset_in: Duration,
    pub bucket_id: Option<String>,
}

pub struct BucketTracker {
    config: BucketConfig,
    routes: DashMap<BucketKey, BucketState>,
    global: Mutex<BucketState>,
}

impl BucketTracker {
    pub fn new(config: BucketConfig) -> Self {
        let global = BucketState::fresh(
            config.global_limit.get(),
            config.global_window,
            Instant::now(),
        );
        Self {
            config,
            routes: DashMap::new(),
            global: Mutex::new(global),
        }
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Try to take one slot from `key` and from the global bucket.
    ///
    /// Returns zero when the slot was taken. Otherwise nothing is decremented
    /// and the result is how long to wait before asking again.
    pub fn reserve(&self, key: &BucketKey) -> Duration {
        let now = Instant::now();

        // The route entry guard stays alive while the global lock is held, so
        // both checks and both decrements form one critical section per key.
        let mut route = self.routes.entry(key.clone()).or_insert_with(|| {
            BucketState::fresh(
                self.config.route_limit.get(),
                self.config.route_window,
                now,
            )
        });
        route.roll(now);

        let mut global = mutex_lock(&self.global, SOURCE, "reserve");
        global.roll(now);

        let wait = route.wait(now).max(global.wait(now));
        if wait.is_zero() {
            route.remaining -= 1;
            global.remaining -= 1;
        } else {
            debug!(
                target = "courier::buckets",
                bucket = %key,
                wait_ms = wait.as_millis() as u64,
                route_remaining = route.remaining,
                global_remaining = global.remaining,
                "Bucket exhausted"
            );
        }
        wait
    }

    /// Wait until a slot in `key` is reserved, giving up once the wait would
    /// reach `deadline`. Returns how long the caller waited.
    pub async fn acquire(
        &self,
        key: &BucketKey,
        deadline: Instant,
        stage: &'static str,
    ) -> Result<Duration, DeliveryError> {
        let started = Instant::now();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(DeliveryError::deadline(stage));
            }
            let wait = self.reserve(key);
            if wait.is_zero() {
                let waited = started.elapsed();
                histogram!("courier_bucket_wait_ms").record(waited.as_secs_f64() * 1_000.0);
                return Ok(waited);
            }
            if now + wait >= deadline {
                return Err(DeliveryError::deadline(stage));
            }
            sleep(wait).await;
        }
    }

    /// Overwrite local predictions with what the platform reported.
    pub fn observe(&self, key: &BucketKey, metadata: &BucketMetadata) {
        if metadata.is_empty() {
            return;
        }
        let now = Instant::now();

        if metadata.global {
            let retry_after = metadata
                .retry_after
                .or(metadata.reset_after)
                .unwrap_or(self.config.global_window);
            let mut global = mutex_lock(&self.global, SOURCE, "observe.global");
            global.remaining = 0;
            global.reset_at = now + retry_after;
            warn!(
                target = "courier::buckets",
                bucket = %key,
                retry_after_ms = retry_after.as_millis() as u64,
                "Global rate limit reported by platform"
            );
            return;
        }

        let mut route = self.routes.entry(key.clone()).or_insert_with(|| {
            BucketState::fresh(
                self.config.route_limit.get(),
                self.config.route_window,
                now,
            )
        });
        if let Some(limit) = metadata.limit {
            route.limit = limit;
        }
        if let Some(remaining) = metadata.remaining {
            route.remaining = remaining;
            // Without a reported reset, a lapsed window would roll this count away.
            if metadata.reset_after.is_none() && now >= route.reset_at {
                route.reset_at = now + route.window;
            }
        }
        if let Some(reset_after) = metadata.reset_after {
            route.reset_at = now + reset_after;
        }
        if let Some(retry_after) = metadata.retry_after {
            route.remaining = 0;
            route.reset_at = now + retry_after;
        }
        if let Some(bucket_id) = metadata.bucket_id.as_ref() {
            route.bucket_id = Some(bucket_id.clone());
        }

        debug!(
            target = "courier::buckets",
            bucket = %key,
            remaining = route.remaining,
            limit = route.limit,
            reset_in_ms = route.reset_at.saturating_duration_since(now).as_millis() as u64,
            "Bucket observed"
        );
    }

    /// Drop route buckets nobody has needed for a while; returns how many went.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let idle = self.config.idle_eviction;
        let before = self.routes.len();
        self.routes.retain(|_, state| now < state.reset_at + idle);
        before.saturating_sub(self.routes.len())
    }

    pub fn snapshot(&self, key: &BucketKey) -> Option<BucketSnapshot> {
        let now = Instant::now();
        self.routes.get(key).map(|state| state.snapshot(now))
    }

    pub fn global_snapshot(&self) -> BucketSnapshot {
        mutex_lock(&self.global, SOURCE, "global_snapshot").snapshot(Instant::now())
    }

    /// Number of tracked route buckets.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn tracker(route_limit: u32, window_ms: u64) -> BucketTracker {
        BucketTracker::new(BucketConfig {
            route_limit: NonZeroU32::new(route_limit).expect("non-zero"),
            route_window: Duration::from_millis(window_ms),
            global_limit: NonZeroU32::new(1_000).expect("non-zero"),
            global_window: Duration::from_millis(1_000),
            idle_eviction: Duration::from_secs(10),
        })
    }

    fn key(major: &str) -> BucketKey {
        BucketKey::new("follow_up", major)
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_reservation_waits_until_reset() {
        let tracker = tracker(5, 5_000);
        let key = key("a");

        for _ in 0..5 {
            assert_eq!(tracker.reserve(&key), Duration::ZERO);
        }

        let wait = tracker.reserve(&key);
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_millis(5_000));

        tokio::time::advance(wait).await;
        assert_eq!(tracker.reserve(&key), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_reservation_does_not_decrement() {
        let tracker = tracker(1, 1_000);
        let key = key("a");

        assert_eq!(tracker.reserve(&key), Duration::ZERO);
        assert!(tracker.reserve(&key) > Duration::ZERO);
        assert!(tracker.reserve(&key) > Duration::ZERO);

        let snapshot = tracker.snapshot(&key).expect("bucket tracked");
        assert_eq!(snapshot.remaining, 0);
        assert_eq!(snapshot.limit, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn global_bucket_applies_across_routes() {
        let tracker = BucketTracker::new(BucketConfig {
            route_limit: NonZeroU32::new(10).expect("non-zero"),
            route_window: Duration::from_secs(5),
            global_limit: NonZeroU32::new(2).expect("non-zero"),
            global_window: Duration::from_secs(1),
            idle_eviction: Duration::from_secs(10),
        });

        assert_eq!(tracker.reserve(&key("a")), Duration::ZERO);
        assert_eq!(tracker.reserve(&key("b")), Duration::ZERO);

        let wait = tracker.reserve(&key("c"));
        assert!(wait > Duration::ZERO);
        assert_eq!(
            tracker.snapshot(&key("c")).expect("tracked").remaining,
            10,
            "route slot must not be consumed when the global check fails"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn observed_metadata_overrides_prediction() {
        let tracker = tracker(5, 5_000);
        let key = key("a");

        assert_eq!(tracker.reserve(&key), Duration::ZERO);
        tracker.observe(
            &key,
            &BucketMetadata {
                remaining: Some(0),
                reset_after: Some(Duration::from_millis(2_000)),
                bucket_id: Some("abcd".to_string()),
                ..Default::default()
            },
        );

        assert_eq!(tracker.reserve(&key), Duration::from_millis(2_000));
        assert_eq!(
            tracker.snapshot(&key).expect("tracked").bucket_id.as_deref(),
            Some("abcd")
        );

        tracker.observe(
            &key,
            &BucketMetadata {
                remaining: Some(3),
                ..Default::default()
            },
        );
        assert_eq!(tracker.reserve(&key), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn reported_remaining_survives_a_lapsed_window() {
        let tracker = tracker(5, 1_000);
        let key = key("a");

        assert_eq!(tracker.reserve(&key), Duration::ZERO);
        tokio::time::advance(Duration::from_millis(1_500)).await;
        tracker.observe(
            &key,
            &BucketMetadata {
                remaining: Some(1),
                ..Default::default()
            },
        );

        assert_eq!(tracker.reserve(&key), Duration::ZERO);
        assert_eq!(tracker.reserve(&key), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn global_rate_limit_blocks_every_route() {
        let tracker = tracker(5, 5_000);

        tracker.observe(
            &key("a"),
            &BucketMetadata {
                retry_after: Some(Duration::from_millis(750)),
                global: true,
                ..Default::default()
            },
        );

        assert_eq!(tracker.reserve(&key("b")), Duration::from_millis(750));
        tokio::time::advance(Duration::from_millis(750)).await;
        assert_eq!(tracker.reserve(&key("b")), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_sleeps_through_exhausted_bucket() {
        let tracker = tracker(5, 5_000);
        let key = key("a");
        tracker.observe(
            &key,
            &BucketMetadata {
                remaining: Some(0),
                reset_after: Some(Duration::from_millis(2_000)),
                ..Default::default()
            },
        );

        let deadline = Instant::now() + Duration::from_secs(10);
        let waited = tracker
            .acquire(&key, deadline, "append")
            .await
            .expect("slot frees up before the deadline");
        assert_eq!(waited, Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_refuses_waits_past_deadline() {
        let tracker = tracker(1, 5_000);
        let key = key("a");
        assert_eq!(tracker.reserve(&key), Duration::ZERO);

        let started = Instant::now();
        let err = tracker
            .acquire(&key, started + Duration::from_secs(1), "ack")
            .await
            .expect_err("reset is beyond the deadline");
        assert_eq!(err, DeliveryError::deadline("ack"));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_buckets_are_swept() {
        let tracker = tracker(5, 1_000);
        tracker.reserve(&key("a"));
        tracker.reserve(&key("b"));
        assert_eq!(tracker.len(), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(tracker.sweep_idle(), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(tracker.sweep_idle(), 2);
        assert!(tracker.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_never_share_the_last_slot() {
        let tracker = Arc::new(tracker(5, 60_000));
        let key = key("shared");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let tracker = tracker.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { tracker.reserve(&key) }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.expect("task should finish").is_zero() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }
}
