//! At-most-once gate in front of every handler invocation.

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::types::ActionId;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration<H> {
    /// First sighting; the caller runs the handler and later records its result.
    First,
    /// Seen before. `result` is `None` while the first run is still in progress.
    Duplicate { result: Option<H> },
}

impl<H> Registration<H> {
    pub fn is_first(&self) -> bool {
        matches!(self, Registration::First)
    }
}

#[derive(Debug)]
struct Record<H> {
    first_seen_at: Instant,
    result: Option<H>,
}

/// Remembers action ids for a bounded window.
///
/// Records are dropped by [`IdempotencyGuard::sweep`] once they are older
/// than the retention window, whether or not a result was ever recorded.
pub struct IdempotencyGuard<H> {
    records: DashMap<ActionId, Record<H>>,
    retention: Duration,
}

impl<H: Clone> IdempotencyGuard<H> {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: DashMap::new(),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn check_and_register(&self, action_id: &ActionId) -> Registration<H> {
        match self.records.entry(action_id.clone()) {
            Entry::Occupied(record) => {
                debug!(
                    target = "courier::idempotency",
                    action_id = %action_id,
                    completed = record.get().result.is_some(),
                    "Duplicate action short-circuited"
                );
                Registration::Duplicate {
                    result: record.get().result.clone(),
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Record {
                    first_seen_at: Instant::now(),
                    result: None,
                });
                Registration::First
            }
        }
    }

    /// Attach the result of the first run. Returns `false` if the record was
    /// already swept.
    pub fn record_result(&self, action_id: &ActionId, result: H) -> bool {
        match self.records.get_mut(action_id) {
            Some(mut record) => {
                record.result = Some(result);
                true
            }
            None => false,
        }
    }

    /// Drop records first seen more than the retention window before `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let retention = self.retention;
        let before = self.records.len();
        self.records
            .retain(|_, record| now.saturating_duration_since(record.first_seen_at) < retention);
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(
                target = "courier::idempotency",
                removed,
                remaining = self.records.len(),
                "Idempotency records swept"
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
