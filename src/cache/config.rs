//! Cache configuration.
//!
//! Controls the materialized view cache via the `[cache]` section of
//! `courier.toml`. The request-scoped cache has no tunables.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_COMPLETENESS_THRESHOLD: f64 = 0.8;
const DEFAULT_RESYNC_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_VIEW_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Views observed below this completeness are resynced before being read.
    pub completeness_threshold: f64,
    /// Upper bound for one resync.
    pub resync_timeout_ms: u64,
    /// Maximum views held before LRU eviction.
    pub view_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            completeness_threshold: DEFAULT_COMPLETENESS_THRESHOLD,
            resync_timeout_ms: DEFAULT_RESYNC_TIMEOUT_MS,
            view_capacity: DEFAULT_VIEW_CAPACITY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            completeness_threshold: settings.completeness_threshold,
            resync_timeout_ms: settings.resync_timeout_ms,
            view_capacity: settings.view_capacity.get(),
        }
    }
}

impl CacheConfig {
    pub fn resync_timeout(&self) -> Duration {
        Duration::from_millis(self.resync_timeout_ms)
    }

    /// Returns the view capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn view_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.view_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}
