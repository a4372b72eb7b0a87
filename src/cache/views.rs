//! Materialized view cache with completeness-triggered resync.
//!
//! A view whose observed completeness is below the configured threshold is
//! rebuilt from its [`ViewSource`] before being returned. Resyncs are bounded
//! by a timeout and shared between concurrent readers of the same view. When
//! a resync fails, the best view available is returned instead of an error.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use lru::LruCache;
use metrics::counter;
use serde_json::Value;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use super::ViewError;
use super::config::CacheConfig;
use crate::application::repos::ViewSource;
use crate::util::lock::mutex_lock;

const SOURCE: &str = "cache::views";

#[derive(Debug, Clone)]
struct ViewEntry {
    data: Value,
    completeness: f64,
}

/// A view as handed to readers.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub data: Value,
    pub completeness: f64,
    /// Still below the threshold after the read; the resync failed or the
    /// source itself reported an incomplete view.
    pub incomplete: bool,
}

pub struct MaterializedViewCache {
    config: CacheConfig,
    entries: Mutex<LruCache<String, ViewEntry>>,
    resyncs: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl MaterializedViewCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = config.view_capacity_non_zero();
        Self {
            config,
            entries: Mutex::new(LruCache::new(capacity)),
            resyncs: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn get_view(&self, key: &str, source: &dyn ViewSource) -> Result<View, ViewError> {
        if let Some(view) = self.current(key, source).filter(|view| !view.incomplete) {
            return Ok(view);
        }

        let gate = self.resyncs.entry(key.to_string()).or_default().clone();
        let permit = gate.lock().await;

        // Another reader may have finished a resync while this one waited.
        let result = match self.current(key, source).filter(|view| !view.incomplete) {
            Some(view) => Ok(view),
            None => self.resync(key, source).await,
        };

        drop(permit);
        self.resyncs
            .remove_if(key, |_, current| Arc::ptr_eq(current, &gate) && Arc::strong_count(current) <= 2);
        result
    }

    /// Store a view built elsewhere.
    pub fn put(&self, key: &str, data: Value, completeness: f64) {
        mutex_lock(&self.entries, SOURCE, "put").put(
            key.to_string(),
            ViewEntry {
                data,
                completeness: completeness.clamp(0.0, 1.0),
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        mutex_lock(&self.entries, SOURCE, "invalidate").pop(key);
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current(&self, key: &str, source: &dyn ViewSource) -> Option<View> {
        let entry = mutex_lock(&self.entries, SOURCE, "get").get(key).cloned()?;
        let completeness = source
            .completeness_of(key, &entry.data)
            .map(|observed| observed.clamp(0.0, 1.0))
            .unwrap_or(entry.completeness);
        Some(View {
            data: entry.data,
            completeness,
            incomplete: completeness < self.config.completeness_threshold,
        })
    }

    async fn resync(&self, key: &str, source: &dyn ViewSource) -> Result<View, ViewError> {
        let started = Instant::now();
        let reason = match timeout(self.config.resync_timeout(), source.resync(key)).await {
            Ok(Ok(resynced)) => {
                let completeness = resynced.completeness.unwrap_or(1.0).clamp(0.0, 1.0);
                counter!("courier_view_resync_total", "result" => "ok").increment(1);
                debug!(
                    target = "courier::views",
                    view = key,
                    completeness,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "View resynced"
                );
                self.put(key, resynced.data.clone(), completeness);
                return Ok(View {
                    data: resynced.data,
                    completeness,
                    incomplete: completeness < self.config.completeness_threshold,
                });
            }
            Ok(Err(error)) => {
                counter!("courier_view_resync_total", "result" => "error").increment(1);
                error.to_string()
            }
            Err(_) => {
                counter!("courier_view_resync_total", "result" => "timeout").increment(1);
                format!(
                    "resync timed out after {}ms",
                    self.config.resync_timeout().as_millis()
                )
            }
        };

        // Fall back to the cached data, keeping the completeness that triggered the resync.
        match self.current(key, source) {
            Some(view) => {
                warn!(
                    target = "courier::views",
                    view = key,
                    completeness = view.completeness,
                    reason = %reason,
                    "Serving incomplete view after failed resync"
                );
                Ok(View {
                    incomplete: true,
                    ..view
                })
            }
            None => {
                warn!(
                    target = "courier::views",
                    view = key,
                    reason = %reason,
                    "View unavailable"
                );
                Err(ViewError::Unavailable {
                    key: key.to_string(),
                    reason,
                })
            }
        }
    }
}
