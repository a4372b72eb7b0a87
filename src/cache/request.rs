//! Request-scoped document cache.
//!
//! Every inbound action gets its own scope. Starting a scope discards whatever
//! a previous scope with the same id cached, and dropping the [`ScopeGuard`]
//! removes the scope entirely, so nothing leaks from one action into the next
//! even when a handler fails or panics.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use metrics::counter;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::CacheError;
use crate::application::repos::{DocumentStore, StoreError};
use crate::domain::types::ActionId;
use crate::util::lock::mutex_lock;

const SOURCE: &str = "cache::request";

#[derive(Debug, Clone)]
struct CachedDocument {
    value: Value,
    loaded_at: Instant,
}

#[derive(Debug, Default)]
struct ScopeEntries {
    documents: Mutex<HashMap<String, CachedDocument>>,
}

impl ScopeEntries {
    fn clear(&self) {
        mutex_lock(&self.documents, SOURCE, "clear").clear();
    }
}

type Scopes = DashMap<ActionId, Arc<ScopeEntries>>;

pub struct RequestCache {
    store: Arc<dyn DocumentStore>,
    scopes: Arc<Scopes>,
}

impl RequestCache {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            scopes: Arc::new(DashMap::new()),
        }
    }

    /// Open a fresh scope for `action_id`, clearing any previous one.
    pub fn begin(&self, action_id: &ActionId) -> ScopeGuard {
        let entries = Arc::new(ScopeEntries::default());
        if let Some(previous) = self.scopes.insert(action_id.clone(), entries.clone()) {
            previous.clear();
            debug!(
                target = "courier::cache",
                action_id = %action_id,
                "Replaced stale request scope"
            );
        }

        ScopeGuard {
            cache: ScopedCache {
                action_id: action_id.clone(),
                entries,
                store: self.store.clone(),
            },
            scopes: self.scopes.clone(),
        }
    }

    /// Number of open scopes.
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

/// Closes its scope on drop.
pub struct ScopeGuard {
    cache: ScopedCache,
    scopes: Arc<Scopes>,
}

impl ScopeGuard {
    pub fn cache(&self) -> ScopedCache {
        self.cache.clone()
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let mine = &self.cache.entries;
        mine.clear();
        self.scopes
            .remove_if(&self.cache.action_id, |_, current| Arc::ptr_eq(current, mine));
    }
}

/// Read-through view of one action's scope.
#[derive(Clone)]
pub struct ScopedCache {
    action_id: ActionId,
    entries: Arc<ScopeEntries>,
    store: Arc<dyn DocumentStore>,
}

impl ScopedCache {
    pub fn action_id(&self) -> &ActionId {
        &self.action_id
    }

    /// Cached value for `key`, or the loader's result on a miss.
    ///
    /// Only successful loads are cached.
    pub async fn get_with<F, Fut>(&self, key: &str, loader: F) -> Result<Value, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, StoreError>>,
    {
        if let Some(value) = self.cached(key) {
            return Ok(value);
        }

        let value = loader().await.map_err(|source| CacheError::Load {
            key: key.to_string(),
            source,
        })?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Read `key` through the scope from the document store.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        if let Some(value) = self.cached(key) {
            return Ok(Some(value));
        }

        let loaded = self
            .store
            .load(key)
            .await
            .map_err(|source| CacheError::Load {
                key: key.to_string(),
                source,
            })?;
        if let Some(value) = loaded.as_ref() {
            self.insert(key, value.clone());
        }
        Ok(loaded)
    }

    /// Write `value` to the store, then cache it for the rest of the scope.
    pub async fn save(&self, key: &str, value: Value) -> Result<(), CacheError> {
        self.store
            .save(key, &value)
            .await
            .map_err(|source| CacheError::Save {
                key: key.to_string(),
                source,
            })?;
        self.insert(key, value);
        Ok(())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries.documents, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, key: &str) -> Option<Value> {
        let hit = mutex_lock(&self.entries.documents, SOURCE, "get")
            .get(key)
            .map(|document| (document.value.clone(), document.loaded_at));
        match hit {
            Some((value, loaded_at)) => {
                counter!("courier_cache_request_hit_total").increment(1);
                trace!(
                    target = "courier::cache",
                    action_id = %self.action_id,
                    key,
                    age_ms = loaded_at.elapsed().as_millis() as u64,
                    "Request cache hit"
                );
                Some(value)
            }
            None => {
                counter!("courier_cache_request_miss_total").increment(1);
                None
            }
        }
    }

    fn insert(&self, key: &str, value: Value) {
        mutex_lock(&self.entries.documents, SOURCE, "insert").insert(
            key.to_string(),
            CachedDocument {
                value,
                loaded_at: Instant::now(),
            },
        );
    }
}
