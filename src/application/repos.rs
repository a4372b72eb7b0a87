//! Collaborator traits for the storage behind the caches.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("document `{key}` is malformed: {message}")]
    Malformed { key: String, message: String },
    #[error("storage timeout")]
    Timeout,
}

impl StoreError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Wholesale document storage read through the request-scoped cache.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn save(&self, key: &str, value: &Value) -> Result<(), StoreError>;
}

/// Result of rebuilding a materialized view from its source.
#[derive(Debug, Clone, PartialEq)]
pub struct ResyncedView {
    pub data: Value,
    /// Completeness reported by the source; `None` means fully complete.
    pub completeness: Option<f64>,
}

impl ResyncedView {
    pub fn complete(data: Value) -> Self {
        Self {
            data,
            completeness: None,
        }
    }
}

/// Authoritative data behind a materialized view.
#[async_trait]
pub trait ViewSource: Send + Sync {
    async fn resync(&self, view: &str) -> Result<ResyncedView, StoreError>;

    /// Completeness of `data` as seen now, in `[0, 1]`. `None` keeps the value
    /// recorded at the last resync.
    fn completeness_of(&self, _view: &str, _data: &Value) -> Option<f64> {
        None
    }
}
