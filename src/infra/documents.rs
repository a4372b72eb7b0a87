//! In-memory document store.
//!
//! Documents are keyed by `"{view}:{id}"`. The materialized view `view` is the
//! object of every document under that prefix, and its completeness is the
//! share of those documents a cached copy still contains.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::application::repos::{DocumentStore, ResyncedView, StoreError, ViewSource};

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<String, Value>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.documents.insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.documents.remove(key).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn members(&self, view: &str) -> Map<String, Value> {
        let prefix = format!("{view}:");
        self.documents
            .iter()
            .filter_map(|entry| {
                entry
                    .key()
                    .strip_prefix(&prefix)
                    .map(|id| (id.to_string(), entry.value().clone()))
            })
            .collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.documents.get(key).map(|entry| entry.value().clone()))
    }

    async fn save(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::Malformed {
                key: key.to_string(),
                message: "document key must not be empty".to_string(),
            });
        }
        self.documents.insert(key.to_string(), value.clone());
        Ok(())
    }
}

#[async_trait]
impl ViewSource for MemoryDocumentStore {
    async fn resync(&self, view: &str) -> Result<ResyncedView, StoreError> {
        Ok(ResyncedView::complete(Value::Object(self.members(view))))
    }

    fn completeness_of(&self, view: &str, data: &Value) -> Option<f64> {
        let cached = data.as_object()?;
        let prefix = format!("{view}:");
        let mut total = 0usize;
        let mut present = 0usize;
        for entry in self.documents.iter() {
            if let Some(id) = entry.key().strip_prefix(&prefix) {
                total += 1;
                if cached.get(id) == Some(entry.value()) {
                    present += 1;
                }
            }
        }
        if total == 0 {
            return Some(1.0);
        }
        Some(present as f64 / total as f64)
    }
}
