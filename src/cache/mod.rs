//! Courier cache system.
//!
//! Two tiers sit between handlers and the storage collaborators:
//!
//! - **Request scope**: read-through document cache, one scope per inbound
//!   action, emptied when the action starts and closed when it ends.
//! - **Materialized views**: longer-lived derived data, resynced in bulk when
//!   its observed completeness falls below a threshold.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! completeness_threshold = 0.8
//! resync_timeout_ms = 2000
//! view_capacity = 256
//! ```

mod config;
mod request;
mod views;

use thiserror::Error;

use crate::application::repos::StoreError;

pub use config::CacheConfig;
pub use request::{RequestCache, ScopeGuard, ScopedCache};
pub use views::{MaterializedViewCache, View};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("failed to load `{key}`: {source}")]
    Load { key: String, source: StoreError },
    #[error("failed to save `{key}`: {source}")]
    Save { key: String, source: StoreError },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewError {
    #[error("view `{key}` is unavailable: {reason}")]
    Unavailable { key: String, reason: String },
}
