//! Handler registration.
//!
//! How a handler is acknowledged is part of its registration. Handlers that
//! always produce more than one message register as deferred and never try
//! the immediate path.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_api_types::MessagePayload;
use thiserror::Error;

use super::context::ActionContext;
use super::coordinator::CoordinatorError;
use crate::cache::{CacheError, ViewError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Expected to finish within `estimate`; answered with the final payload
    /// when that fits inside the hard deadline.
    Immediate { estimate: Duration },
    /// Always acknowledged with a placeholder first.
    Deferred,
}

/// What a handler produced: the primary response plus extra messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub content: MessagePayload,
    pub follow_ups: Vec<MessagePayload>,
}

impl Reply {
    pub fn new(content: MessagePayload) -> Self {
        Self {
            content,
            follow_ups: Vec::new(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(MessagePayload::text(content))
    }

    pub fn with_follow_up(mut self, payload: MessagePayload) -> Self {
        self.follow_ups.push(payload);
        self
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    View(#[from] ViewError),
    #[error(transparent)]
    FollowUp(#[from] CoordinatorError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: ActionContext) -> Result<Reply, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: ActionContext) -> Result<Reply, HandlerError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Clone)]
pub struct RegisteredHandler {
    pub mode: ResponseMode,
    pub handler: Arc<dyn ActionHandler>,
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        name: impl Into<String>,
        mode: ResponseMode,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        self.handlers
            .insert(name.into(), RegisteredHandler { mode, handler });
        self
    }

    pub fn register_immediate(
        self,
        name: impl Into<String>,
        estimate: Duration,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        self.register(name, ResponseMode::Immediate { estimate }, handler)
    }

    /// Handlers that send more than one message always take the deferred path.
    pub fn register_multi_message(
        self,
        name: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        self.register(name, ResponseMode::Deferred, handler)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredHandler> {
        self.handlers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
