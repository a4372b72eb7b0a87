//! Per-action context handed to every handler.

use std::sync::Arc;

use courier_api_types::{InboundAction, MessagePayload};
use serde_json::Value;

use super::coordinator::{CoordinatorError, InteractionCoordinator};
use super::repos::ViewSource;
use crate::cache::{MaterializedViewCache, ScopedCache, View, ViewError};
use crate::domain::types::ActionId;

/// Everything a handler may touch while servicing one action.
#[derive(Clone)]
pub struct ActionContext {
    action: Arc<InboundAction>,
    action_id: ActionId,
    documents: ScopedCache,
    views: Arc<MaterializedViewCache>,
    view_source: Arc<dyn ViewSource>,
    coordinator: InteractionCoordinator,
}

impl ActionContext {
    pub(crate) fn new(
        action: Arc<InboundAction>,
        documents: ScopedCache,
        views: Arc<MaterializedViewCache>,
        view_source: Arc<dyn ViewSource>,
        coordinator: InteractionCoordinator,
    ) -> Self {
        Self {
            action_id: documents.action_id().clone(),
            action,
            documents,
            views,
            view_source,
            coordinator,
        }
    }

    pub fn action_id(&self) -> &ActionId {
        &self.action_id
    }

    pub fn action(&self) -> &InboundAction {
        &self.action
    }

    pub fn payload(&self) -> &Value {
        &self.action.payload
    }

    /// Documents read through this action's cache scope.
    pub fn documents(&self) -> &ScopedCache {
        &self.documents
    }

    /// Read a materialized view from the default source.
    pub async fn view(&self, key: &str) -> Result<View, ViewError> {
        self.views.get_view(key, self.view_source.as_ref()).await
    }

    pub async fn view_from(&self, key: &str, source: &dyn ViewSource) -> Result<View, ViewError> {
        self.views.get_view(key, source).await
    }

    /// Send an extra message once the primary response is out.
    pub fn append(&self, payload: MessagePayload) -> Result<(), CoordinatorError> {
        self.coordinator.append(&self.action_id, payload)
    }
}
