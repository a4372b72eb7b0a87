//! Inbound HTTP surface.

mod interactions;
mod middleware;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use crate::application::coordinator::InteractionCoordinator;

pub use middleware::{REQUEST_ID_HEADER, RequestContext};

#[derive(Clone)]
pub struct HttpState {
    pub coordinator: InteractionCoordinator,
}

impl HttpState {
    pub fn new(coordinator: InteractionCoordinator) -> Self {
        Self { coordinator }
    }
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/interactions", post(interactions::accept))
        .route("/health", get(interactions::health))
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
        .with_state(state)
}
