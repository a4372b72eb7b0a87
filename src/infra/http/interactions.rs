use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
};
use courier_api_types::{DispatchReceipt, HealthReport, InboundAction};

use crate::application::{coordinator::Dispatch, error::HttpError};

use super::HttpState;

const SOURCE: &str = "infra::http::interactions";

pub(super) async fn accept(
    State(state): State<HttpState>,
    body: Result<Json<InboundAction>, JsonRejection>,
) -> Result<(StatusCode, Json<DispatchReceipt>), HttpError> {
    let Json(action) = body.map_err(|rejection| {
        HttpError::from_error(
            SOURCE,
            rejection.status(),
            "invalid_action",
            "Request body is not a valid action",
            &rejection,
        )
        .with_hint("Expected JSON with `action_id`, `handler` and `token`")
    })?;

    if action.action_id.trim().is_empty() {
        return Err(HttpError::new(
            SOURCE,
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_action",
            "`action_id` must not be empty",
            "empty action id",
        ));
    }

    let action_id = action.action_id.clone();
    let dispatch = state.coordinator.dispatch(action)?;
    let status = match dispatch {
        Dispatch::Started { .. } => StatusCode::ACCEPTED,
        Dispatch::Duplicate { .. } => StatusCode::OK,
    };
    Ok((status, Json(dispatch.receipt(&action_id))))
}

pub(super) async fn health(State(state): State<HttpState>) -> Json<HealthReport> {
    Json(state.coordinator.health())
}
