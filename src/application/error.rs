use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::{application::coordinator::CoordinatorError, config::LoadError, infra::error::InfraError};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'static str>,
}

/// JSON error answered on the inbound surface.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    code: &'static str,
    public_message: String,
    hint: Option<&'static str>,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        code: &'static str,
        public_message: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            status,
            code,
            public_message: public_message.into(),
            hint: None,
            report: ErrorReport::from_message(source, status, detail),
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        code: &'static str,
        public_message: impl Into<String>,
        error: &dyn StdError,
    ) -> Self {
        Self {
            status,
            code,
            public_message: public_message.into(),
            hint: None,
            report: ErrorReport::from_error(source, status, error),
        }
    }

    pub fn with_hint(mut self, hint: &'static str) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.public_message,
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<CoordinatorError> for HttpError {
    fn from(error: CoordinatorError) -> Self {
        const SOURCE: &str = "infra::http::coordinator_error_to_http_error";
        match &error {
            CoordinatorError::UnknownHandler(name) => HttpError::new(
                SOURCE,
                StatusCode::NOT_FOUND,
                "unknown_handler",
                format!("No handler named `{name}`"),
                error.to_string(),
            )
            .with_hint("Check the `handler` field against the registered handlers"),
            CoordinatorError::AlreadyIssued(_) => HttpError::new(
                SOURCE,
                StatusCode::CONFLICT,
                "already_in_flight",
                "Action is already being processed",
                error.to_string(),
            ),
            CoordinatorError::UnknownToken(_) => HttpError::new(
                SOURCE,
                StatusCode::NOT_FOUND,
                "unknown_action",
                "Action is not live",
                error.to_string(),
            ),
            CoordinatorError::AlreadyAcknowledged(_)
            | CoordinatorError::AlreadyFinalized(_)
            | CoordinatorError::NotDeferred(_)
            | CoordinatorError::Closed(_)
            | CoordinatorError::Transition(_) => HttpError::from_error(
                SOURCE,
                StatusCode::CONFLICT,
                "invalid_state",
                "Action does not accept this operation",
                &error,
            ),
            CoordinatorError::Acknowledgment(_) => HttpError::from_error(
                SOURCE,
                StatusCode::BAD_GATEWAY,
                "acknowledgment_failed",
                "Platform rejected the acknowledgment",
                &error,
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Infra(InfraError::Transport { .. }) => StatusCode::BAD_GATEWAY,
            AppError::Infra(_) | AppError::Config(_) | AppError::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_failed",
            AppError::Infra(InfraError::Transport { .. }) => "platform_unavailable",
            AppError::Infra(_) | AppError::Config(_) | AppError::Unexpected(_) => "internal",
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "Request could not be processed",
            AppError::Infra(InfraError::Transport { .. }) => "Platform temporarily unavailable",
            AppError::Infra(InfraError::Configuration { .. }) | AppError::Config(_) => {
                "Service misconfigured"
            }
            AppError::Infra(InfraError::Telemetry(_)) => "Logging subsystem could not start",
            AppError::Infra(InfraError::Io(_)) => "I/O failure during request",
            AppError::Unexpected(_) => "Unexpected error occurred",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        HttpError::from_error(
            "application::error::AppError",
            status,
            self.code(),
            self.presentation_message(),
            &self,
        )
        .into_response()
    }
}
