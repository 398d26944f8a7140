use std::sync::atomic::{AtomicBool, Ordering};

use axum::{Json, extract::rejection::JsonRejection, http::StatusCode, response::IntoResponse};
use pantau_domain::error::DomainError;
use serde::Serialize;
use thiserror::Error;

static EXPOSE_INTERNAL_DETAILS: AtomicBool = AtomicBool::new(false);

/// Internal error detail is only rendered when enabled (development).
pub fn expose_internal_details(enabled: bool) {
    EXPOSE_INTERNAL_DETAILS.store(enabled, Ordering::Relaxed);
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("validation failed")]
    InvalidFields(Vec<FieldError>),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("service unavailable")]
    Unavailable(String),
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::InvalidFields(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) | ApiError::InvalidFields(_) => "validation_error",
            ApiError::Unauthorized => "unauthorized",
            ApiError::NotFound => "not_found",
            ApiError::Conflict => "conflict",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn field_errors(&self) -> Vec<FieldError> {
        match self {
            ApiError::Validation(message) => vec![FieldError::new("request", message.clone())],
            ApiError::InvalidFields(errors) => errors.clone(),
            ApiError::Unavailable(detail) | ApiError::Internal(detail)
                if EXPOSE_INTERNAL_DETAILS.load(Ordering::Relaxed) =>
            {
                vec![FieldError::new("internal", detail.clone())]
            }
            _ => Vec::new(),
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(message) => ApiError::Validation(message),
            DomainError::NotFound => ApiError::NotFound,
            DomainError::Conflict => ApiError::Conflict,
            DomainError::Unavailable(detail) => ApiError::Unavailable(detail),
            DomainError::Upstream(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidFields(vec![FieldError::new("body", rejection.body_text())])
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    message: String,
    errors: Vec<FieldError>,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        }
        let body = ErrorEnvelope {
            message: self.to_string(),
            errors: self.field_errors(),
            code: self.error_code(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
pub struct Envelope<T> {
    pub message: String,
    pub data: T,
}

pub fn envelope<T: Serialize>(message: impl Into<String>, data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        message: message.into(),
        data,
    })
}
