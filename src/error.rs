//! Error taxonomy.
//!
//! A single `AppError` enum covers every failure kind and renders the
//! `{ error: { message, type, statusCode, details?, code? } }` envelope
//! directly via `IntoResponse`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;

use crate::broker::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation failed")]
    Validation { fields: Vec<FieldError> },

    #[error("authentication required")]
    AuthRequired,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited")]
    RateLimited,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream rejected: {0}")]
    UpstreamRejected(String),

    #[error("last traded price unavailable for {0}")]
    LtpUnavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error")]
    Internal(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            kind: "validation".to_string(),
        }
    }
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation {
            fields: vec![FieldError::new("", message.into())],
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::AuthRequired => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamRejected(_) => StatusCode::BAD_GATEWAY,
            AppError::LtpUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::Validation { .. } => "VALIDATION",
            AppError::AuthRequired => "AUTH_REQUIRED",
            AppError::Forbidden => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::RateLimited => "RATE_LIMITED",
            AppError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            AppError::UpstreamRejected(_) => "UPSTREAM_REJECTED",
            AppError::LtpUnavailable(_) => "LTP_UNAVAILABLE",
            AppError::Database(_) => "DATABASE",
            AppError::Internal(_) => "INTERNAL",
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            AppError::Validation { fields } => Some(serde_json::to_value(fields).ok()?),
            _ => None,
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Validation { .. } => "request failed validation".to_string(),
            AppError::AuthRequired => "authentication required".to_string(),
            AppError::Forbidden => "you do not have permission to perform this action".to_string(),
            AppError::NotFound(what) => format!("{what} not found"),
            AppError::Conflict(msg) => msg.clone(),
            AppError::RateLimited => "rate limit exceeded".to_string(),
            AppError::UpstreamUnavailable(msg) => msg.clone(),
            AppError::UpstreamRejected(msg) => msg.clone(),
            AppError::LtpUnavailable(symbol) => {
                format!("no cached last traded price for {symbol}")
            }
            AppError::Database(_) => "a database error occurred".to_string(),
            AppError::Internal(_) => "an internal error occurred".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, AppError::Internal(_) | AppError::Database(_)) {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }

        let status = self.status();
        let body = serde_json::json!({
            "error": {
                "message": self.message(),
                "type": self.kind(),
                "statusCode": status.as_u16(),
                "details": self.details(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Timeout | BrokerError::Network(_) | BrokerError::HttpServerError(_) => {
                AppError::UpstreamUnavailable(err.to_string())
            }
            BrokerError::HttpClientError(_) | BrokerError::Decode(_) => {
                AppError::UpstreamUnavailable(err.to_string())
            }
            BrokerError::BrokerRejected(msg) => AppError::UpstreamRejected(msg),
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
