//! Error types for the IPTV gateway.
//!
//! One application-level taxonomy covers every failure the HTTP surface can
//! report. Locally recoverable failures (a single catalog endpoint, a single
//! probe, a single playlist file) are logged and skipped at their call sites
//! and never travel through this type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    BadInput(String),

    #[error("Invalid or missing admin API key")]
    Unauthorized,

    #[error("Upstream timed out")]
    UpstreamTimeout,

    #[error("Upstream error: {0}")]
    UpstreamStatus(u16),

    #[error("Stream is geo-restricted and bypass failed")]
    UpstreamGeoBlocked,

    #[error("Transcoder output not ready")]
    TranscodeUnavailable,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn bad_input<S: Into<String>>(message: S) -> Self {
        Self::BadInput(message.into())
    }

    pub fn forbidden<S: Into<String>>(message: S) -> Self {
        Self::Forbidden(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadInput(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::UpstreamStatus(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamGeoBlocked | AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::TranscodeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Http(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            AppError::Http(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal details go to the log, never to the client.
        let detail = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}
