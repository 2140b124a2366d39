//! API error taxonomy and HTTP response mapping.
//!
//! Errors local to one model never terminate the SSE stream; they surface
//! as per-model `error` events. Only whole-request failures (bad input,
//! auth, not found, busy, overloaded) become HTTP errors, carried by
//! [`ApiError`].

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Whole-request failures surfaced as HTTP errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed request body or message too large.
    #[error("invalid request: {0}")]
    Input(String),

    /// Credentials missing or mismatched.
    #[error("authentication required")]
    Auth,

    /// Unknown or expired session id.
    #[error("session not found")]
    NotFound,

    /// A generation is already active on this session.
    #[error("a generation is already active for this session")]
    BusySession,

    /// Session cap reached and every session is busy.
    #[error("server at capacity")]
    Overloaded,

    /// Server is draining for shutdown.
    #[error("shutting down")]
    ShuttingDown,

    /// Unexpected internal failure.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Input(_) => StatusCode::BAD_REQUEST,
            Self::Auth => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BusySession => StatusCode::CONFLICT,
            Self::Overloaded | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            Self::Input(detail) => json!({ "error": "invalid request", "detail": detail }),
            Self::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                json!({ "error": "internal error" })
            }
            other => json!({ "error": other.to_string() }),
        };

        let mut response = (status, Json(body)).into_response();
        match self {
            Self::Auth => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, "Basic".parse().expect("static header"));
            }
            Self::Overloaded | Self::ShuttingDown => {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, "30".parse().expect("static header"));
            }
            _ => {}
        }
        response
    }
}
