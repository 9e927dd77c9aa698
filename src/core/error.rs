//! Error types and handling for the media gateway.
//!
//! This module provides a unified error type [`AppError`] that wraps various error sources
//! and implements proper HTTP response conversion. Errors raised before a response
//! has started are rendered here; failures after a stream has begun are framed
//! into the stream by [`crate::api::streaming`] instead.

use crate::core::error_types::{
    ERROR_TYPE_API, ERROR_TYPE_AUTHENTICATION, ERROR_TYPE_CHALLENGE, ERROR_TYPE_INVALID_REQUEST,
    ERROR_TYPE_NOT_FOUND, ERROR_TYPE_RATE_LIMIT, ERROR_TYPE_SIGNING, ERROR_TYPE_TIMEOUT,
    ERROR_TYPE_UPSTREAM, STATUS_ERROR, STATUS_FAIL, STATUS_UNAUTHORIZED,
};
use crate::core::logging::{get_identity, get_provider_context, get_request_id};
use axum::{
    body::Bytes,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the application.
///
/// All errors in the application should be converted to this type for consistent handling.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// Transport errors from the reqwest client, other than timeouts
    #[error("HTTP request error: {0}")]
    Request(#[source] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem errors from the local upload store
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or invalid caller credential
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Challenge token missing or rejected
    #[error("Challenge verification failed: {0}")]
    ChallengeFailed(String),

    /// No route prefix matched the request path
    #[error("No route for {0}")]
    RouteNotFound(String),

    /// Upstream failure; `body` is relayed verbatim when present
    #[error("Upstream error ({status}): {message}")]
    Upstream {
        status: StatusCode,
        message: String,
        body: Option<Bytes>,
    },

    /// Upstream did not start answering within the configured timeout
    #[error("Gateway timeout")]
    Timeout,

    /// Object-store credential or signing failure
    #[error("Couldn't get presigned URL for PutObject: {0}")]
    Signing(String),

    /// Request body exceeded the configured ceiling
    #[error("Payload too large: limit is {0} bytes")]
    PayloadTooLarge(usize),

    /// Client provided invalid data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Rate limit exceeded errors
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Upstream failure without a relayable body.
    pub fn upstream(status: StatusCode, message: impl Into<String>) -> Self {
        AppError::Upstream {
            status,
            message: message.into(),
            body: None,
        }
    }

    /// HTTP status this error renders with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Config(_)
            | AppError::Serialization(_)
            | AppError::Io(_)
            | AppError::Internal(_)
            | AppError::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Request(_) => StatusCode::BAD_GATEWAY,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::ChallengeFailed(_) => StatusCode::FORBIDDEN,
            AppError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Upstream { status, .. } => *status,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => ERROR_TYPE_AUTHENTICATION,
            AppError::ChallengeFailed(_) => ERROR_TYPE_CHALLENGE,
            AppError::RouteNotFound(_) => ERROR_TYPE_NOT_FOUND,
            AppError::Upstream { .. } => ERROR_TYPE_UPSTREAM,
            AppError::Request(_) => ERROR_TYPE_UPSTREAM,
            AppError::Timeout => ERROR_TYPE_TIMEOUT,
            AppError::Signing(_) => ERROR_TYPE_SIGNING,
            AppError::PayloadTooLarge(_) | AppError::BadRequest(_) => ERROR_TYPE_INVALID_REQUEST,
            AppError::RateLimitExceeded(_) => ERROR_TYPE_RATE_LIMIT,
            _ => ERROR_TYPE_API,
        }
    }

    /// Message safe to show to the client.
    ///
    /// Internal failures are reported generically; their detail only goes to the log.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Config(_)
            | AppError::Serialization(_)
            | AppError::Io(_)
            | AppError::Internal(_) => "Internal server error".to_string(),
            AppError::Request(e) if e.is_connect() => "Upstream connection failed".to_string(),
            AppError::Request(_) => "Upstream request failed".to_string(),
            AppError::Unauthorized(msg) => msg.clone(),
            AppError::RateLimitExceeded(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

/// Timeouts get their own variant so they render as 504.
impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AppError::Timeout
        } else {
            AppError::Request(e)
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let request_id = get_request_id();
        let provider = get_provider_context();
        let subject = get_identity();
        if status.is_server_error() {
            tracing::error!(
                request_id = %request_id,
                provider = %provider,
                subject = %subject,
                status = status.as_u16(),
                error = %self,
                "Request failed"
            );
        } else {
            tracing::debug!(
                request_id = %request_id,
                provider = %provider,
                subject = %subject,
                status = status.as_u16(),
                error = %self,
                "Request rejected"
            );
        }

        let error_type = self.error_type();
        let message = self.client_message();

        match self {
            AppError::Upstream {
                body: Some(body), ..
            } => (status, [(header::CONTENT_TYPE, "application/json")], body).into_response(),
            AppError::Signing(_) => (
                status,
                Json(json!({
                    "status": STATUS_ERROR,
                    "message": message,
                })),
            )
                .into_response(),
            other => {
                let label = if matches!(other, AppError::Unauthorized(_)) {
                    STATUS_UNAUTHORIZED
                } else {
                    STATUS_FAIL
                };
                (
                    status,
                    Json(json!({
                        "status": label,
                        "message": message,
                        "data": null,
                        "error": {
                            "type": error_type,
                            "code": status.as_u16()
                        }
                    })),
                )
                    .into_response()
            }
        }
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
