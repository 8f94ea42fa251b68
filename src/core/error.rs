//! # Error Handling
//!
//! Every fallible operation in the idempotency layer returns an
//! [`IdempotencyResult`]. Errors raised before the wrapped service runs are
//! turned into HTTP responses through [`IntoResponse`]; errors raised after it
//! ran (cache population) are only logged by the middleware.
//!
//! ## Status mapping
//! - [`IdempotencyError::RequestInProgress`] → `409 Conflict`
//! - [`IdempotencyError::InvalidRequest`] → `400 Bad Request`
//! - everything else → `500 Internal Server Error`
//!
//! A cache miss is not an error: stores return `Ok(None)`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result type used throughout the crate
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Errors produced by fingerprinting, the stores and configuration loading
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// Another request holding the same fingerprint is still executing
    #[error("request with this idempotency key is already in progress")]
    RequestInProgress,

    /// The request could not be fingerprinted (unreadable or oversized body)
    #[error("invalid idempotent request: {message}")]
    InvalidRequest { message: String },

    /// Redis command or connection failure
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Cached record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic backend failure
    #[error("Store error: {message}")]
    Store { message: String },

    /// Invalid or unreadable configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl IdempotencyError {
    /// Create an invalid request error
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// HTTP status returned to the caller for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RequestInProgress => StatusCode::CONFLICT,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Redis(_)
            | Self::Serialization(_)
            | Self::Store { .. }
            | Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine readable error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::RequestInProgress => "request_in_progress",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Redis(_) => "store_unavailable",
            Self::Serialization(_) => "serialization_error",
            Self::Store { .. } => "store_error",
            Self::Configuration { .. } => "configuration_error",
        }
    }

    /// Whether the client may resubmit the same request later.
    ///
    /// A conflicting request becomes answerable once the holder finishes, and
    /// backend outages are usually transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestInProgress | Self::Redis(_) | Self::Store { .. }
        )
    }
}

impl IntoResponse for IdempotencyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Backend details stay in the logs
        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "Internal server error".to_string(),
            _ => self.to_string(),
        };

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}
