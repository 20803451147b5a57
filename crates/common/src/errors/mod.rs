//! Error types for Keystone services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for configuration, upstream, and access failures
//! - HTTP status code mapping
//! - Structured error responses
//! - Error codes for client handling
//!
//! Partial degradation (ACL truncation, reranker fallback, stitch truncation)
//! is never represented here. It travels as warnings on the retrieval result.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,

    // Authorization errors (3xxx)
    AccessPredicateError,
    IdentityNotFound,

    // External service errors (8xxx)
    UpstreamError,
    UpstreamTimeout,
    RetrievalFailed,
    AuditUnavailable,
    DeadlineExceeded,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,

            // Authz (3xxx)
            ErrorCode::AccessPredicateError => 3004,
            ErrorCode::IdentityNotFound => 3005,

            // External (8xxx)
            ErrorCode::UpstreamError => 8001,
            ErrorCode::UpstreamTimeout => 8003,
            ErrorCode::RetrievalFailed => 8007,
            ErrorCode::AuditUnavailable => 8008,
            ErrorCode::DeadlineExceeded => 8009,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    // Access control
    #[error("Access predicate cannot be constructed: {message}")]
    AccessPredicate { message: String },

    #[error("Identity not found: user {user_id} in tenant {tenant_id}")]
    IdentityNotFound { user_id: String, tenant_id: String },

    // External service errors
    #[error("Upstream service '{service}' unavailable: {message}")]
    UpstreamUnavailable { service: String, message: String },

    #[error("Upstream service '{service}' timed out after {timeout_ms}ms")]
    UpstreamTimeout { service: String, timeout_ms: u64 },

    #[error("Retrieval failed: all {attempted} search calls failed ({message})")]
    RetrievalFailed { attempted: usize, message: String },

    #[error("Audit sink unavailable: {message}")]
    AuditUnavailable { message: String },

    #[error("Request deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded { deadline_ms: u64 },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Shorthand for a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        AppError::Configuration {
            message: message.into(),
        }
    }

    /// Shorthand for an upstream failure
    pub fn upstream(service: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::UpstreamUnavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Classify a failed upstream request; client-side timeouts keep their limit
    pub fn upstream_request(service: impl Into<String>, timeout: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::UpstreamTimeout {
                service: service.into(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else {
            AppError::upstream(service, format!("Request failed: {}", err))
        }
    }

    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::AccessPredicate { .. } => ErrorCode::AccessPredicateError,
            AppError::IdentityNotFound { .. } => ErrorCode::IdentityNotFound,
            AppError::UpstreamUnavailable { .. } => ErrorCode::UpstreamError,
            AppError::UpstreamTimeout { .. } => ErrorCode::UpstreamTimeout,
            AppError::RetrievalFailed { .. } => ErrorCode::RetrievalFailed,
            AppError::AuditUnavailable { .. } => ErrorCode::AuditUnavailable,
            AppError::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,

            // 403 Forbidden
            AppError::AccessPredicate { .. } | AppError::IdentityNotFound { .. } => {
                StatusCode::FORBIDDEN
            }

            // 500 Internal Server Error
            AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::UpstreamUnavailable { .. }
            | AppError::RetrievalFailed { .. }
            | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::AuditUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            AppError::UpstreamTimeout { .. } | AppError::DeadlineExceeded { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub numeric_code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let field = match &self {
            AppError::Validation { field, .. } => field.clone(),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                numeric_code: code.as_code(),
                message,
                field,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::RetrievalFailed {
            attempted: 4,
            message: "index down".into(),
        };
        assert_eq!(err.code(), ErrorCode::RetrievalFailed);
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.code().as_code(), 8007);
    }

    #[test]
    fn test_validation_error() {
        let err = AppError::Validation {
            message: "query must not be empty".into(),
            field: Some("query".into()),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(!err.is_server_error());
        assert!(err.is_client_error());
    }

    #[test]
    fn test_access_predicate_is_forbidden() {
        let err = AppError::AccessPredicate {
            message: "empty tenant".into(),
        };
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_upstream_timeout_is_gateway_timeout() {
        let err = AppError::UpstreamTimeout {
            service: "search_index".into(),
            timeout_ms: 5000,
        };
        assert_eq!(err.code().as_code(), 8003);
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.to_string(), "Upstream service 'search_index' timed out after 5000ms");
    }

    #[test]
    fn test_http_client_error_is_bad_gateway() {
        let result: Result<reqwest::Request> = reqwest::Client::new()
            .get("not a url")
            .build()
            .map_err(AppError::from);
        let err = result.unwrap_err();

        assert!(matches!(err, AppError::HttpClient(_)));
        assert_eq!(err.code(), ErrorCode::UpstreamError);
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_configuration_error_is_server_error() {
        let err = AppError::configuration("vector_weight + lexical_weight != 1.0");
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
        assert!(err.is_server_error());
    }
}
