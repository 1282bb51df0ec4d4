// ABOUTME: Unified error handling with error codes, failure categories, and HTTP mapping
// ABOUTME: Defines AppError, ErrorCode, and the JSON error response envelope
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Unified Error Handling System
//!
//! Every fallible operation in the server returns [`AppResult`]. The error
//! carries a stable [`ErrorCode`] used for HTTP status mapping and for the
//! `code` field of streamed `error` events, plus a free-form `details` object.
//!
//! Codes group into the five failure categories callers care about
//! (see [`FailureCategory`]): invalid input, not found, rate limited,
//! upstream failure, and persistence failure.

/// Database error types with `sqlx` conversion
#[cfg(feature = "database-errors")]
pub mod database;

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Standard error codes used throughout the application
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    // Validation (3000-3999)
    /// Malformed or oversized input
    #[serde(rename = "INVALID_INPUT")]
    InvalidInput = 3000,
    /// A numeric option outside its accepted range
    #[serde(rename = "VALUE_OUT_OF_RANGE")]
    ValueOutOfRange = 3003,

    // Rate Limiting (2000-2999)
    /// Request window ceiling reached
    #[serde(rename = "RATE_LIMIT_EXCEEDED")]
    RateLimitExceeded = 2000,
    /// Token budget exhausted
    #[serde(rename = "QUOTA_EXCEEDED")]
    QuotaExceeded = 2001,

    // Resource Management (4000-4999)
    /// Resource absent or not owned by the caller
    #[serde(rename = "RESOURCE_NOT_FOUND")]
    ResourceNotFound = 4000,

    // External Services (5000-5999)
    /// Remote generation errored or was safety-filtered
    #[serde(rename = "EXTERNAL_SERVICE_ERROR")]
    ExternalServiceError = 5000,
    /// Remote generation timed out or could not be reached
    #[serde(rename = "EXTERNAL_SERVICE_UNAVAILABLE")]
    ExternalServiceUnavailable = 5001,
    /// Remote generation rejected the call with its own quota
    #[serde(rename = "EXTERNAL_RATE_LIMITED")]
    ExternalRateLimited = 5003,

    // Configuration (6000-6999)
    /// Configuration error
    #[serde(rename = "CONFIG_ERROR")]
    ConfigError = 6000,

    // Internal Errors (9000-9999)
    /// Unexpected internal failure
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError = 9000,
    /// Store write or read failure
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError = 9001,
    /// Serialization failure
    #[serde(rename = "SERIALIZATION_ERROR")]
    SerializationError = 9003,
}

/// Caller-facing failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Malformed or oversized prompt or config
    InvalidInput,
    /// Conversation absent or not owned
    NotFound,
    /// Admission rejected
    RateLimited,
    /// Remote generation errored, timed out, or was safety-filtered
    UpstreamFailure,
    /// Store write error
    PersistenceFailure,
    /// Anything else (configuration, serialization, bugs)
    Internal,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput | Self::ValueOutOfRange => 400,
            Self::ResourceNotFound => 404,
            Self::RateLimitExceeded | Self::QuotaExceeded => 429,
            Self::ExternalServiceError | Self::ExternalServiceUnavailable => 502,
            Self::ExternalRateLimited => 503,
            Self::ConfigError
            | Self::InternalError
            | Self::DatabaseError
            | Self::SerializationError => 500,
        }
    }

    /// Get a user-friendly description of this error
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::InvalidInput => "The provided input is invalid",
            Self::ValueOutOfRange => "The provided value is outside the acceptable range",
            Self::RateLimitExceeded => "Rate limit exceeded. Please slow down your requests",
            Self::QuotaExceeded => "Token budget exhausted for the current window",
            Self::ResourceNotFound => "The requested resource was not found",
            Self::ExternalServiceError => "The generation service encountered an error",
            Self::ExternalServiceUnavailable => "The generation service is currently unavailable",
            Self::ExternalRateLimited => "The generation service rate limit was exceeded",
            Self::ConfigError => "Configuration error encountered",
            Self::InternalError => "An internal server error occurred",
            Self::DatabaseError => "Database operation failed",
            Self::SerializationError => "Data serialization/deserialization failed",
        }
    }

    /// Map this code to its caller-facing failure category
    #[must_use]
    pub const fn category(&self) -> FailureCategory {
        match self {
            Self::InvalidInput | Self::ValueOutOfRange => FailureCategory::InvalidInput,
            Self::ResourceNotFound => FailureCategory::NotFound,
            Self::RateLimitExceeded | Self::QuotaExceeded => FailureCategory::RateLimited,
            Self::ExternalServiceError
            | Self::ExternalServiceUnavailable
            | Self::ExternalRateLimited => FailureCategory::UpstreamFailure,
            Self::DatabaseError => FailureCategory::PersistenceFailure,
            Self::ConfigError | Self::InternalError | Self::SerializationError => {
                FailureCategory::Internal
            }
        }
    }

    /// Wire name used in JSON bodies and streamed error events
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::ValueOutOfRange => "VALUE_OUT_OF_RANGE",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::ResourceNotFound => "RESOURCE_NOT_FOUND",
            Self::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            Self::ExternalServiceUnavailable => "EXTERNAL_SERVICE_UNAVAILABLE",
            Self::ExternalRateLimited => "EXTERNAL_RATE_LIMITED",
            Self::ConfigError => "CONFIG_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::SerializationError => "SERIALIZATION_ERROR",
        }
    }
}

/// Unified error type for the application
#[derive(Debug, thiserror::Error)]
pub struct AppError {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Additional structured context
    pub details: serde_json::Value,
    /// Milliseconds the caller should wait before retrying (rate limits only)
    pub retry_after_ms: Option<u64>,
    /// Source error for error chaining
    #[source]
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl AppError {
    /// Create a new `AppError` with the given code and message
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::Value::Null,
            retry_after_ms: None,
            source: None,
        }
    }

    /// Attach structured details
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Attach a source error for error chaining
    #[must_use]
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Get the HTTP status code for this error
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// Caller-facing failure category
    #[must_use]
    pub const fn category(&self) -> FailureCategory {
        self.code.category()
    }

    /// Invalid input
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Numeric option out of its accepted range
    #[must_use]
    pub fn out_of_range(field: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValueOutOfRange, message)
            .with_details(serde_json::json!({ "field": field }))
    }

    /// Resource not found
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ResourceNotFound,
            format!("{} not found", resource.into()),
        )
    }

    /// Request window ceiling reached
    #[must_use]
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        let mut error = Self::new(
            ErrorCode::RateLimitExceeded,
            format!("Request limit reached, retry in {retry_after_ms} ms"),
        );
        error.retry_after_ms = Some(retry_after_ms);
        error
    }

    /// Token budget exhausted
    #[must_use]
    pub fn quota_exceeded(retry_after_ms: u64) -> Self {
        let mut error = Self::new(
            ErrorCode::QuotaExceeded,
            format!("Token budget exhausted, retry in {retry_after_ms} ms"),
        );
        error.retry_after_ms = Some(retry_after_ms);
        error
    }

    /// Remote generation failed
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExternalServiceError, message)
    }

    /// Remote generation unreachable or timed out
    #[must_use]
    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExternalServiceUnavailable, message)
    }

    /// Database error
    #[must_use]
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    /// Configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigError, message)
    }

    /// Internal server error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.description(), self.message)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(ErrorCode::SerializationError, error.to_string()).with_source(error)
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

/// HTTP error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error payload
    pub error: ErrorResponseDetails,
}

/// Body of an [`ErrorResponse`]
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponseDetails {
    /// Stable error code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Retry hint for rate limits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Structured details
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub details: serde_json::Value,
}

impl From<&AppError> for ErrorResponse {
    fn from(error: &AppError) -> Self {
        Self {
            error: ErrorResponseDetails {
                code: error.code,
                message: error.message.clone(),
                retry_after_ms: error.retry_after_ms,
                details: error.details.clone(),
            },
        }
    }
}

#[cfg(feature = "http-response")]
impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = http::StatusCode::from_u16(self.http_status())
            .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(code = ?self.code, error = %self, "Request failed");
        } else {
            tracing::debug!(code = ?self.code, error = %self, "Request rejected");
        }

        let body = axum::Json(ErrorResponse::from(&self));
        let mut response = (status, body).into_response();

        if let Some(retry_after_ms) = self.retry_after_ms {
            // Retry-After is whole seconds, rounded up so clients never retry early
            let seconds = retry_after_ms.div_ceil(1000);
            if let Ok(value) = http::HeaderValue::from_str(&seconds.to_string()) {
                response
                    .headers_mut()
                    .insert(http::header::RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(ErrorCode::InvalidInput.http_status(), 400);
        assert_eq!(ErrorCode::RateLimitExceeded.http_status(), 429);
        assert_eq!(ErrorCode::ResourceNotFound.http_status(), 404);
        assert_eq!(ErrorCode::ExternalServiceError.http_status(), 502);
        assert_eq!(ErrorCode::DatabaseError.http_status(), 500);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            AppError::rate_limited(10).category(),
            FailureCategory::RateLimited
        );
        assert_eq!(
            AppError::quota_exceeded(10).category(),
            FailureCategory::RateLimited
        );
        assert_eq!(
            AppError::upstream_unavailable("timeout").category(),
            FailureCategory::UpstreamFailure
        );
        assert_eq!(
            AppError::database("disk full").category(),
            FailureCategory::PersistenceFailure
        );
        assert_eq!(
            AppError::out_of_range("top_p", "too big").category(),
            FailureCategory::InvalidInput
        );
    }

    #[test]
    fn test_error_response_serialization() {
        let error = AppError::rate_limited(1500);
        let json = serde_json::to_string(&ErrorResponse::from(&error)).unwrap();
        assert!(json.contains("RATE_LIMIT_EXCEEDED"));
        assert!(json.contains("\"retry_after_ms\":1500"));
        assert!(!json.contains("details"));
    }

    #[test]
    fn test_wire_name_matches_serde() {
        let code = ErrorCode::ExternalServiceUnavailable;
        let json = serde_json::to_value(code).unwrap();
        assert_eq!(json, serde_json::json!(code.as_str()));
    }
}
