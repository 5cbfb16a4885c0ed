//! Error types for Keel.
//!
//! This module provides the [`KeelError`] type: the structured error that
//! surfaces to clients when a request is rejected by the engine itself
//! (authentication, rate limiting, open circuits, serialization failures).
//!
//! Every error belongs to an [`ErrorCategory`], which fixes the default HTTP
//! status and the machine-readable code rendered into the JSON envelope:
//!
//! | `ErrorCategory` | Status | Code |
//! |---|---|---|
//! | `Validation` | 400 | `VALIDATION_ERROR` |
//! | `Authentication` | 401 | `AUTHENTICATION_REQUIRED` |
//! | `Authorization` | 403 | `AUTHORIZATION_DENIED` |
//! | `RateLimited` | 429 | `RATE_LIMITED` |
//! | `Unavailable` | 503 | `SERVICE_UNAVAILABLE` |
//! | `Serialization` | 500 | `SERIALIZATION_ERROR` |
//! | `Internal` | 500 | `INTERNAL_ERROR` |

use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using [`KeelError`].
pub type KeelResult<T> = Result<T, KeelError>;

/// Categories of errors for classification and handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed input.
    Validation,
    /// Missing or invalid credentials.
    Authentication,
    /// Permission denied.
    Authorization,
    /// Rate limit exceeded.
    RateLimited,
    /// A protected resource is temporarily refusing traffic.
    Unavailable,
    /// Response body could not be serialized.
    Serialization,
    /// Internal server error.
    Internal,
}

impl ErrorCategory {
    /// Returns the default HTTP status code for this error category.
    #[must_use]
    pub const fn default_status_code(&self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Authentication => StatusCode::UNAUTHORIZED,
            Self::Authorization => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Serialization | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the machine-readable code rendered into error envelopes.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Authentication => "AUTHENTICATION_REQUIRED",
            Self::Authorization => "AUTHORIZATION_DENIED",
            Self::RateLimited => "RATE_LIMITED",
            Self::Unavailable => "SERVICE_UNAVAILABLE",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

/// Standard user-visible error type for Keel.
///
/// # Example
///
/// ```
/// use keel_core::{KeelError, ErrorCategory};
///
/// let err = KeelError::rate_limited("Too many requests", 30);
/// assert_eq!(err.category(), ErrorCategory::RateLimited);
/// assert_eq!(err.retry_after_seconds(), Some(30));
/// ```
#[derive(Error, Debug)]
pub enum KeelError {
    /// Request validation failed.
    #[error("Validation error: {message}")]
    Validation {
        /// Human-readable error message.
        message: String,
    },

    /// Authentication failed or is missing.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
    },

    /// Authorization denied.
    #[error("Authorization denied: {message}")]
    Authorization {
        /// Human-readable error message.
        message: String,
    },

    /// Rate limit exceeded.
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Human-readable error message.
        message: String,
        /// Seconds until the caller may retry.
        retry_after_seconds: u64,
    },

    /// A protected resource is refusing traffic (open circuit).
    #[error("Service unavailable: {message}")]
    Unavailable {
        /// Human-readable error message.
        message: String,
        /// The breaker key of the protected resource.
        resource: Option<String>,
        /// Seconds until a trial request will be admitted.
        retry_after_seconds: u64,
    },

    /// Response serialization failed.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Human-readable error message.
        message: String,
        /// The underlying error (not exposed to clients).
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Internal server error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// The underlying error (not exposed to clients).
        #[source]
        source: Option<anyhow::Error>,
    },
}

impl KeelError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates an authentication error.
    #[must_use]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Creates an authorization error.
    #[must_use]
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization {
            message: message.into(),
        }
    }

    /// Creates a rate limited error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>, retry_after_seconds: u64) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after_seconds,
        }
    }

    /// Creates an unavailable error for a protected resource.
    #[must_use]
    pub fn unavailable(
        message: impl Into<String>,
        resource: Option<String>,
        retry_after_seconds: u64,
    ) -> Self {
        Self::Unavailable {
            message: message.into(),
            resource,
            retry_after_seconds,
        }
    }

    /// Creates a serialization error with its cause.
    pub fn serialization(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an internal error with a source error.
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::Authorization { .. } => ErrorCategory::Authorization,
            Self::RateLimited { .. } => ErrorCategory::RateLimited,
            Self::Unavailable { .. } => ErrorCategory::Unavailable,
            Self::Serialization { .. } => ErrorCategory::Serialization,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        self.category().default_status_code()
    }

    /// Returns the retry-after guidance carried by this error, if any.
    #[must_use]
    pub const fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_seconds,
                ..
            }
            | Self::Unavailable {
                retry_after_seconds,
                ..
            } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// Returns the client-facing message.
    ///
    /// Internal and serialization failures never leak their cause; clients
    /// only see the message the error was constructed with.
    #[must_use]
    pub fn public_message(&self) -> &str {
        match self {
            Self::Validation { message }
            | Self::Authentication { message }
            | Self::Authorization { message }
            | Self::RateLimited { message, .. }
            | Self::Unavailable { message, .. }
            | Self::Serialization { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    /// Converts this error to a serializable error envelope.
    #[must_use]
    pub fn to_envelope(&self, request_id: Option<&str>) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorDetail {
                code: self.category().code().to_string(),
                message: self.public_message().to_string(),
                category: self.category(),
                details: self.error_details(),
            },
            request_id: request_id.map(ToString::to_string),
        }
    }

    fn error_details(&self) -> Option<serde_json::Value> {
        match self {
            Self::RateLimited {
                retry_after_seconds,
                ..
            } => Some(serde_json::json!({
                "retry_after_seconds": retry_after_seconds
            })),
            Self::Unavailable {
                resource,
                retry_after_seconds,
                ..
            } => Some(serde_json::json!({
                "resource": resource,
                "retry_after_seconds": retry_after_seconds
            })),
            _ => None,
        }
    }
}

/// Serializable error envelope for HTTP responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// The error details.
    pub error: ErrorDetail,
    /// The request ID for correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Error detail within an envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Error category.
    pub category: ErrorCategory,
    /// Additional error details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_error() {
        let error = KeelError::authentication("Missing credentials");
        assert_eq!(error.category(), ErrorCategory::Authentication);
        assert_eq!(error.status_code(), StatusCode::UNAUTHORIZED);
        assert!(error.to_string().contains("Missing credentials"));
    }

    #[test]
    fn test_rate_limited_envelope() {
        let error = KeelError::rate_limited("Too many requests", 60);
        assert_eq!(error.status_code(), StatusCode::TOO_MANY_REQUESTS);

        let envelope = error.to_envelope(None);
        let details = envelope.error.details.unwrap();
        assert_eq!(details["retry_after_seconds"], 60);
        assert_eq!(envelope.error.code, "RATE_LIMITED");
    }

    #[test]
    fn test_unavailable_carries_resource() {
        let error = KeelError::unavailable("Circuit open", Some("GET:/orders".into()), 12);
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.retry_after_seconds(), Some(12));

        let details = error.to_envelope(None).error.details.unwrap();
        assert_eq!(details["resource"], "GET:/orders");
    }

    #[test]
    fn test_serialization_error_hides_source() {
        let source = serde_json::from_str::<u32>("nope").unwrap_err();
        let error = KeelError::serialization("Failed to encode response", source);

        let envelope = error.to_envelope(Some("req-1"));
        assert_eq!(envelope.error.message, "Failed to encode response");
        assert_eq!(envelope.error.code, "SERIALIZATION_ERROR");
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_error_envelope_serialization() {
        let error = KeelError::internal("boom");
        let envelope = error.to_envelope(Some("req-456"));

        let json = serde_json::to_string(&envelope).expect("serialization should work");
        assert!(json.contains("\"code\":\"INTERNAL_ERROR\""));
        assert!(json.contains("\"request_id\":\"req-456\""));
        assert!(json.contains("\"category\":\"internal\""));
    }

    #[test]
    fn test_all_error_categories_have_status_codes() {
        let categories = [
            ErrorCategory::Validation,
            ErrorCategory::Authentication,
            ErrorCategory::Authorization,
            ErrorCategory::RateLimited,
            ErrorCategory::Unavailable,
            ErrorCategory::Serialization,
            ErrorCategory::Internal,
        ];

        for category in categories {
            let status = category.default_status_code();
            assert!(
                status.is_client_error() || status.is_server_error(),
                "Category {:?} should map to error status code, got {}",
                category,
                status
            );
        }
    }
}
