//! Pipeline error types.

use http::StatusCode;
use keel_core::{KeelError, LocatorError};
use thiserror::Error;

use crate::types::Response;

/// Result type for pipeline compilation and execution.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failures raised while compiling or executing a pipeline.
///
/// None of these are user errors: they are resolution failures or stage
/// defects, and they reach the caller as explicit failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A stage reference could not be resolved.
    #[error("stage resolution failed: {0}")]
    Locator(#[from] LocatorError),

    /// A stage ran its continuation more than once.
    #[error("stage '{stage}' invoked its continuation more than once")]
    ContinuationReused {
        /// The offending stage.
        stage: String,
    },

    /// A stage neither produced a response nor propagated one.
    #[error("stage '{stage}' returned without a response")]
    NoResponse {
        /// The offending stage.
        stage: String,
    },

    /// A stage panicked.
    #[error("stage '{stage}' panicked")]
    Panicked {
        /// The stage that was running.
        stage: String,
    },
}

impl PipelineError {
    /// Returns the stage this error is attributed to, if any.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Locator(_) => None,
            Self::ContinuationReused { stage }
            | Self::NoResponse { stage }
            | Self::Panicked { stage } => Some(stage),
        }
    }

    /// Returns the HTTP status reported for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    /// Renders this error as a generic internal-error envelope.
    ///
    /// The stage name and cause stay in the logs.
    #[must_use]
    pub fn into_response(&self, request_id: Option<&str>) -> Response {
        KeelError::internal("Internal error").into_response(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_attribution() {
        let err = PipelineError::Panicked {
            stage: "auth".to_string(),
        };
        assert_eq!(err.stage(), Some("auth"));
        assert_eq!(err.to_string(), "stage 'auth' panicked");

        let err: PipelineError = LocatorError::NotBound {
            key: "limiter".to_string(),
        }
        .into();
        assert_eq!(err.stage(), None);
        assert!(err.to_string().contains("limiter"));
    }

    #[test]
    fn test_into_response_hides_stage() {
        let err = PipelineError::NoResponse {
            stage: "legacy_auth".to_string(),
        };
        let response = err.into_response(Some("req-1"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = tokio_test::block_on(http_body_util::BodyExt::collect(response.into_body()))
            .unwrap()
            .to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("legacy_auth"));
        assert!(text.contains("req-1"));
    }
}
