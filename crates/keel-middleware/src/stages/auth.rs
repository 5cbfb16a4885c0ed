//! Authentication middleware.
//!
//! Reads a credential from a request header, hands it to a validator and
//! stores the resulting [`CallerIdentity`] on the context. Required
//! authentication short-circuits with `401` when the credential is missing
//! or rejected.

use std::sync::Arc;

use http::header::{HeaderName, AUTHORIZATION};
use keel_core::{CallerIdentity, KeelError};
use keel_telemetry::logging::fields;

use crate::context::MiddlewareContext;
use crate::error::PipelineResult;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{Request, Response};

/// Header for API key authentication.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Maps a presented credential to a caller, or `None` if it is invalid.
pub type CredentialValidator = Arc<dyn Fn(&str) -> Option<CallerIdentity> + Send + Sync>;

/// Middleware that authenticates the caller.
///
/// # Example
///
/// ```ignore
/// use keel_core::CallerIdentity;
/// use keel_middleware::stages::AuthMiddleware;
///
/// let auth = AuthMiddleware::bearer(|token| {
///     (token == "s3cret").then(|| CallerIdentity::user("alice"))
/// });
/// ```
#[derive(Clone)]
pub struct AuthMiddleware {
    required: bool,
    header: HeaderName,
    scheme: Option<&'static str>,
    validator: CredentialValidator,
}

impl AuthMiddleware {
    /// Requires an `Authorization: Bearer <token>` credential.
    pub fn bearer<F>(validator: F) -> Self
    where
        F: Fn(&str) -> Option<CallerIdentity> + Send + Sync + 'static,
    {
        Self {
            required: true,
            header: AUTHORIZATION,
            scheme: Some("Bearer"),
            validator: Arc::new(validator),
        }
    }

    /// Requires the raw value of `header` as the credential.
    pub fn header<F>(header: HeaderName, validator: F) -> Self
    where
        F: Fn(&str) -> Option<CallerIdentity> + Send + Sync + 'static,
    {
        Self {
            required: true,
            header,
            scheme: None,
            validator: Arc::new(validator),
        }
    }

    /// Lets requests without credentials through as anonymous.
    ///
    /// Credentials that are present but invalid are still rejected.
    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Whether a credential is mandatory.
    #[must_use]
    pub const fn is_required(&self) -> bool {
        self.required
    }

    fn credential<'r>(&self, request: &'r Request) -> Option<&'r str> {
        let raw = request.headers().get(&self.header)?.to_str().ok()?;
        match self.scheme {
            Some(scheme) => {
                let (given, rest) = raw.split_once(' ')?;
                given.eq_ignore_ascii_case(scheme).then(|| rest.trim())
            }
            None => Some(raw.trim()),
        }
        .filter(|value| !value.is_empty())
    }
}

impl std::fmt::Debug for AuthMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthMiddleware")
            .field("required", &self.required)
            .field("header", &self.header)
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

impl Middleware for AuthMiddleware {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, PipelineResult<Response>> {
        Box::pin(async move {
            let request_id = ctx.request_id().to_string();
            let Some(credential) = self.credential(&request) else {
                if self.required {
                    tracing::debug!(
                        { fields::REQUEST_ID } = %request_id,
                        header = %self.header,
                        "missing credentials"
                    );
                    return Ok(KeelError::authentication("Authentication required")
                        .into_response(Some(&request_id)));
                }
                return next.run(ctx, request).await;
            };

            match (self.validator)(credential) {
                Some(identity) => {
                    tracing::debug!(
                        { fields::REQUEST_ID } = %request_id,
                        { fields::CALLER } = %identity.log_id(),
                        "caller authenticated"
                    );
                    ctx.set_identity(identity);
                    next.run(ctx, request).await
                }
                None => {
                    tracing::info!(
                        { fields::REQUEST_ID } = %request_id,
                        header = %self.header,
                        "invalid credentials"
                    );
                    Ok(KeelError::authentication("Invalid credentials")
                        .into_response(Some(&request_id)))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::Full;

    fn with_header(name: &str, value: &str) -> Request {
        http::Request::builder()
            .header(name, value)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn auth() -> AuthMiddleware {
        AuthMiddleware::bearer(|token| (token == "good").then(|| CallerIdentity::user("alice")))
    }

    #[test]
    fn test_bearer_credential() {
        let auth = auth();
        assert_eq!(auth.credential(&with_header("authorization", "Bearer good")), Some("good"));
        assert_eq!(auth.credential(&with_header("authorization", "bearer good")), Some("good"));
        assert_eq!(auth.credential(&with_header("authorization", "Basic Zm9v")), None);
        assert_eq!(auth.credential(&with_header("authorization", "Bearer ")), None);
    }

    #[test]
    fn test_header_credential() {
        let auth = AuthMiddleware::header(HeaderName::from_static(API_KEY_HEADER), |key| {
            Some(CallerIdentity::api_key(key))
        });
        assert_eq!(auth.credential(&with_header("x-api-key", " k1 ")), Some("k1"));
        assert!(auth.is_required());
        assert!(!auth.optional().is_required());
    }

    #[test]
    fn test_no_fingerprint() {
        assert!(auth().fingerprint().is_none());
        assert_eq!(auth().name(), "auth");
    }
}
