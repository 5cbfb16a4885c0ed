//! Request logging middleware.
//!
//! Logs each request on entry and its outcome on exit, and leaves a
//! [`RequestLogRecord`] on the context for later stages and callers.

use std::time::Duration;

use keel_core::{Clock, SharedClock};
use keel_telemetry::logging::fields;

use crate::context::MiddlewareContext;
use crate::error::PipelineResult;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{Request, Response};

/// What the logging stage observed for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLogRecord {
    /// HTTP method.
    pub method: http::Method,
    /// Request path.
    pub path: String,
    /// Response status, `None` if downstream failed.
    pub status: Option<u16>,
    /// Time spent in this stage and everything after it.
    pub duration: Duration,
}

/// Middleware that logs requests.
#[derive(Clone)]
pub struct RequestLogMiddleware {
    clock: SharedClock,
}

impl RequestLogMiddleware {
    /// Creates a logging stage timed by `clock`.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }
}

impl std::fmt::Debug for RequestLogMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLogMiddleware").finish_non_exhaustive()
    }
}

impl Middleware for RequestLogMiddleware {
    fn name(&self) -> &'static str {
        "request_log"
    }

    fn fingerprint(&self) -> Option<String> {
        Some("request_log".to_string())
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, PipelineResult<Response>> {
        Box::pin(async move {
            let method = request.method().clone();
            let path = request.uri().path().to_string();
            let request_id = ctx.request_id();
            let started = self.clock.now();

            tracing::info!(
                { fields::REQUEST_ID } = %request_id,
                { fields::HTTP_METHOD } = %method,
                { fields::HTTP_PATH } = %path,
                "request started"
            );

            let result = next.run(ctx, request).await;
            let duration = self.clock.elapsed_since(started);
            let duration_ms = duration.as_secs_f64() * 1000.0;

            let status = match &result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    tracing::info!(
                        { fields::REQUEST_ID } = %request_id,
                        { fields::HTTP_METHOD } = %method,
                        { fields::HTTP_PATH } = %path,
                        { fields::HTTP_STATUS } = status,
                        { fields::CALLER } = %ctx.identity().log_id(),
                        { fields::DURATION_MS } = duration_ms,
                        "request completed"
                    );
                    Some(status)
                }
                Err(e) => {
                    tracing::error!(
                        { fields::REQUEST_ID } = %request_id,
                        { fields::HTTP_METHOD } = %method,
                        { fields::HTTP_PATH } = %path,
                        { fields::DURATION_MS } = duration_ms,
                        { fields::ERROR } = %e,
                        "request failed"
                    );
                    None
                }
            };

            ctx.set_extension(RequestLogRecord {
                method,
                path,
                status,
                duration,
            });
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ManualClock;
    use std::sync::Arc;

    #[test]
    fn test_identical_configs_share_fingerprint() {
        let clock: SharedClock = Arc::new(ManualClock::new(Duration::ZERO));
        let a = RequestLogMiddleware::new(clock.clone());
        let b = RequestLogMiddleware::new(clock);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.name(), "request_log");
    }
}
