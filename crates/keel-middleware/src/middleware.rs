//! Middleware traits and continuations.
//!
//! Two calling conventions are accepted and normalized into one internal
//! [`Stage`](crate::Stage) before compilation:
//!
//! - **Handler style** ([`Middleware`]): receives a [`Next`] by value and
//!   returns the response. `Next::run` consumes the continuation, so it
//!   cannot be called twice.
//! - **Legacy style** ([`LegacyMiddleware`]): receives an [`Advance`]
//!   continuation it may call through a shared reference, and returns
//!   `Some(response)` or `None`. A second `Advance` call, or returning `None`
//!   without a downstream failure to pass on, is a contract violation
//!   surfaced as a [`PipelineError`].
//!
//! # Example
//!
//! ```ignore
//! use keel_middleware::{BoxFuture, Middleware, MiddlewareContext, Next, PipelineResult, Request, Response};
//!
//! struct Timing;
//!
//! impl Middleware for Timing {
//!     fn name(&self) -> &'static str {
//!         "timing"
//!     }
//!
//!     fn process<'a>(
//!         &'a self,
//!         ctx: &'a mut MiddlewareContext,
//!         request: Request,
//!         next: Next<'a>,
//!     ) -> BoxFuture<'a, PipelineResult<Response>> {
//!         Box::pin(async move {
//!             let response = next.run(ctx, request).await;
//!             tracing::debug!(ok = response.is_ok(), "timing after");
//!             response
//!         })
//!     }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::MiddlewareContext;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{Request, Response};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A compiled link of the chain: runs one stage (or the terminal handler)
/// and everything after it.
pub(crate) type ChainFn = dyn for<'c> Fn(&'c mut MiddlewareContext, Request) -> BoxFuture<'c, PipelineResult<Response>>
    + Send
    + Sync;

/// Handler-style middleware.
///
/// # Invariants
///
/// - Call `next.run()` at most once; returning without calling it
///   short-circuits the pipeline.
/// - Keep no per-request state on `self`. A compiled pipeline is shared by
///   every concurrent request; per-request data belongs in the context.
pub trait Middleware: Send + Sync + 'static {
    /// Name used in logs, metrics and error attribution.
    fn name(&self) -> &'static str;

    /// Whether this stage applies to the request. Skipped stages are not
    /// entered and do not appear in the stage path.
    fn can_handle(&self, _ctx: &MiddlewareContext, _request: &Request) -> bool {
        true
    }

    /// Stable description of this stage's configuration.
    ///
    /// Return `Some` only if two adjacent stages with equal fingerprints
    /// behave exactly like one, so the compiler may drop the second. The
    /// default opts out.
    fn fingerprint(&self) -> Option<String> {
        None
    }

    /// Processes the request.
    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, PipelineResult<Response>>;
}

/// Legacy continuation-passing middleware.
pub trait LegacyMiddleware: Send + Sync + 'static {
    /// Name used in logs, metrics and error attribution.
    fn name(&self) -> &'static str;

    /// Whether this stage applies to the request.
    fn can_handle(&self, _ctx: &MiddlewareContext, _request: &Request) -> bool {
        true
    }

    /// Stable description of this stage's configuration; see
    /// [`Middleware::fingerprint`].
    fn fingerprint(&self) -> Option<String> {
        None
    }

    /// Processes the request, calling `advance` zero or one times.
    ///
    /// Returning `None` is a contract violation.
    fn invoke<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        advance: Advance<'a>,
    ) -> BoxFuture<'a, Option<Response>>;
}

/// Continuation handed to handler-style middleware.
///
/// Consumed by [`run`](Self::run), so it runs the rest of the chain at most
/// once.
pub struct Next<'a> {
    chain: &'a ChainFn,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a ChainFn) -> Self {
        Self { chain }
    }

    /// Runs the rest of the chain.
    pub fn run<'c>(
        self,
        ctx: &'c mut MiddlewareContext,
        request: Request,
    ) -> BoxFuture<'c, PipelineResult<Response>> {
        (self.chain)(ctx, request)
    }
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

/// Continuation handed to legacy middleware.
///
/// Callable through `&self`; only the first call reaches the rest of the
/// chain. Downstream failures are held back from the legacy stage and
/// re-raised after it returns, unless it produced its own response.
pub struct Advance<'a> {
    stage: &'static str,
    next: Mutex<Option<Next<'a>>>,
    state: Arc<AdvanceState>,
}

#[derive(Default)]
struct AdvanceState {
    calls: AtomicUsize,
    failure: Mutex<Option<PipelineError>>,
}

impl<'a> Advance<'a> {
    fn new(stage: &'static str, next: Next<'a>, state: Arc<AdvanceState>) -> Self {
        Self {
            stage,
            next: Mutex::new(Some(next)),
            state,
        }
    }

    /// Runs the rest of the chain.
    ///
    /// Returns `None` if the chain failed or if this continuation was
    /// already used.
    pub async fn call(&self, ctx: &mut MiddlewareContext, request: Request) -> Option<Response> {
        self.state.calls.fetch_add(1, Ordering::AcqRel);
        let next = self.next.lock().take()?;
        match next.run(ctx, request).await {
            Ok(response) => Some(response),
            Err(e) => {
                *self.state.failure.lock() = Some(e);
                None
            }
        }
    }
}

impl std::fmt::Debug for Advance<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Advance")
            .field("stage", &self.stage)
            .field("calls", &self.state.calls.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// Runs a [`LegacyMiddleware`] under the handler-style contract.
pub(crate) struct LegacyAdapter<L> {
    inner: L,
}

impl<L: LegacyMiddleware> LegacyAdapter<L> {
    pub(crate) const fn new(inner: L) -> Self {
        Self { inner }
    }
}

impl<L: LegacyMiddleware> Middleware for LegacyAdapter<L> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn can_handle(&self, ctx: &MiddlewareContext, request: &Request) -> bool {
        self.inner.can_handle(ctx, request)
    }

    fn fingerprint(&self) -> Option<String> {
        self.inner.fingerprint()
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, PipelineResult<Response>> {
        Box::pin(async move {
            let stage = self.inner.name();
            let state = Arc::new(AdvanceState::default());
            let advance = Advance::new(stage, next, state.clone());

            let response = self.inner.invoke(ctx, request, advance).await;

            if state.calls.load(Ordering::Acquire) > 1 {
                return Err(PipelineError::ContinuationReused {
                    stage: stage.to_string(),
                });
            }
            let failure = state.failure.lock().take();
            match (response, failure) {
                (Some(response), _) => Ok(response),
                (None, Some(e)) => Err(e),
                (None, None) => Err(PipelineError::NoResponse {
                    stage: stage.to_string(),
                }),
            }
        })
    }
}

/// The terminal handler of a pipeline.
pub trait Endpoint: Send + Sync + 'static {
    /// Name used in logs and error attribution.
    fn name(&self) -> &'static str {
        "handler"
    }

    /// Produces the response.
    fn call<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
    ) -> BoxFuture<'a, PipelineResult<Response>>;
}

/// An [`Endpoint`] built from a closure.
///
/// The closure reads the context synchronously and returns a `'static`
/// future producing the response.
pub struct FnEndpoint<F> {
    name: &'static str,
    func: F,
}

/// Creates an [`Endpoint`] from a closure.
pub const fn handler_fn<F, Fut>(name: &'static str, func: F) -> FnEndpoint<F>
where
    F: Fn(&mut MiddlewareContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    FnEndpoint { name, func }
}

impl<F, Fut> Endpoint for FnEndpoint<F>
where
    F: Fn(&mut MiddlewareContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn call<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
    ) -> BoxFuture<'a, PipelineResult<Response>> {
        let fut = (self.func)(ctx, request);
        Box::pin(async move { Ok(fut.await) })
    }
}

impl<F> std::fmt::Debug for FnEndpoint<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnEndpoint").field("name", &self.name).finish()
    }
}

/// Builds a chain link from a closure, fixing its higher-ranked signature.
pub(crate) fn link<F>(f: F) -> Arc<ChainFn>
where
    F: for<'c> Fn(&'c mut MiddlewareContext, Request) -> BoxFuture<'c, PipelineResult<Response>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::StatusCode;
    use http_body_util::Full;

    fn sample_request() -> Request {
        http::Request::builder()
            .uri("/test")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn ok_chain() -> Arc<ChainFn> {
        link(|ctx, _req| {
            ctx.set_extension(true);
            Box::pin(async { Ok(Response::new(Full::new(Bytes::from_static(b"ok")))) })
        })
    }

    struct CallsTwice;

    impl LegacyMiddleware for CallsTwice {
        fn name(&self) -> &'static str {
            "calls_twice"
        }

        fn invoke<'a>(
            &'a self,
            ctx: &'a mut MiddlewareContext,
            request: Request,
            advance: Advance<'a>,
        ) -> BoxFuture<'a, Option<Response>> {
            Box::pin(async move {
                let first = advance.call(ctx, request).await;
                let second = advance.call(ctx, sample_request()).await;
                assert!(second.is_none());
                first
            })
        }
    }

    struct Silent;

    impl LegacyMiddleware for Silent {
        fn name(&self) -> &'static str {
            "silent"
        }

        fn invoke<'a>(
            &'a self,
            _ctx: &'a mut MiddlewareContext,
            _request: Request,
            _advance: Advance<'a>,
        ) -> BoxFuture<'a, Option<Response>> {
            Box::pin(async { None })
        }
    }

    #[tokio::test]
    async fn test_next_runs_chain() {
        let chain = ok_chain();
        let mut ctx = MiddlewareContext::new();
        let response = Next::new(&*chain).run(&mut ctx, sample_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(ctx.get_extension::<bool>(), Some(&true));
    }

    #[tokio::test]
    async fn test_legacy_double_advance_is_rejected() {
        let chain = ok_chain();
        let adapter = LegacyAdapter::new(CallsTwice);
        let mut ctx = MiddlewareContext::new();
        let err = adapter
            .process(&mut ctx, sample_request(), Next::new(&*chain))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ContinuationReused { ref stage } if stage == "calls_twice"));
    }

    #[tokio::test]
    async fn test_legacy_without_response_is_rejected() {
        let chain = ok_chain();
        let adapter = LegacyAdapter::new(Silent);
        let mut ctx = MiddlewareContext::new();
        let err = adapter
            .process(&mut ctx, sample_request(), Next::new(&*chain))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoResponse { ref stage } if stage == "silent"));
    }

    #[tokio::test]
    async fn test_fn_endpoint() {
        let endpoint = handler_fn("echo", |ctx: &mut MiddlewareContext, _req| {
            let id = ctx.request_id().to_string();
            async move { Response::new(Full::new(Bytes::from(id))) }
        });
        let mut ctx = MiddlewareContext::new();
        let response = endpoint.call(&mut ctx, sample_request()).await.unwrap();
        assert_eq!(endpoint.name(), "echo");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
