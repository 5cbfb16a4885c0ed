//! Pipeline compilation and execution.
//!
//! [`PipelineCompiler::compile`] resolves a registered stage list once,
//! drops adjacent duplicates and folds the stages right-to-left into nested
//! closures. Executing the result costs one indirect call per stage; the
//! list is never walked again.
//!
//! ```text
//! execute ─► A.before ─► B.before ─► handler
//!                                       │
//! response ◄─ A.after ◄─ B.after ◄──────┘
//! ```
//!
//! A stage that returns without running its continuation short-circuits:
//! later stages are never entered, earlier ones still run their "after"
//! logic. Errors and panics unwind the same way.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use keel_core::ServiceLocator;
use keel_telemetry::logging::fields;
use keel_telemetry::PerformanceMonitor;
use parking_lot::RwLock;

use crate::context::MiddlewareContext;
use crate::error::{PipelineError, PipelineResult};
use crate::middleware::{link, ChainFn, Endpoint, Next};
use crate::stage::{Stage, StageFactory, StageSpec};
use crate::types::{Request, Response};

/// Cache identity of one registered stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum StageKey {
    /// A stage publishing a fingerprint; equal keys are interchangeable.
    Fingerprint {
        type_name: &'static str,
        fingerprint: String,
    },
    /// Any other built stage, keyed by allocation.
    Identity(usize),
    /// A locator binding, keyed by canonical key.
    Service(String),
    /// A deferred factory, keyed by allocation. The cache entry keeps the
    /// factory alive so the address cannot be reused while it is cached.
    Deferred(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    stages: Vec<StageKey>,
    terminal: usize,
}

struct CacheEntry {
    pipeline: Arc<CompiledPipeline>,
    _factories: Vec<StageFactory>,
}

fn addr<T: ?Sized>(value: &Arc<T>) -> usize {
    Arc::as_ptr(value).cast::<()>() as usize
}

/// Compiles stage lists into [`CompiledPipeline`]s and caches them.
///
/// Cache keys are exact: a pipeline is reused only for the same terminal
/// and, stage by stage, the same fingerprint, the same locator key, or the
/// same instance. Rebinding a locator key does not invalidate entries; call
/// [`clear_cache`](Self::clear_cache) after changing bindings.
pub struct PipelineCompiler {
    locator: Arc<ServiceLocator>,
    monitor: Option<Arc<PerformanceMonitor>>,
    cache: RwLock<HashMap<PipelineKey, CacheEntry>>,
}

impl PipelineCompiler {
    /// Creates a compiler whose pipelines do not report to a monitor.
    #[must_use]
    pub fn new(locator: Arc<ServiceLocator>) -> Self {
        Self {
            locator,
            monitor: None,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Reports every execution of compiled pipelines to `monitor`.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// The locator stages are resolved from.
    #[must_use]
    pub fn locator(&self) -> &Arc<ServiceLocator> {
        &self.locator
    }

    /// Compiles `specs` in front of `terminal`, or returns the cached
    /// pipeline for the same input.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Locator`] if a service or deferred stage
    /// cannot be resolved.
    pub fn compile(
        &self,
        specs: &[StageSpec],
        terminal: Arc<dyn Endpoint>,
    ) -> PipelineResult<Arc<CompiledPipeline>> {
        let key = self.cache_key(specs, &terminal)?;
        if let Some(entry) = self.cache.read().get(&key) {
            metrics::counter!("keel_pipeline_cache_hits_total").increment(1);
            tracing::trace!(stages = entry.pipeline.stages.len(), "compiled pipeline cache hit");
            return Ok(entry.pipeline.clone());
        }

        let resolved = specs
            .iter()
            .map(|spec| spec.resolve(&self.locator))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stages: Vec<Arc<Stage>> = Vec::with_capacity(resolved.len());
        let mut elided = 0_u64;
        for stage in resolved {
            if stages.last().is_some_and(|prev| prev.duplicates(&stage)) {
                tracing::debug!(
                    { fields::STAGE } = stage.name(),
                    "eliding duplicate adjacent stage"
                );
                elided += 1;
                continue;
            }
            stages.push(stage);
        }
        if elided > 0 {
            metrics::counter!("keel_pipeline_stages_elided_total").increment(elided);
        }

        let pipeline = Arc::new(CompiledPipeline::fold(
            stages,
            terminal,
            self.monitor.clone(),
        ));
        tracing::debug!(
            stages = ?pipeline.stage_names(),
            elided,
            "compiled pipeline"
        );

        let factories = specs
            .iter()
            .filter_map(|spec| match spec {
                StageSpec::Deferred { factory, .. } => Some(factory.clone()),
                _ => None,
            })
            .collect();
        let mut cache = self.cache.write();
        let entry = cache.entry(key).or_insert(CacheEntry {
            pipeline,
            _factories: factories,
        });
        Ok(entry.pipeline.clone())
    }

    fn cache_key(
        &self,
        specs: &[StageSpec],
        terminal: &Arc<dyn Endpoint>,
    ) -> PipelineResult<PipelineKey> {
        let mut stages = Vec::with_capacity(specs.len());
        for spec in specs {
            let key = match spec {
                StageSpec::Instance(stage) => match stage.fingerprint() {
                    Some(fingerprint) => StageKey::Fingerprint {
                        type_name: stage.type_name(),
                        fingerprint,
                    },
                    None => StageKey::Identity(addr(stage)),
                },
                StageSpec::Service(key) => StageKey::Service(self.locator.canonical(key)?),
                StageSpec::Deferred { factory, .. } => StageKey::Deferred(addr(factory)),
            };
            stages.push(key);
        }
        Ok(PipelineKey {
            stages,
            terminal: addr(terminal),
        })
    }

    /// Number of cached pipelines.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    /// Drops every cached pipeline.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }
}

impl std::fmt::Debug for PipelineCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCompiler")
            .field("cached", &self.cache_len())
            .field("monitored", &self.monitor.is_some())
            .finish_non_exhaustive()
    }
}

/// An immutable, shareable chain of stages and a terminal handler.
pub struct CompiledPipeline {
    stages: Vec<Arc<Stage>>,
    terminal_name: &'static str,
    chain: Arc<ChainFn>,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl CompiledPipeline {
    fn fold(
        stages: Vec<Arc<Stage>>,
        terminal: Arc<dyn Endpoint>,
        monitor: Option<Arc<PerformanceMonitor>>,
    ) -> Self {
        let terminal_name = terminal.name();
        let mut chain = link(move |ctx, request| {
            let terminal = terminal.clone();
            Box::pin(async move {
                ctx.enter_stage(terminal_name);
                guarded(terminal_name, async move { terminal.call(ctx, request).await }).await
            })
        });

        for stage in stages.iter().rev() {
            let stage = stage.clone();
            let next = chain;
            chain = link(move |ctx, request| {
                let stage = stage.clone();
                let next = next.clone();
                Box::pin(async move {
                    if !stage.middleware().can_handle(ctx, &request) {
                        return next(ctx, request).await;
                    }
                    let name = stage.name();
                    ctx.enter_stage(name);
                    guarded(name, async move {
                        stage
                            .middleware()
                            .process(ctx, request, Next::new(&*next))
                            .await
                    })
                    .await
                })
            });
        }

        Self {
            stages,
            terminal_name,
            chain,
            monitor,
        }
    }

    /// Names of the compiled stages in execution order, after elision.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Name of the terminal handler.
    #[must_use]
    pub const fn terminal_name(&self) -> &'static str {
        self.terminal_name
    }

    /// Runs the pipeline.
    ///
    /// If a monitor is attached, the request is reported as started before
    /// the first stage and as finished, failed or cancelled on every exit
    /// path, including this future being dropped.
    ///
    /// # Errors
    ///
    /// Returns the [`PipelineError`] of a misbehaving or panicking stage.
    pub async fn execute(
        &self,
        ctx: &mut MiddlewareContext,
        request: Request,
    ) -> PipelineResult<Response> {
        let in_flight = self
            .monitor
            .as_ref()
            .map(|m| m.request_started(request.method(), request.uri().path()));
        if let Some(in_flight) = &in_flight {
            ctx.set_profile(in_flight.profile());
        }

        match (self.chain)(ctx, request).await {
            Ok(mut response) => {
                ctx.seed().merge_into(&mut response);
                if let Some(in_flight) = in_flight {
                    let status = response.status();
                    let origin = (status.is_client_error() || status.is_server_error())
                        .then(|| ctx.current_stage())
                        .flatten();
                    in_flight.finish(status, origin);
                }
                Ok(response)
            }
            Err(e) => {
                let origin = e.stage().or_else(|| ctx.current_stage());
                tracing::error!(
                    { fields::REQUEST_ID } = %ctx.request_id(),
                    { fields::STAGE } = origin.unwrap_or("none"),
                    { fields::ERROR } = %e,
                    "pipeline failed"
                );
                if let Some(in_flight) = in_flight {
                    in_flight.fail(e.status(), origin);
                }
                Err(e)
            }
        }
    }

    /// Runs the pipeline, rendering failures as a generic 500 envelope.
    pub async fn handle(&self, mut ctx: MiddlewareContext, request: Request) -> Response {
        match self.execute(&mut ctx, request).await {
            Ok(response) => response,
            Err(e) => e.into_response(Some(&ctx.request_id().to_string())),
        }
    }
}

impl std::fmt::Debug for CompiledPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPipeline")
            .field("stages", &self.stage_names())
            .field("terminal", &self.terminal_name)
            .finish_non_exhaustive()
    }
}

/// Converts a panic inside `stage` into [`PipelineError::Panicked`].
async fn guarded<F>(stage: &'static str, future: F) -> PipelineResult<Response>
where
    F: std::future::Future<Output = PipelineResult<Response>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!({ fields::STAGE } = stage, "stage panicked");
            Err(PipelineError::Panicked {
                stage: stage.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{handler_fn, BoxFuture, Middleware};
    use bytes::Bytes;
    use http::StatusCode;
    use http_body_util::Full;
    use parking_lot::Mutex;

    fn sample_request() -> Request {
        http::Request::builder()
            .uri("/orders")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn ok_endpoint() -> Arc<dyn Endpoint> {
        Arc::new(handler_fn("ok", |_ctx: &mut MiddlewareContext, _req| async {
            Response::new(Full::new(Bytes::from_static(b"ok")))
        }))
    }

    struct Recorder {
        name: &'static str,
        fingerprint: Option<&'static str>,
        trace: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn fingerprint(&self) -> Option<String> {
            self.fingerprint.map(str::to_string)
        }

        fn process<'a>(
            &'a self,
            ctx: &'a mut MiddlewareContext,
            request: Request,
            next: Next<'a>,
        ) -> BoxFuture<'a, PipelineResult<Response>> {
            Box::pin(async move {
                self.trace.lock().push(format!("{}-before", self.name));
                let response = next.run(ctx, request).await;
                self.trace.lock().push(format!("{}-after", self.name));
                response
            })
        }
    }

    fn recorder(
        name: &'static str,
        fingerprint: Option<&'static str>,
        trace: &Arc<Mutex<Vec<String>>>,
    ) -> StageSpec {
        Stage::handler(Recorder {
            name,
            fingerprint,
            trace: trace.clone(),
        })
        .into()
    }

    #[tokio::test]
    async fn test_cache_reuses_pipeline() {
        let compiler = PipelineCompiler::new(Arc::new(ServiceLocator::new()));
        let trace = Arc::new(Mutex::new(Vec::new()));
        let specs = vec![recorder("a", None, &trace)];
        let terminal = ok_endpoint();

        let first = compiler.compile(&specs, terminal.clone()).unwrap();
        let second = compiler.compile(&specs, terminal.clone()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(compiler.cache_len(), 1);

        compiler.compile(&specs, ok_endpoint()).unwrap();
        assert_eq!(compiler.cache_len(), 2);

        compiler.clear_cache();
        assert_eq!(compiler.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_dropped_factories_never_alias_cached_pipelines() {
        let compiler = PipelineCompiler::new(Arc::new(ServiceLocator::new()));
        let trace = Arc::new(Mutex::new(Vec::new()));
        let terminal = ok_endpoint();

        for round in 0..200 {
            let name: &'static str = if round % 2 == 0 { "left" } else { "right" };
            let factory_trace = trace.clone();
            let spec = StageSpec::deferred(name, move |_| {
                Ok(Stage::handler(Recorder {
                    name,
                    fingerprint: None,
                    trace: factory_trace.clone(),
                }))
            });
            let pipeline = compiler.compile(&[spec], terminal.clone()).unwrap();
            assert_eq!(pipeline.stage_names(), vec![name]);

            trace.lock().clear();
            let mut ctx = MiddlewareContext::new();
            pipeline.execute(&mut ctx, sample_request()).await.unwrap();
            assert_eq!(trace.lock()[0], format!("{name}-before"));
        }
        assert_eq!(compiler.cache_len(), 200);
    }

    #[tokio::test]
    async fn test_adjacent_fingerprinted_duplicates_are_elided() {
        let compiler = PipelineCompiler::new(Arc::new(ServiceLocator::new()));
        let trace = Arc::new(Mutex::new(Vec::new()));
        let specs = vec![
            recorder("cors", Some("any"), &trace),
            recorder("cors", Some("any"), &trace),
            recorder("audit", None, &trace),
            recorder("audit", None, &trace),
        ];

        let pipeline = compiler.compile(&specs, ok_endpoint()).unwrap();
        assert_eq!(pipeline.stage_names(), vec!["cors", "audit", "audit"]);

        let mut ctx = MiddlewareContext::new();
        pipeline.execute(&mut ctx, sample_request()).await.unwrap();
        assert_eq!(ctx.stage_path(), &["cors", "audit", "audit", "ok"]);
    }

    #[tokio::test]
    async fn test_service_stage_resolution_failure() {
        let compiler = PipelineCompiler::new(Arc::new(ServiceLocator::new()));
        let err = compiler
            .compile(&[StageSpec::service("missing")], ok_endpoint())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Locator(_)));
        assert_eq!(compiler.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_handle_renders_failures() {
        let compiler = PipelineCompiler::new(Arc::new(ServiceLocator::new()));
        let panicking: Arc<dyn Endpoint> = Arc::new(handler_fn(
            "boom",
            |_ctx: &mut MiddlewareContext, _req| -> std::future::Ready<Response> {
                panic!("handler exploded")
            },
        ));
        let pipeline = compiler.compile(&[], panicking).unwrap();
        let response = pipeline.handle(MiddlewareContext::new(), sample_request()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
