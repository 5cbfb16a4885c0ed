//! # Keel
//!
//! **Request-processing core for HTTP services**
//!
//! Keel provides the machinery between an HTTP listener and application
//! handlers:
//!
//! - **Compiled pipelines** – middleware folded once into a closure chain and cached
//! - **Service locator** – lazy singletons, aliases, tags and auto-wiring
//! - **Object pooling** – size-classed buffer pools with leak-free leases
//! - **Memory governance** – pressure bands, trend escalation, profile switching
//! - **Resilience** – circuit breaker and rate limiter over a shared state store
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use keel::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(KeelConfig::production())?;
//!     engine.start_governor();
//!
//!     let pipeline = engine.compile(
//!         &[
//!             Stage::handler(engine.request_log()).into(),
//!             Stage::handler(engine.rate_limiter()).into(),
//!             Stage::handler(engine.circuit_breaker()).into(),
//!         ],
//!         Arc::new(handler_fn("hello", |ctx: &mut MiddlewareContext, _req| {
//!             let response = ctx.respond("hello");
//!             async move { response }
//!         })),
//!     )?;
//!
//!     // hand `pipeline` to the HTTP layer ...
//!
//!     let report = engine.shutdown().await?;
//!     println!("collected {} bytes", report.bytes_collected);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::sync::Arc;

use keel_config::{ConfigError, KeelConfig};
use keel_core::{ServiceLocator, SharedClock};
use keel_middleware::stages::{CircuitBreakerMiddleware, RateLimitMiddleware, RequestLogMiddleware};
use keel_middleware::{
    CompiledPipeline, Endpoint, MemoryStore, PipelineCompiler, PipelineError, StageSpec, StateStore,
};
use keel_runtime::{MemoryProbe, Runtime, RuntimeError, ShutdownReport};
use keel_telemetry::{GovernorHandle, PerformanceMonitor, TelemetryError};
use parking_lot::Mutex;

// Re-export component crates
pub use keel_config as config;
pub use keel_core as core;
pub use keel_middleware as middleware;
pub use keel_runtime as runtime;
pub use keel_telemetry as telemetry;

/// Locator key of the engine's [`Runtime`].
pub const RUNTIME_KEY: &str = "keel.runtime";

/// Locator key of the engine's [`PerformanceMonitor`].
pub const MONITOR_KEY: &str = "keel.monitor";

/// Locator key of the engine's shared `Arc<dyn StateStore>`.
pub const STATE_STORE_KEY: &str = "keel.state_store";

/// Errors raised while building or stopping an [`Engine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The resource runtime could not start or stop.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The governor loop failed to stop cleanly.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    /// A pipeline could not be compiled.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Everything a service needs, wired from one [`KeelConfig`].
///
/// The runtime, monitor and state store are also bound in the locator under
/// [`RUNTIME_KEY`], [`MONITOR_KEY`] and [`STATE_STORE_KEY`] so deferred
/// stages can pick them up at compile time.
pub struct Engine {
    config: KeelConfig,
    locator: Arc<ServiceLocator>,
    runtime: Arc<Runtime>,
    monitor: Arc<PerformanceMonitor>,
    compiler: PipelineCompiler,
    store: Arc<dyn StateStore>,
    governor: Mutex<Option<GovernorHandle>>,
}

impl Engine {
    /// Builds an engine that probes this process and reads the wall clock.
    pub fn new(config: KeelConfig) -> EngineResult<Self> {
        config.validate()?;
        let runtime = Runtime::start(&config)?;
        Ok(Self::assemble(config, runtime))
    }

    /// Builds an engine with an explicit memory probe and clock.
    pub fn with_parts(
        config: KeelConfig,
        probe: Arc<dyn MemoryProbe>,
        clock: SharedClock,
    ) -> EngineResult<Self> {
        config.validate()?;
        let runtime = Runtime::with_parts(&config, probe, clock)?;
        Ok(Self::assemble(config, runtime))
    }

    fn assemble(config: KeelConfig, runtime: Arc<Runtime>) -> Self {
        let locator = Arc::new(ServiceLocator::new());
        let monitor = PerformanceMonitor::new(&config.monitor, runtime.clone());
        let store = MemoryStore::shared(runtime.clock().clone());

        locator.instance(RUNTIME_KEY, runtime.clone());
        locator.instance(MONITOR_KEY, monitor.clone());
        locator.instance(STATE_STORE_KEY, store.clone());

        let compiler = PipelineCompiler::new(locator.clone()).with_monitor(monitor.clone());
        tracing::info!(
            profile = %monitor.live_metrics().profile,
            "keel engine ready"
        );

        Self {
            config,
            locator,
            runtime,
            monitor,
            compiler,
            store,
            governor: Mutex::new(None),
        }
    }

    /// The configuration the engine was built from.
    pub const fn config(&self) -> &KeelConfig {
        &self.config
    }

    /// The service locator.
    pub fn locator(&self) -> &Arc<ServiceLocator> {
        &self.locator
    }

    /// The resource runtime.
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The performance monitor.
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// The pipeline compiler.
    pub const fn compiler(&self) -> &PipelineCompiler {
        &self.compiler
    }

    /// The state store shared by resilience stages.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// The clock shared by every component.
    pub fn clock(&self) -> &SharedClock {
        self.runtime.clock()
    }

    /// Compiles `stages` in front of `terminal`.
    pub fn compile(
        &self,
        stages: &[StageSpec],
        terminal: Arc<dyn Endpoint>,
    ) -> EngineResult<Arc<CompiledPipeline>> {
        Ok(self.compiler.compile(stages, terminal)?)
    }

    /// A circuit breaker with the configured thresholds over the shared store.
    pub fn circuit_breaker(&self) -> CircuitBreakerMiddleware {
        CircuitBreakerMiddleware::new(
            self.config.circuit_breaker.clone(),
            self.store.clone(),
            self.clock().clone(),
        )
    }

    /// A rate limiter with the configured budget over the shared store.
    pub fn rate_limiter(&self) -> RateLimitMiddleware {
        RateLimitMiddleware::new(
            self.config.rate_limit.clone(),
            self.store.clone(),
            self.clock().clone(),
        )
    }

    /// A request logging stage on the engine clock.
    pub fn request_log(&self) -> RequestLogMiddleware {
        RequestLogMiddleware::new(self.clock().clone())
    }

    /// Starts the background governor loop if it is not already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_governor(&self) {
        let mut governor = self.governor.lock();
        if governor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *governor = Some(self.monitor.spawn_configured_governor());
    }

    /// Returns `true` while the governor loop is running.
    pub fn governor_running(&self) -> bool {
        self.governor
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the governor loop and shuts the runtime down.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Runtime`] if the engine was already shut down.
    pub async fn shutdown(&self) -> EngineResult<ShutdownReport> {
        let governor = self.governor.lock().take();
        if let Some(handle) = governor {
            handle.stop().await?;
        }
        self.compiler.clear_cache();
        let report = self.runtime.shutdown()?;
        tracing::info!(
            gc_runs = report.gc_runs,
            profile_switches = report.profile_switches,
            "keel engine stopped"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("runtime", &self.runtime)
            .field("compiler", &self.compiler)
            .field("store", &self.store.name())
            .finish_non_exhaustive()
    }
}

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust,ignore
/// use keel::prelude::*;
/// ```
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::{Engine, EngineError, EngineResult};

    pub use keel_config::{ConfigLoader, KeelConfig};

    pub use keel_core::{
        CallerIdentity, Clock, KeelError, KeelResult, PerformanceProfile, RequestId,
        ServiceLocator, SharedClock,
    };

    pub use keel_middleware::stages::{
        AuthMiddleware, CircuitBreakerMiddleware, RateLimitMiddleware, RequestLogMiddleware,
    };
    pub use keel_middleware::{
        handler_fn, Advance, BoxFuture, CompiledPipeline, Endpoint, LegacyMiddleware, Middleware,
        MiddlewareContext, Next, PipelineCompiler, PipelineError, PipelineResult, Request,
        Response, ResponseExt, Stage, StageSpec,
    };

    pub use keel_runtime::{BufferPool, ObjectPool, Poolable, Runtime};

    pub use keel_telemetry::{AggregateMetrics, LiveMetrics, PerformanceMonitor};
}
