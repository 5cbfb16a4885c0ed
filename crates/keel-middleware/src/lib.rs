//! # Keel Middleware
//!
//! Request pipeline for the Keel framework.
//!
//! Middleware is registered as an ordered list of [`StageSpec`]s and
//! compiled once into a [`CompiledPipeline`]: a nested chain of closures
//! ending in an [`Endpoint`]. Compilation resolves service-bound and
//! deferred stages through the [`ServiceLocator`](keel_core::ServiceLocator),
//! drops adjacent configuration-identical duplicates and caches the result
//! by stage identity.
//!
//! ```text
//! Request → stage 1 → stage 2 → … → stage N → Endpoint
//!                                                ↓
//! Response ← stage 1 ← stage 2 ← … ← stage N ←───┘
//! ```
//!
//! ## Calling Conventions
//!
//! - [`Middleware`]: receives a [`Next`] and returns a response or an error.
//! - [`LegacyMiddleware`]: receives an [`Advance`] continuation and returns
//!   an optional response. Adapted once at registration; calling the
//!   continuation twice is reported as an error.
//!
//! ## Built-in Stages
//!
//! See [`stages`] for logging, authentication, rate limiting and the circuit
//! breaker.
//!
//! ## Example
//!
//! ```ignore
//! use keel_middleware::{handler_fn, PipelineCompiler, Stage, StageSpec};
//! use keel_middleware::stages::RequestLogMiddleware;
//!
//! let compiler = PipelineCompiler::new(locator);
//! let pipeline = compiler.compile(
//!     &[Stage::handler(RequestLogMiddleware::new(clock)).into()],
//!     Arc::new(handler_fn("hello", |ctx, _req| {
//!         let response = ctx.respond("hi");
//!         async move { response }
//!     })),
//! )?;
//! let response = pipeline.handle(MiddlewareContext::new(), request).await;
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod context;
pub mod error;
pub mod middleware;
pub mod pipeline;
pub mod stage;
pub mod stages;
pub mod store;
pub mod types;

pub use context::{MiddlewareContext, ResponseSeed};
pub use error::{PipelineError, PipelineResult};
pub use middleware::{
    handler_fn, Advance, BoxFuture, Endpoint, FnEndpoint, LegacyMiddleware, Middleware, Next,
};
pub use pipeline::{CompiledPipeline, PipelineCompiler};
pub use stage::{Stage, StageFactory, StageKind, StageSpec};
pub use store::{MemoryStore, NullStore, StateStore, StoreError, StoreResult};
pub use types::{Request, Response, ResponseExt};
