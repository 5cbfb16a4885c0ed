//! # Keel Core
//!
//! Core types shared by every crate in the Keel request-processing engine.
//!
//! - [`KeelError`] / [`ErrorCategory`] - structured, user-visible error taxonomy
//! - [`Request`] / [`Response`] - the HTTP message types pipelines operate on
//! - [`RequestId`] / [`CallerIdentity`] - per-request identity
//! - [`Clock`] - time source used by resilience state and latency metrics
//! - [`ServiceLocator`] - named service bindings resolved at pipeline-build time
//! - [`PerformanceProfile`] / [`GcStrategy`] / [`PressureLevel`] - tuning vocabulary

#![doc(html_root_url = "https://docs.rs/keel-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod clock;
mod context;
mod error;
pub mod locator;
mod response;
mod tuning;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use context::{CallerIdentity, RequestId};
pub use error::{ErrorCategory, ErrorDetail, ErrorEnvelope, KeelError, KeelResult};
pub use locator::{Autowire, CallArgs, LocatorError, LocatorResult, Resolver, ServiceLocator};
pub use response::{json_response, Request, Response};
pub use tuning::{GcStrategy, PerformanceProfile, PressureLevel};
