//! Built-in middleware stages.
//!
//! | Stage             | Purpose                                          |
//! |-------------------|--------------------------------------------------|
//! | [`request_log`]   | Structured request/response logging              |
//! | [`auth`]          | Credential validation, caller identity           |
//! | [`rate_limit`]    | Fixed-window limiting with an optional burst cap |
//! | [`circuit_breaker`] | Per-route failure isolation                    |
//!
//! The rate limiter and circuit breaker keep their state in a
//! [`StateStore`](crate::store::StateStore), so several processes can share
//! one budget.

pub mod auth;
pub mod circuit_breaker;
pub mod rate_limit;
pub mod request_log;

pub use auth::{AuthMiddleware, CredentialValidator, API_KEY_HEADER};
pub use circuit_breaker::{CircuitBreakerMiddleware, CircuitRecord, CircuitState};
pub use rate_limit::{LimitWindow, RateLimitExceeded, RateLimitMiddleware, RateWindow};
pub use request_log::{RequestLogMiddleware, RequestLogRecord};
