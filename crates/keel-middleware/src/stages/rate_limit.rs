//! Rate limiting middleware.
//!
//! Fixed-window limiter over a [`StateStore`]:
//!
//! - **Primary window**: `max_attempts` per `decay_minutes`.
//! - **Burst window** (optional): `burst_max` per `burst_window_secs`,
//!   checked first, so short spikes are rejected even while the primary
//!   window has budget left.
//!
//! Rejected requests do not consume attempts. Allowed responses carry the
//! limit, remaining and reset headers; rejections add retry guidance. Header
//! names come from [`RateLimitConfig`].
//!
//! Key derivation, skip conditions and the rejection response are
//! pluggable:
//!
//! ```ignore
//! use keel_middleware::stages::RateLimitMiddleware;
//!
//! let limiter = RateLimitMiddleware::new(config.rate_limit.clone(), store, clock)
//!     .with_key(|_ctx, req| {
//!         req.headers().get("x-api-key")?.to_str().ok().map(String::from)
//!     })
//!     .with_skip(|_ctx, req| req.uri().path() == "/health");
//! ```

use std::sync::Arc;
use std::time::Duration;

use keel_config::RateLimitConfig;
use keel_core::{Clock, KeelError, SharedClock};
use keel_telemetry::logging::fields;
use serde::{Deserialize, Serialize};

use crate::context::MiddlewareContext;
use crate::error::PipelineResult;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::store::StateStore;
use crate::types::{Request, Response, ResponseExt};

/// Derives the limiter key; `None` exempts the request.
pub type KeyFn = Arc<dyn Fn(&MiddlewareContext, &Request) -> Option<String> + Send + Sync>;

/// Returns `true` for requests the limiter ignores.
pub type SkipFn = Arc<dyn Fn(&MiddlewareContext, &Request) -> bool + Send + Sync>;

/// Builds the response for a rejected request.
pub type ExceededFn = Arc<dyn Fn(&RateLimitExceeded) -> Response + Send + Sync>;

/// Stored window record for one key.
///
/// Timestamps are milliseconds on the limiter's clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    /// Attempts in the primary window.
    pub attempts: u32,
    /// Start of the primary window.
    pub window_start_ms: u64,
    /// Attempts in the burst window.
    pub burst_attempts: u32,
    /// Start of the burst window.
    pub burst_window_start_ms: u64,
}

/// Which window rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitWindow {
    /// The `decay_minutes` window.
    Primary,
    /// The short burst window.
    Burst,
}

impl LimitWindow {
    /// Returns the lowercase name used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Burst => "burst",
        }
    }
}

/// Details of a rejection, handed to the exceeded-response builder.
#[derive(Debug, Clone)]
pub struct RateLimitExceeded {
    /// The limiter key.
    pub key: String,
    /// The window that rejected the request.
    pub window: LimitWindow,
    /// Attempts allowed in that window.
    pub limit: u32,
    /// Seconds until that window resets.
    pub retry_after_secs: u64,
    /// Request ID for the error envelope.
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Allowed { remaining: u32, reset_secs: u64 },
    Limited {
        window: LimitWindow,
        limit: u32,
        retry_after_secs: u64,
    },
}

/// Rate limiting stage.
pub struct RateLimitMiddleware {
    config: RateLimitConfig,
    store: Arc<dyn StateStore>,
    clock: SharedClock,
    key_fn: Option<KeyFn>,
    skip_fn: Option<SkipFn>,
    exceeded_fn: Option<ExceededFn>,
}

impl RateLimitMiddleware {
    /// Creates a limiter over `store` with the default key, no skip rule
    /// and the standard 429 envelope.
    pub fn new(config: RateLimitConfig, store: Arc<dyn StateStore>, clock: SharedClock) -> Self {
        Self {
            config,
            store,
            clock,
            key_fn: None,
            skip_fn: None,
            exceeded_fn: None,
        }
    }

    /// Replaces key derivation.
    #[must_use]
    pub fn with_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&MiddlewareContext, &Request) -> Option<String> + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(f));
        self
    }

    /// Exempts requests matching `f`.
    #[must_use]
    pub fn with_skip<F>(mut self, f: F) -> Self
    where
        F: Fn(&MiddlewareContext, &Request) -> bool + Send + Sync + 'static,
    {
        self.skip_fn = Some(Arc::new(f));
        self
    }

    /// Replaces the rejection response. Limit headers are still added.
    #[must_use]
    pub fn with_exceeded_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&RateLimitExceeded) -> Response + Send + Sync + 'static,
    {
        self.exceeded_fn = Some(Arc::new(f));
        self
    }

    /// Returns the limiter configuration.
    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Default key: the authenticated caller, else the client IP from
    /// `X-Forwarded-For` or `X-Real-IP`.
    fn default_key(ctx: &MiddlewareContext, request: &Request) -> String {
        if !ctx.identity().is_anonymous() {
            return ctx.identity().log_id();
        }
        if let Some(xff) = request.headers().get("x-forwarded-for") {
            if let Some(first) = xff.to_str().ok().and_then(|v| v.split(',').next()) {
                return first.trim().to_string();
            }
        }
        if let Some(real_ip) = request.headers().get("x-real-ip") {
            if let Ok(value) = real_ip.to_str() {
                return value.to_string();
            }
        }
        "unknown-ip".to_string()
    }

    fn extract_key(&self, ctx: &MiddlewareContext, request: &Request) -> Option<String> {
        let key = match &self.key_fn {
            Some(f) => f(ctx, request)?,
            None => Self::default_key(ctx, request),
        };
        Some(format!("{}{}", self.config.key_prefix, key))
    }

    fn decay_ms(&self) -> u64 {
        self.config.decay_minutes.saturating_mul(60_000).max(1)
    }

    fn burst(&self) -> Option<(u32, u64)> {
        match (self.config.burst_max, self.config.burst_window_secs) {
            (Some(max), Some(secs)) => Some((max, secs.saturating_mul(1_000).max(1))),
            _ => None,
        }
    }

    fn record_ttl(&self) -> Duration {
        let longest = self.burst().map_or(0, |(_, ms)| ms).max(self.decay_ms());
        Duration::from_millis(longest)
    }

    fn check(&self, window: &mut RateWindow, now: u64) -> Decision {
        let decay = self.decay_ms();
        if now.saturating_sub(window.window_start_ms) >= decay {
            window.attempts = 0;
            window.window_start_ms = now;
        }
        let primary_left = decay - now.saturating_sub(window.window_start_ms).min(decay);

        if let Some((burst_max, burst_ms)) = self.burst() {
            if now.saturating_sub(window.burst_window_start_ms) >= burst_ms {
                window.burst_attempts = 0;
                window.burst_window_start_ms = now;
            }
            if window.burst_attempts >= burst_max {
                let elapsed = now.saturating_sub(window.burst_window_start_ms).min(burst_ms);
                return Decision::Limited {
                    window: LimitWindow::Burst,
                    limit: burst_max,
                    retry_after_secs: (burst_ms - elapsed).div_ceil(1_000),
                };
            }
        }

        let max = self.config.max_attempts;
        if window.attempts >= max {
            return Decision::Limited {
                window: LimitWindow::Primary,
                limit: max,
                retry_after_secs: primary_left.div_ceil(1_000),
            };
        }

        window.attempts += 1;
        window.burst_attempts = window.burst_attempts.saturating_add(1);
        Decision::Allowed {
            remaining: max - window.attempts,
            reset_secs: primary_left.div_ceil(1_000),
        }
    }

    fn default_exceeded(exceeded: &RateLimitExceeded) -> Response {
        KeelError::rate_limited("Too many requests", exceeded.retry_after_secs)
            .into_response(Some(&exceeded.request_id))
    }
}

impl std::fmt::Debug for RateLimitMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitMiddleware")
            .field("config", &self.config)
            .field("store", &self.store.name())
            .field("custom_key", &self.key_fn.is_some())
            .field("custom_skip", &self.skip_fn.is_some())
            .field("custom_response", &self.exceeded_fn.is_some())
            .finish_non_exhaustive()
    }
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn can_handle(&self, ctx: &MiddlewareContext, request: &Request) -> bool {
        self.skip_fn.as_ref().map_or(true, |skip| !skip(ctx, request))
    }

    fn fingerprint(&self) -> Option<String> {
        if self.key_fn.is_some() || self.skip_fn.is_some() || self.exceeded_fn.is_some() {
            return None;
        }
        Some(format!(
            "{:?}@{:p}",
            self.config,
            Arc::as_ptr(&self.store).cast::<()>()
        ))
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, PipelineResult<Response>> {
        Box::pin(async move {
            let Some(key) = self.extract_key(ctx, &request) else {
                return next.run(ctx, request).await;
            };

            let decision = self
                .store
                .update_json(&key, Some(self.record_ttl()), |window: &mut RateWindow| {
                    self.check(window, self.clock.now().as_millis() as u64)
                })
                .await;

            let decision = match decision {
                Ok(decision) => decision,
                Err(e) => {
                    tracing::warn!(
                        limiter = %key,
                        store = self.store.name(),
                        { fields::ERROR } = %e,
                        "rate window unavailable, passing request through"
                    );
                    return next.run(ctx, request).await;
                }
            };

            let config = &self.config;
            match decision {
                Decision::Allowed {
                    remaining,
                    reset_secs,
                } => {
                    let mut response = next.run(ctx, request).await?;
                    response.set_header(&config.limit_header, config.max_attempts);
                    response.set_header(&config.remaining_header, remaining);
                    response.set_header(&config.reset_header, reset_secs);
                    Ok(response)
                }
                Decision::Limited {
                    window,
                    limit,
                    retry_after_secs,
                } => {
                    tracing::info!(
                        limiter = %key,
                        window = window.as_str(),
                        { fields::REQUEST_ID } = %ctx.request_id(),
                        retry_after_secs,
                        "rate limit exceeded"
                    );
                    metrics::counter!("keel_rate_limited_total", "window" => window.as_str())
                        .increment(1);

                    let exceeded = RateLimitExceeded {
                        key,
                        window,
                        limit,
                        retry_after_secs,
                        request_id: ctx.request_id().to_string(),
                    };
                    let mut response = match &self.exceeded_fn {
                        Some(f) => f(&exceeded),
                        None => Self::default_exceeded(&exceeded),
                    };
                    response.set_header(&config.limit_header, limit);
                    response.set_header(&config.remaining_header, 0);
                    response.set_header(&config.reset_header, retry_after_secs);
                    response.set_header(&config.retry_after_header, retry_after_secs);
                    Ok(response)
                }
            }
        })
    }
}
