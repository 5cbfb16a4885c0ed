//! Circuit breaker middleware.
//!
//! Each endpoint (method + path) has its own breaker record in the
//! [`StateStore`]:
//!
//! ```text
//!            failures >= failure_threshold
//!   CLOSED ─────────────────────────────────► OPEN
//!     ▲                                        │ recovery timeout elapsed,
//!     │ successes >= success_threshold         │ next request is the trial
//!     │                                        ▼
//!     └──────────────────────────────────  HALF_OPEN
//!                                              │ trial failed
//!                                   OPEN ◄─────┘
//! ```
//!
//! While open, requests fail fast with `503 Service Unavailable` and a
//! `Retry-After` header; downstream is not invoked. A half-open breaker
//! admits one trial at a time. A trial that never reports back (its request
//! was cancelled) is superseded after another recovery timeout.
//!
//! A failure is a downstream error or a response status at or above
//! `failure_status_min`. Store errors never fail the request: the breaker
//! lets traffic through and logs the error.
//!
//! Endpoints that have only seen healthy traffic leave no record behind.
//! Other records expire after [`RECORD_TTL_FLOOR`] or twice the recovery
//! timeout, whichever is longer, counted from their last update.

use std::sync::Arc;
use std::time::Duration;

use keel_config::CircuitBreakerConfig;
use keel_core::{Clock, KeelError, SharedClock};
use keel_telemetry::logging::fields;
use serde::{Deserialize, Serialize};

use crate::context::MiddlewareContext;
use crate::error::PipelineResult;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::store::{StateStore, StoreResult};
use crate::types::{Request, Response};

/// Shortest lifetime of a stored breaker record.
pub const RECORD_TTL_FLOOR: Duration = Duration::from_secs(60);

/// Breaker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests pass through.
    #[default]
    Closed,
    /// Requests fail fast.
    Open,
    /// One trial request at a time is admitted.
    HalfOpen,
}

impl CircuitState {
    /// Returns the lowercase name used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Stored breaker record for one protected resource.
///
/// Timestamps are milliseconds on the breaker's clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitRecord {
    /// Current state.
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Trial successes since the breaker went half-open.
    pub consecutive_successes: u32,
    /// When the breaker last opened.
    pub opened_at_ms: Option<u64>,
    /// When the last failure was recorded.
    pub last_failure_at_ms: Option<u64>,
    /// When the outstanding half-open trial was admitted.
    pub trial_started_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Pass,
    Trial,
    Reject { retry_after_secs: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
}

/// Circuit breaker stage.
///
/// # Example
///
/// ```ignore
/// use keel_middleware::stages::CircuitBreakerMiddleware;
/// use keel_middleware::{MemoryStore, Stage};
///
/// let breaker = CircuitBreakerMiddleware::new(
///     config.circuit_breaker.clone(),
///     MemoryStore::shared(clock.clone()),
///     clock,
/// );
/// let stage = Stage::handler(breaker);
/// ```
pub struct CircuitBreakerMiddleware {
    config: CircuitBreakerConfig,
    store: Arc<dyn StateStore>,
    clock: SharedClock,
}

impl CircuitBreakerMiddleware {
    /// Creates a breaker over `store`.
    pub fn new(config: CircuitBreakerConfig, store: Arc<dyn StateStore>, clock: SharedClock) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    /// Returns the breaker configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Time an open breaker waits before admitting a trial.
    #[must_use]
    pub const fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.config.recovery_timeout_secs)
    }

    /// Returns the store key protecting `request`'s endpoint.
    #[must_use]
    pub fn key_for(&self, request: &Request) -> String {
        format!(
            "{}{}:{}",
            self.config.key_prefix,
            request.method(),
            request.uri().path()
        )
    }

    /// Reads the stored record for `key`.
    pub async fn record(&self, key: &str) -> StoreResult<CircuitRecord> {
        self.store.get_json_or(key, CircuitRecord::default()).await
    }

    /// Lifetime of a stored record after its last update.
    #[must_use]
    pub fn record_ttl(&self) -> Duration {
        self.recovery_timeout()
            .saturating_mul(2)
            .max(RECORD_TTL_FLOOR)
    }

    fn recovery_timeout_ms(&self) -> u64 {
        self.config.recovery_timeout_secs.saturating_mul(1_000)
    }

    fn now_ms(&self) -> u64 {
        self.clock.now().as_millis() as u64
    }

    fn admit(&self, record: &mut CircuitRecord, now: u64) -> (Admission, Option<Transition>) {
        let timeout = self.recovery_timeout_ms();
        match record.state {
            CircuitState::Closed => (Admission::Pass, None),
            CircuitState::Open => {
                let elapsed = now.saturating_sub(record.opened_at_ms.unwrap_or(0));
                if elapsed >= timeout {
                    record.state = CircuitState::HalfOpen;
                    record.consecutive_successes = 0;
                    record.trial_started_at_ms = Some(now);
                    let transition = Transition {
                        from: CircuitState::Open,
                        to: CircuitState::HalfOpen,
                    };
                    (Admission::Trial, Some(transition))
                } else {
                    let retry_after_secs = ceil_secs(timeout - elapsed);
                    (Admission::Reject { retry_after_secs }, None)
                }
            }
            CircuitState::HalfOpen => match record.trial_started_at_ms {
                Some(started) if now.saturating_sub(started) < timeout => {
                    let retry_after_secs = ceil_secs(timeout - now.saturating_sub(started));
                    (Admission::Reject { retry_after_secs }, None)
                }
                _ => {
                    record.trial_started_at_ms = Some(now);
                    (Admission::Trial, None)
                }
            },
        }
    }

    fn settle(
        &self,
        record: &mut CircuitRecord,
        admission: Admission,
        failed: bool,
        now: u64,
    ) -> Option<Transition> {
        if failed {
            record.last_failure_at_ms = Some(now);
        }
        match (record.state, admission) {
            (CircuitState::Closed, _) => {
                if !failed {
                    record.consecutive_failures = 0;
                    return None;
                }
                record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                if record.consecutive_failures >= self.config.failure_threshold {
                    record.state = CircuitState::Open;
                    record.opened_at_ms = Some(now);
                    record.consecutive_successes = 0;
                    return Some(Transition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                    });
                }
                None
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                record.trial_started_at_ms = None;
                if failed {
                    record.state = CircuitState::Open;
                    record.opened_at_ms = Some(now);
                    record.consecutive_successes = 0;
                    record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                    return Some(Transition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Open,
                    });
                }
                record.consecutive_successes = record.consecutive_successes.saturating_add(1);
                if record.consecutive_successes >= self.config.success_threshold {
                    *record = CircuitRecord::default();
                    return Some(Transition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Closed,
                    });
                }
                None
            }
            // Requests admitted before the breaker tripped only leave their
            // failure timestamp behind.
            _ => None,
        }
    }

    fn report(key: &str, transition: Option<Transition>) {
        if let Some(Transition { from, to }) = transition {
            tracing::info!(
                breaker = key,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker transition"
            );
            metrics::counter!("keel_circuit_transitions_total", "to" => to.as_str()).increment(1);
        }
    }
}

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1_000)
}

impl std::fmt::Debug for CircuitBreakerMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerMiddleware")
            .field("config", &self.config)
            .field("store", &self.store.name())
            .finish_non_exhaustive()
    }
}

impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    fn fingerprint(&self) -> Option<String> {
        let c = &self.config;
        Some(format!(
            "{}/{}/{}/{}/{}@{:p}",
            c.failure_threshold,
            c.success_threshold,
            c.recovery_timeout_secs,
            c.failure_status_min,
            c.key_prefix,
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
            let key = self.key_for(&request);
            let admitted = self
                .store
                .update_json(&key, Some(self.record_ttl()), |record: &mut CircuitRecord| {
                    self.admit(record, self.now_ms())
                })
                .await;

            let admission = match admitted {
                Ok((admission, transition)) => {
                    Self::report(&key, transition);
                    admission
                }
                Err(e) => {
                    tracing::warn!(
                        breaker = %key,
                        store = self.store.name(),
                        { fields::ERROR } = %e,
                        "circuit state unavailable, passing request through"
                    );
                    return next.run(ctx, request).await;
                }
            };

            if let Admission::Reject { retry_after_secs } = admission {
                tracing::debug!(
                    breaker = %key,
                    { fields::REQUEST_ID } = %ctx.request_id(),
                    retry_after_secs,
                    "circuit open, failing fast"
                );
                return Ok(KeelError::unavailable(
                    "Service temporarily unavailable",
                    Some(key),
                    retry_after_secs,
                )
                .into_response(Some(&ctx.request_id().to_string())));
            }

            let result = next.run(ctx, request).await;
            let failed = match &result {
                Ok(response) => response.status().as_u16() >= self.config.failure_status_min,
                Err(_) => true,
            };

            let settled = self
                .store
                .update_json(&key, Some(self.record_ttl()), |record: &mut CircuitRecord| {
                    self.settle(record, admission, failed, self.now_ms())
                })
                .await;
            match settled {
                Ok(transition) => Self::report(&key, transition),
                Err(e) => tracing::warn!(
                    breaker = %key,
                    { fields::ERROR } = %e,
                    "failed to record circuit outcome"
                ),
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ManualClock;

    fn breaker(threshold: u32) -> (Arc<ManualClock>, CircuitBreakerMiddleware) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_000)));
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            success_threshold: 2,
            recovery_timeout_secs: 30,
            ..CircuitBreakerConfig::default()
        };
        let store = crate::store::MemoryStore::shared(clock.clone());
        (clock.clone(), CircuitBreakerMiddleware::new(config, store, clock))
    }

    #[test]
    fn test_closed_counts_consecutive_failures() {
        let (_clock, cb) = breaker(3);
        let mut record = CircuitRecord::default();

        cb.settle(&mut record, Admission::Pass, true, 1);
        cb.settle(&mut record, Admission::Pass, true, 2);
        cb.settle(&mut record, Admission::Pass, false, 3);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.last_failure_at_ms, Some(2));

        cb.settle(&mut record, Admission::Pass, true, 4);
        cb.settle(&mut record, Admission::Pass, true, 5);
        let transition = cb.settle(&mut record, Admission::Pass, true, 6);
        assert_eq!(transition.map(|t| t.to), Some(CircuitState::Open));
        assert_eq!(record.opened_at_ms, Some(6));
    }

    #[test]
    fn test_open_rejects_until_timeout() {
        let (_clock, cb) = breaker(1);
        let mut record = CircuitRecord {
            state: CircuitState::Open,
            opened_at_ms: Some(10_000),
            ..CircuitRecord::default()
        };

        let (admission, _) = cb.admit(&mut record, 20_500);
        assert_eq!(admission, Admission::Reject { retry_after_secs: 20 });

        let (admission, transition) = cb.admit(&mut record, 40_000);
        assert_eq!(admission, Admission::Trial);
        assert_eq!(transition.map(|t| t.to), Some(CircuitState::HalfOpen));

        let (admission, _) = cb.admit(&mut record, 40_001);
        assert!(matches!(admission, Admission::Reject { .. }));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (_clock, cb) = breaker(1);
        let mut record = CircuitRecord {
            state: CircuitState::HalfOpen,
            trial_started_at_ms: Some(5),
            ..CircuitRecord::default()
        };
        let transition = cb.settle(&mut record, Admission::Trial, true, 9);
        assert_eq!(transition.map(|t| t.to), Some(CircuitState::Open));
        assert_eq!(record.opened_at_ms, Some(9));
        assert_eq!(record.trial_started_at_ms, None);
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let (_clock, cb) = breaker(1);
        let mut record = CircuitRecord {
            state: CircuitState::HalfOpen,
            consecutive_failures: 4,
            trial_started_at_ms: Some(5),
            ..CircuitRecord::default()
        };
        assert_eq!(cb.settle(&mut record, Admission::Trial, false, 6), None);
        assert_eq!(record.consecutive_successes, 1);

        let (admission, _) = cb.admit(&mut record, 7);
        assert_eq!(admission, Admission::Trial);
        let transition = cb.settle(&mut record, Admission::Trial, false, 8);
        assert_eq!(transition.map(|t| t.to), Some(CircuitState::Closed));
        assert_eq!(record, CircuitRecord::default());
    }

    #[test]
    fn test_abandoned_trial_is_superseded() {
        let (_clock, cb) = breaker(1);
        let mut record = CircuitRecord {
            state: CircuitState::HalfOpen,
            trial_started_at_ms: Some(0),
            ..CircuitRecord::default()
        };
        let (admission, _) = cb.admit(&mut record, 30_000);
        assert_eq!(admission, Admission::Trial);
        assert_eq!(record.trial_started_at_ms, Some(30_000));
    }

    #[test]
    fn test_key_uses_method_and_path() {
        let (_clock, cb) = breaker(1);
        let request = http::Request::builder()
            .method("POST")
            .uri("/orders?page=2")
            .body(http_body_util::Full::new(bytes::Bytes::new()))
            .unwrap();
        assert_eq!(cb.key_for(&request), "circuit:POST:/orders");
        assert_eq!(cb.recovery_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_fingerprint_distinguishes_stores() {
        let (_clock, a) = breaker(5);
        let (_clock, b) = breaker(5);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.fingerprint());
    }
}
