//! Circuit breaker and rate limiter behaviour through compiled pipelines.
//!
//! Time is driven by a [`ManualClock`] shared by the stages and their
//! [`MemoryStore`], so windows and recovery timeouts are crossed exactly.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use keel_config::{CircuitBreakerConfig, RateLimitConfig};
use keel_core::{ManualClock, ServiceLocator};
use keel_middleware::stages::{
    CircuitBreakerMiddleware, CircuitState, LimitWindow, RateLimitMiddleware,
};
use keel_middleware::{
    handler_fn, CompiledPipeline, Endpoint, MemoryStore, MiddlewareContext, PipelineCompiler,
    Request, Response, ResponseExt, Stage, StateStore,
};
use tokio::sync::Notify;

fn make_request(path: &str) -> Request {
    http::Request::builder()
        .method(Method::GET)
        .uri(path)
        .header("x-forwarded-for", "198.51.100.4")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

struct Backend {
    calls: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl Backend {
    fn new() -> Self {
        Self {
            calls: Arc::default(),
            failing: Arc::new(AtomicBool::new(true)),
        }
    }

    fn endpoint(&self) -> Arc<dyn Endpoint> {
        let calls = self.calls.clone();
        let failing = self.failing.clone();
        Arc::new(handler_fn("backend", move |ctx: &mut MiddlewareContext, _req| {
            calls.fetch_add(1, Ordering::SeqCst);
            let mut response = ctx.respond("backend");
            if failing.load(Ordering::SeqCst) {
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            }
            async move { response }
        }))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<dyn StateStore>,
    compiler: PipelineCompiler,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(Duration::from_secs(1_000)));
    Harness {
        store: MemoryStore::shared(clock.clone()),
        clock,
        compiler: PipelineCompiler::new(Arc::new(ServiceLocator::new())),
    }
}

impl Harness {
    fn breaker(&self) -> CircuitBreakerMiddleware {
        CircuitBreakerMiddleware::new(
            CircuitBreakerConfig::default(),
            self.store.clone(),
            self.clock.clone(),
        )
    }

    fn limiter(&self, config: RateLimitConfig) -> RateLimitMiddleware {
        RateLimitMiddleware::new(config, self.store.clone(), self.clock.clone())
    }

    fn pipeline(&self, stage: Stage, endpoint: Arc<dyn Endpoint>) -> Arc<CompiledPipeline> {
        self.compiler.compile(&[stage.into()], endpoint).unwrap()
    }
}

async fn send(pipeline: &CompiledPipeline, path: &str) -> Response {
    pipeline.handle(MiddlewareContext::new(), make_request(path)).await
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[tokio::test]
async fn test_breaker_opens_then_fails_fast() {
    let h = harness();
    let backend = Backend::new();
    let breaker = h.breaker();
    let key = breaker.key_for(&make_request("/orders"));
    let pipeline = h.pipeline(Stage::handler(breaker), backend.endpoint());

    for _ in 0..5 {
        let response = send(&pipeline, "/orders").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert_eq!(backend.calls(), 5);

    let reader = h.breaker();
    assert_eq!(reader.record(&key).await.unwrap().state, CircuitState::Open);

    let response = send(&pipeline, "/orders").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["retry-after"], "30");
    assert_eq!(backend.calls(), 5);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "SERVICE_UNAVAILABLE");
    assert_eq!(json["error"]["details"]["resource"], key);

    h.clock.advance(Duration::from_secs(12));
    let response = send(&pipeline, "/orders").await;
    assert_eq!(response.headers()["retry-after"], "18");
}

#[tokio::test]
async fn test_breaker_admits_one_trial_after_timeout() {
    let h = harness();
    let backend = Backend::new();
    let pipeline = h.pipeline(Stage::handler(h.breaker()), backend.endpoint());

    for _ in 0..5 {
        send(&pipeline, "/orders").await;
    }
    h.clock.advance(Duration::from_secs(30));

    let response = send(&pipeline, "/orders").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(backend.calls(), 6);

    // The failed trial re-opened the breaker with a fresh timeout.
    let response = send(&pipeline, "/orders").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(backend.calls(), 6);

    h.clock.advance(Duration::from_secs(30));
    backend.recover();
    assert_eq!(send(&pipeline, "/orders").await.status(), StatusCode::OK);
    assert_eq!(send(&pipeline, "/orders").await.status(), StatusCode::OK);
    assert_eq!(backend.calls(), 8);

    let breaker = h.breaker();
    let key = breaker.key_for(&make_request("/orders"));
    let record = breaker.record(&key).await.unwrap();
    assert_eq!(record.state, CircuitState::Closed);
    assert_eq!(record.consecutive_failures, 0);
}

#[tokio::test]
async fn test_breaker_rejects_while_trial_in_flight() {
    let h = harness();
    let backend = Backend::new();
    let failing = h.pipeline(Stage::handler(h.breaker()), backend.endpoint());
    for _ in 0..5 {
        send(&failing, "/slow").await;
    }
    h.clock.advance(Duration::from_secs(30));

    let gate = Arc::new(Notify::new());
    let trial_gate = gate.clone();
    let slow: Arc<dyn Endpoint> = Arc::new(handler_fn(
        "slow",
        move |ctx: &mut MiddlewareContext, _req| {
            let gate = trial_gate.clone();
            let response = ctx.respond("slow");
            async move {
                gate.notified().await;
                response
            }
        },
    ));
    let pipeline = h.pipeline(Stage::handler(h.breaker()), slow);

    let trial = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { send(&pipeline, "/slow").await.status() }
    });
    while !trial.is_finished() && !gate_waiting(&h, "/slow").await {
        tokio::task::yield_now().await;
    }

    let rejected = send(&pipeline, "/slow").await;
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);

    gate.notify_one();
    assert_eq!(trial.await.unwrap(), StatusCode::OK);
}

/// Whether the half-open trial for `path` has been admitted.
async fn gate_waiting(h: &Harness, path: &str) -> bool {
    let breaker = h.breaker();
    let record = breaker
        .record(&breaker.key_for(&make_request(path)))
        .await
        .unwrap();
    record.state == CircuitState::HalfOpen && record.trial_started_at_ms.is_some()
}

#[tokio::test]
async fn test_breakers_sharing_a_store_share_state() {
    let h = harness();
    let backend = Backend::new();
    let first = h.pipeline(Stage::handler(h.breaker()), backend.endpoint());
    let second = h
        .compiler
        .compile(
            &[Stage::handler(h.breaker()).into()],
            Backend::new().endpoint(),
        )
        .unwrap();

    for _ in 0..5 {
        send(&first, "/shared").await;
    }
    assert_eq!(send(&second, "/shared").await.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(send(&second, "/other").await.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_breaker_records_stay_bounded() {
    let clock = Arc::new(ManualClock::new(Duration::from_secs(1_000)));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let breaker = CircuitBreakerMiddleware::new(
        CircuitBreakerConfig::default(),
        store.clone(),
        clock.clone(),
    );
    let ttl = breaker.record_ttl();
    let backend = Backend::new();
    backend.recover();
    let pipeline = PipelineCompiler::new(Arc::new(ServiceLocator::new()))
        .compile(&[Stage::handler(breaker).into()], backend.endpoint())
        .unwrap();

    for i in 0..1_000 {
        let response = send(&pipeline, &format!("/users/{i}")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert!(store.is_empty());

    backend.failing.store(true, Ordering::SeqCst);
    for i in 0..10 {
        send(&pipeline, &format!("/users/{i}")).await;
    }
    assert_eq!(store.len(), 10);

    clock.advance(ttl);
    store.purge_expired();
    assert!(store.is_empty());
}

// ============================================================================
// Rate limiter
// ============================================================================

fn ok_endpoint() -> Arc<dyn Endpoint> {
    Arc::new(handler_fn("ok", |ctx: &mut MiddlewareContext, _req| {
        let response = ctx.respond("ok");
        async move { response }
    }))
}

#[tokio::test]
async fn test_limiter_rejects_past_budget_and_recovers() {
    let h = harness();
    let config = RateLimitConfig {
        max_attempts: 3,
        ..RateLimitConfig::default()
    };
    let pipeline = h.pipeline(Stage::handler(h.limiter(config)), ok_endpoint());

    for remaining in ["2", "1", "0"] {
        let response = send(&pipeline, "/api").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "3");
        assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
        assert_eq!(response.headers()["x-ratelimit-reset"], "60");
    }

    h.clock.advance(Duration::from_secs(15));
    let response = send(&pipeline, "/api").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "45");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "RATE_LIMITED");
    assert_eq!(json["error"]["details"]["retry_after_seconds"], 45);

    h.clock.advance(Duration::from_secs(45));
    let response = send(&pipeline, "/api").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-remaining"], "2");
}

#[tokio::test]
async fn test_limiter_keys_clients_separately() {
    let h = harness();
    let config = RateLimitConfig {
        max_attempts: 1,
        ..RateLimitConfig::default()
    };
    let pipeline = h.pipeline(Stage::handler(h.limiter(config)), ok_endpoint());

    assert_eq!(send(&pipeline, "/api").await.status(), StatusCode::OK);
    assert_eq!(send(&pipeline, "/api").await.status(), StatusCode::TOO_MANY_REQUESTS);

    let other = http::Request::builder()
        .uri("/api")
        .header("x-forwarded-for", "203.0.113.9")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = pipeline.handle(MiddlewareContext::new(), other).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_burst_window_trips_before_primary() {
    let h = harness();
    let config = RateLimitConfig {
        max_attempts: 100,
        burst_max: Some(2),
        burst_window_secs: Some(10),
        ..RateLimitConfig::default()
    };
    let limiter = h.limiter(config).with_exceeded_response(|exceeded| {
        let mut response = Response::json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "SLOW_DOWN",
            exceeded.window.as_str(),
        );
        response.set_header("x-window", exceeded.window.as_str());
        assert_eq!(exceeded.window, LimitWindow::Burst);
        response
    });
    let pipeline = h.pipeline(Stage::handler(limiter), ok_endpoint());

    assert_eq!(send(&pipeline, "/api").await.status(), StatusCode::OK);
    assert_eq!(send(&pipeline, "/api").await.status(), StatusCode::OK);

    let response = send(&pipeline, "/api").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["x-window"], "burst");
    assert_eq!(response.headers()["x-ratelimit-limit"], "2");
    assert_eq!(response.headers()["retry-after"], "10");

    h.clock.advance(Duration::from_secs(10));
    let response = send(&pipeline, "/api").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-remaining"], "97");
}

#[tokio::test]
async fn test_skipped_requests_bypass_limiter() {
    let h = harness();
    let config = RateLimitConfig {
        max_attempts: 1,
        ..RateLimitConfig::default()
    };
    let limiter = h
        .limiter(config)
        .with_skip(|_, req| req.uri().path() == "/health");
    let pipeline = h.pipeline(Stage::handler(limiter), ok_endpoint());

    for _ in 0..3 {
        let response = send(&pipeline, "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
    assert_eq!(send(&pipeline, "/api").await.status(), StatusCode::OK);
}
