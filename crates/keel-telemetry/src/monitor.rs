//! Performance monitor.
//!
//! The monitor sees every request twice: [`PerformanceMonitor::request_started`]
//! hands out an [`InFlightRequest`] guard, and finishing (or dropping) that
//! guard records latency, status and the originating stage of any error.
//! Because the record happens in the guard, starts and finishes always pair
//! up, including when the caller's future is cancelled mid-pipeline.
//!
//! Aggregates live in atomics: a fixed ring of latency samples, request and
//! error counters, and the active request gauge. [`live_metrics`] is a
//! lock-free snapshot. Only the bounded error log takes a lock, and only on
//! the error path.
//!
//! A governor [`tick`] asks the memory governor to sample and collect, then
//! moves the performance profile up with load or back to `Balanced` under
//! memory pressure. Ticks run on a timer through [`spawn_governor`]. Every
//! `sample_every_requests` finished requests the monitor also marks a tick
//! as due and wakes that loop; the finishing request never samples memory
//! itself. Without a loop, [`run_pending_tick`] runs a due tick on demand.
//!
//! [`live_metrics`]: PerformanceMonitor::live_metrics
//! [`tick`]: PerformanceMonitor::tick
//! [`spawn_governor`]: PerformanceMonitor::spawn_governor
//! [`run_pending_tick`]: PerformanceMonitor::run_pending_tick

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use keel_config::MonitorConfig;
use keel_core::{PerformanceProfile, PressureLevel};
use keel_runtime::{GovernorDecision, Runtime, RuntimeError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::TelemetryError;
use crate::metrics;
use crate::TelemetryResult;

/// How a request left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    /// A response was produced, whatever its status.
    Responded,
    /// The pipeline reported a defect.
    Failed,
    /// The guard was dropped before the request finished.
    Cancelled,
}

impl RequestOutcome {
    /// Label used in metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Responded => "responded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One recorded error event.
///
/// Carries enough context to aggregate by status and stage; request bodies
/// are never retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEvent {
    /// When the request finished, as read from the runtime clock.
    pub timestamp: Duration,
    /// Request method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Response status; `None` when no response was produced.
    pub status: Option<u16>,
    /// Stage the error is attributed to.
    pub origin_stage: Option<String>,
    /// How the request ended.
    pub outcome: RequestOutcome,
    /// Request latency.
    pub latency: Duration,
}

/// Lock-free snapshot of current load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LiveMetrics {
    /// Last sampled memory pressure.
    pub memory_pressure: PressureLevel,
    /// `active_requests / max_concurrency`.
    pub current_load: f64,
    /// Requests currently inside a pipeline.
    pub active_requests: u64,
    /// The profile new requests will run under.
    pub profile: PerformanceProfile,
}

/// Aggregates over the monitor's lifetime and latency window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregateMetrics {
    /// Median latency over the latency window.
    pub p50_latency: Duration,
    /// 95th percentile latency over the latency window.
    pub p95_latency: Duration,
    /// Finished requests per second since the monitor started.
    pub throughput: f64,
    /// Fraction of finished requests that were errors.
    pub error_rate: f64,
    /// Finished requests.
    pub total_requests: u64,
    /// Error events.
    pub total_errors: u64,
}

/// What one governor tick observed and did.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TickReport {
    /// The governor pass, unless the runtime is shut down.
    pub decision: Option<GovernorDecision>,
    /// Load when the tick ran.
    pub load: f64,
    /// Profile after the tick.
    pub profile: PerformanceProfile,
    /// Whether the tick changed the profile.
    pub switched: bool,
}

/// Records request timings and drives profile switching.
#[derive(Debug)]
pub struct PerformanceMonitor {
    config: MonitorConfig,
    runtime: Arc<Runtime>,
    started_at: Duration,
    active: AtomicU64,
    finished: AtomicU64,
    errors: AtomicU64,
    latencies: Box<[AtomicU64]>,
    latency_cursor: AtomicUsize,
    error_log: Mutex<VecDeque<ErrorEvent>>,
    tick_due: AtomicBool,
    tick_signal: Arc<Notify>,
}

impl PerformanceMonitor {
    /// Creates a monitor bound to `runtime`.
    pub fn new(config: &MonitorConfig, runtime: Arc<Runtime>) -> Arc<Self> {
        let window = config.latency_window.max(1);
        let latencies = (0..window).map(|_| AtomicU64::new(0)).collect();
        Arc::new(Self {
            config: config.clone(),
            started_at: runtime.clock().now(),
            runtime,
            active: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latencies,
            latency_cursor: AtomicUsize::new(0),
            error_log: Mutex::new(VecDeque::with_capacity(config.error_log_capacity)),
            tick_due: AtomicBool::new(false),
            tick_signal: Arc::new(Notify::new()),
        })
    }

    /// The runtime this monitor reports on.
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Marks a request as started.
    ///
    /// The returned guard snapshots the active profile; a switch after this
    /// point does not affect the request.
    pub fn request_started(self: &Arc<Self>, method: &Method, path: &str) -> InFlightRequest {
        self.active.fetch_add(1, Ordering::AcqRel);
        metrics::increment_in_flight();
        InFlightRequest {
            monitor: self.clone(),
            started_at: self.runtime.clock().now(),
            method: method.clone(),
            path: path.to_string(),
            profile: self.runtime.profile().current(),
            done: false,
        }
    }

    fn request_finished(
        &self,
        request: &InFlightRequest,
        status: Option<StatusCode>,
        origin_stage: Option<&str>,
        outcome: RequestOutcome,
    ) {
        let now = self.runtime.clock().now();
        let latency = now.saturating_sub(request.started_at);

        self.active.fetch_sub(1, Ordering::AcqRel);
        metrics::decrement_in_flight();
        self.record_latency(latency);
        metrics::record_request(
            &request.method,
            status.map_or(0, |s| s.as_u16()),
            latency,
        );

        let is_error = outcome != RequestOutcome::Responded
            || status.is_some_and(|s| s.is_client_error() || s.is_server_error());
        if is_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
            metrics::record_error(origin_stage, outcome.as_str());
            self.push_error(ErrorEvent {
                timestamp: now,
                method: request.method.to_string(),
                path: request.path.clone(),
                status: status.map(|s| s.as_u16()),
                origin_stage: origin_stage.map(str::to_string),
                outcome,
                latency,
            });
        }

        let finished = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        let every = self.config.sample_every_requests;
        if every > 0 && finished % every == 0 && !self.tick_due.swap(true, Ordering::AcqRel) {
            self.tick_signal.notify_one();
        }
    }

    fn record_latency(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        let slot = self.latency_cursor.fetch_add(1, Ordering::AcqRel) % self.latencies.len();
        self.latencies[slot].store(nanos, Ordering::Relaxed);
    }

    fn push_error(&self, event: ErrorEvent) {
        let capacity = self.config.error_log_capacity;
        if capacity == 0 {
            return;
        }
        let mut log = self.error_log.lock();
        if log.len() == capacity {
            log.pop_front();
        }
        log.push_back(event);
    }

    /// Requests currently inside a pipeline.
    pub fn active_requests(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    /// `active_requests / max_concurrency`.
    pub fn current_load(&self) -> f64 {
        self.active_requests() as f64 / self.config.max_concurrency.max(1) as f64
    }

    /// Snapshot of current load. Takes no locks.
    pub fn live_metrics(&self) -> LiveMetrics {
        LiveMetrics {
            memory_pressure: self.runtime.governor().last_level(),
            current_load: self.current_load(),
            active_requests: self.active_requests(),
            profile: self.runtime.profile().current(),
        }
    }

    /// Latency percentiles, throughput and error rate.
    pub fn aggregate_metrics(&self) -> AggregateMetrics {
        let total_requests = self.finished.load(Ordering::Acquire);
        let total_errors = self.errors.load(Ordering::Acquire);

        let recorded = self.latency_cursor.load(Ordering::Acquire).min(self.latencies.len());
        let mut samples: Vec<u64> = self.latencies[..recorded]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect();
        samples.sort_unstable();

        let elapsed = self
            .runtime
            .clock()
            .now()
            .saturating_sub(self.started_at)
            .as_secs_f64();
        let throughput = if elapsed > 0.0 {
            total_requests as f64 / elapsed
        } else {
            0.0
        };
        let error_rate = if total_requests == 0 {
            0.0
        } else {
            total_errors as f64 / total_requests as f64
        };

        AggregateMetrics {
            p50_latency: percentile(&samples, 0.50),
            p95_latency: percentile(&samples, 0.95),
            throughput,
            error_rate,
            total_requests,
            total_errors,
        }
    }

    /// Recorded error events, oldest first.
    pub fn recent_errors(&self) -> Vec<ErrorEvent> {
        self.error_log.lock().iter().cloned().collect()
    }

    /// Sets the profile explicitly and pins it against the governor.
    pub fn set_profile(&self, profile: PerformanceProfile) {
        self.runtime.profile().set_override(profile);
    }

    /// Lets the governor manage the profile again.
    pub fn clear_override(&self) {
        self.runtime.profile().clear_override();
    }

    /// Runs one governor pass.
    ///
    /// HIGH or CRITICAL memory pressure moves the profile back to
    /// `Balanced`. Otherwise load at or above `extreme_load_ratio` selects
    /// `Extreme`, at or above `high_load_ratio` selects `High`, and load
    /// below half of `high_load_ratio` returns to `Balanced`. Pinned
    /// profiles are left alone.
    pub fn tick(&self) -> TickReport {
        self.tick_due.store(false, Ordering::Release);
        let decision = match self.runtime.governor().govern() {
            Ok(decision) => Some(decision),
            Err(RuntimeError::ShutDown) => None,
            Err(e) => {
                warn!(error = %e, "memory governor pass failed");
                None
            }
        };

        let load = self.current_load();
        let profile = self.runtime.profile();
        let mut switched = false;

        if self.config.auto_profile && !profile.is_pinned() {
            let pressure = decision.map_or_else(
                || self.runtime.governor().last_level(),
                |d| d.sample.level,
            );
            let current = profile.selected();
            let target = if pressure >= PressureLevel::High {
                Some((PerformanceProfile::Balanced, "memory_pressure"))
            } else if load >= self.config.extreme_load_ratio {
                Some((PerformanceProfile::Extreme, "load"))
            } else if load >= self.config.high_load_ratio {
                (current < PerformanceProfile::High).then_some((PerformanceProfile::High, "load"))
            } else if load < self.config.high_load_ratio / 2.0 {
                Some((PerformanceProfile::Balanced, "idle"))
            } else {
                None
            };

            if let Some((target, reason)) = target {
                switched = profile.switch_to(target, reason);
            }
        }

        debug!(load, profile = %profile.current(), switched, "governor tick");
        TickReport {
            decision,
            load,
            profile: profile.current(),
            switched,
        }
    }

    /// Returns `true` if finished requests asked for a tick that has not
    /// run yet.
    pub fn tick_pending(&self) -> bool {
        self.tick_due.load(Ordering::Acquire)
    }

    /// Runs a tick if one is due.
    pub fn run_pending_tick(&self) -> Option<TickReport> {
        self.tick_pending().then(|| self.tick())
    }

    /// Runs [`tick`](Self::tick) every `interval` on the tokio runtime, and
    /// as soon as finished requests mark a tick as due.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_governor(self: &Arc<Self>, interval: Duration) -> GovernorHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let monitor = Arc::downgrade(self);
        let signal = self.tick_signal.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        if monitor.runtime.is_shut_down() {
                            break;
                        }
                        monitor.tick();
                    }
                    () = signal.notified() => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        if monitor.runtime.is_shut_down() {
                            break;
                        }
                        monitor.run_pending_tick();
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("governor loop stopped");
        });

        GovernorHandle { stop_tx, task }
    }

    /// Spawns the governor loop at the configured interval.
    pub fn spawn_configured_governor(self: &Arc<Self>) -> GovernorHandle {
        self.spawn_governor(Duration::from_millis(self.config.governor_interval_ms.max(1)))
    }
}

/// Nearest-rank percentile over sorted nanosecond samples.
fn percentile(sorted: &[u64], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    Duration::from_nanos(sorted[index])
}

/// A started request.
///
/// Call [`finish`](Self::finish) or [`fail`](Self::fail) when the pipeline
/// is done; dropping the guard without either records a cancellation.
#[derive(Debug)]
pub struct InFlightRequest {
    monitor: Arc<PerformanceMonitor>,
    started_at: Duration,
    method: Method,
    path: String,
    profile: PerformanceProfile,
    done: bool,
}

impl InFlightRequest {
    /// The profile active when the request started.
    pub const fn profile(&self) -> PerformanceProfile {
        self.profile
    }

    /// Start time on the runtime clock.
    pub const fn started_at(&self) -> Duration {
        self.started_at
    }

    /// Time since the request started, floored at zero.
    pub fn elapsed(&self) -> Duration {
        self.monitor.runtime.clock().elapsed_since(self.started_at)
    }

    /// Records a response.
    ///
    /// `origin_stage` attributes an error status to the stage that produced
    /// it.
    pub fn finish(mut self, status: StatusCode, origin_stage: Option<&str>) {
        self.done = true;
        self.monitor
            .request_finished(&self, Some(status), origin_stage, RequestOutcome::Responded);
    }

    /// Records a pipeline defect.
    pub fn fail(mut self, status: StatusCode, origin_stage: Option<&str>) {
        self.done = true;
        self.monitor
            .request_finished(&self, Some(status), origin_stage, RequestOutcome::Failed);
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;
            self.monitor
                .request_finished(self, None, None, RequestOutcome::Cancelled);
        }
    }
}

/// Handle to a running governor loop.
#[derive(Debug)]
pub struct GovernorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl GovernorHandle {
    /// Returns `true` once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop and waits for it to exit.
    pub async fn stop(self) -> TelemetryResult<()> {
        let _ = self.stop_tx.send(true);
        self.task
            .await
            .map_err(|e| TelemetryError::GovernorStopped(e.to_string()))
    }
}
