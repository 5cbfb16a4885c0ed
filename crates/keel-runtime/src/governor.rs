//! Memory governor.
//!
//! The governor samples process memory against a budget, buckets the
//! utilisation into a [`PressureLevel`] using configured bands, and decides
//! whether registered [`Reclaimer`]s should release memory. Which levels
//! trigger a collection depends on the [`GcStrategy`]:
//!
//! | Strategy | Collects at |
//! |---|---|
//! | `Conservative` | HIGH and CRITICAL |
//! | `Aggressive` | MEDIUM and above |
//! | `Adaptive` | HIGH and above, or MEDIUM while utilisation is climbing faster than `trend_escalation` per sample |
//!
//! CRITICAL pressure always uses `Aggressive`, whatever the profile says.
//!
//! Objects registered with an [`ObjectTracker`] are held through `Weak`
//! handles only; tracking never extends a lifetime. The governor owns one
//! tracker and hands it to pools, which register their large-class
//! checkouts there.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use keel_config::MemoryConfig;
use keel_core::{GcStrategy, PressureLevel, SharedClock};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sysinfo::{PidExt, ProcessExt, System, SystemExt};
use tracing::{debug, info, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::profile::ProfileState;

/// Something that can give memory back when the governor asks.
pub trait Reclaimer: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Releases memory appropriate to `level`, returning bytes freed.
    fn reclaim(&self, level: PressureLevel) -> u64;
}

/// Source of process memory readings.
pub trait MemoryProbe: Send + Sync {
    /// Bytes the process currently holds.
    fn bytes_in_use(&self) -> RuntimeResult<u64>;

    /// Bytes available to the machine; the budget when none is configured.
    fn total_bytes(&self) -> RuntimeResult<u64>;
}

/// Reads resident memory of the current process through `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: sysinfo::Pid,
}

impl SysinfoProbe {
    /// Creates a probe for the current process.
    pub fn new() -> RuntimeResult<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| RuntimeError::Probe(e.to_string()))?;
        Ok(Self {
            system: Mutex::new(System::new()),
            pid,
        })
    }
}

impl MemoryProbe for SysinfoProbe {
    fn bytes_in_use(&self) -> RuntimeResult<u64> {
        let mut system = self.system.lock();
        if !system.refresh_process(self.pid) {
            return Err(RuntimeError::Probe(format!(
                "process {} not found",
                self.pid.as_u32()
            )));
        }
        system
            .process(self.pid)
            .map(ProcessExt::memory)
            .ok_or_else(|| RuntimeError::Probe("process disappeared".to_string()))
    }

    fn total_bytes(&self) -> RuntimeResult<u64> {
        let mut system = self.system.lock();
        system.refresh_memory();
        Ok(system.total_memory())
    }
}

impl fmt::Debug for SysinfoProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysinfoProbe")
            .field("pid", &self.pid.as_u32())
            .finish()
    }
}

/// A probe whose readings are set by hand.
#[derive(Debug)]
pub struct ManualProbe {
    in_use: AtomicU64,
    total: u64,
}

impl ManualProbe {
    /// Creates a probe reporting `in_use` out of `total` bytes.
    #[must_use]
    pub fn new(in_use: u64, total: u64) -> Self {
        Self {
            in_use: AtomicU64::new(in_use),
            total,
        }
    }

    /// Changes the reported usage.
    pub fn set(&self, in_use: u64) {
        self.in_use.store(in_use, Ordering::SeqCst);
    }
}

impl MemoryProbe for ManualProbe {
    fn bytes_in_use(&self) -> RuntimeResult<u64> {
        Ok(self.in_use.load(Ordering::SeqCst))
    }

    fn total_bytes(&self) -> RuntimeResult<u64> {
        Ok(self.total)
    }
}

/// Utilisation thresholds for each pressure level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureBands {
    /// MEDIUM from this ratio.
    pub medium: f64,
    /// HIGH from this ratio.
    pub high: f64,
    /// CRITICAL from this ratio.
    pub critical: f64,
}

impl PressureBands {
    /// Buckets a utilisation ratio.
    #[must_use]
    pub fn level(&self, utilisation: f64) -> PressureLevel {
        if utilisation >= self.critical {
            PressureLevel::Critical
        } else if utilisation >= self.high {
            PressureLevel::High
        } else if utilisation >= self.medium {
            PressureLevel::Medium
        } else {
            PressureLevel::Low
        }
    }
}

impl From<&MemoryConfig> for PressureBands {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            medium: config.medium_ratio,
            high: config.high_ratio,
            critical: config.critical_ratio,
        }
    }
}

/// Latest pressure level, readable without locks.
///
/// The governor writes it on every sample; the buffer pool reads it before
/// large allocations.
#[derive(Debug, Default)]
pub struct PressureSignal(AtomicU8);

impl PressureSignal {
    /// Returns the last sampled level.
    pub fn level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, level: PressureLevel) {
        self.0.store(level.as_u8(), Ordering::Release);
    }
}

/// One memory reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryPressureSample {
    /// When the reading was taken, since the Unix epoch.
    pub timestamp: Duration,
    /// Bytes held by the process.
    pub bytes_in_use: u64,
    /// The memory budget.
    pub bytes_limit: u64,
    /// Bucketed utilisation.
    pub level: PressureLevel,
}

impl MemoryPressureSample {
    /// `bytes_in_use / bytes_limit`.
    #[must_use]
    pub fn utilisation(&self) -> f64 {
        if self.bytes_limit == 0 {
            0.0
        } else {
            self.bytes_in_use as f64 / self.bytes_limit as f64
        }
    }
}

/// Result of one collection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    /// Bytes freed by reclaimers.
    pub bytes: u64,
    /// Reclaimers invoked.
    pub reclaimers: usize,
    /// Dead tracking handles dropped.
    pub pruned_handles: usize,
}

/// What one governor pass observed and did.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GovernorDecision {
    /// The sample taken.
    pub sample: MemoryPressureSample,
    /// The strategy applied.
    pub strategy: GcStrategy,
    /// The collection, when one ran.
    pub collected: Option<CollectionReport>,
}

/// Cumulative diagnostics returned at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GovernorReport {
    /// Collection runs performed.
    pub gc_runs: u64,
    /// Bytes reclaimed across all runs.
    pub bytes_collected: u64,
    /// Tracked objects still alive, by category.
    pub live_objects: HashMap<&'static str, usize>,
}

struct TrackedObject {
    category: &'static str,
    handle: Weak<dyn Any + Send + Sync>,
}

/// Non-owning registry of live objects by category.
///
/// Dead handles are dropped whenever the registry would otherwise grow, so
/// it holds at most about twice as many handles as there are live objects.
#[derive(Default)]
pub struct ObjectTracker {
    tracked: Mutex<Vec<TrackedObject>>,
}

impl ObjectTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts `object` under `category` without keeping it alive.
    pub fn track<T: Any + Send + Sync>(&self, object: &Arc<T>, category: &'static str) {
        let handle: Weak<T> = Arc::downgrade(object);
        let handle: Weak<dyn Any + Send + Sync> = handle;
        let mut tracked = self.tracked.lock();
        if tracked.len() == tracked.capacity() {
            tracked.retain(|t| t.handle.strong_count() > 0);
        }
        tracked.push(TrackedObject { category, handle });
    }

    /// Live tracked objects by category. Dead handles are dropped.
    pub fn live(&self) -> HashMap<&'static str, usize> {
        let mut tracked = self.tracked.lock();
        tracked.retain(|t| t.handle.strong_count() > 0);
        let mut counts = HashMap::new();
        for t in tracked.iter() {
            *counts.entry(t.category).or_insert(0) += 1;
        }
        counts
    }

    /// Drops dead handles and returns how many there were.
    pub fn prune(&self) -> usize {
        let mut tracked = self.tracked.lock();
        let before = tracked.len();
        tracked.retain(|t| t.handle.strong_count() > 0);
        before - tracked.len()
    }

    /// Handles currently held, live or not.
    pub fn handles(&self) -> usize {
        self.tracked.lock().len()
    }
}

impl fmt::Debug for ObjectTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectTracker")
            .field("handles", &self.handles())
            .finish()
    }
}

/// Observes memory pressure and drives reclamation.
pub struct MemoryGovernor {
    probe: Arc<dyn MemoryProbe>,
    clock: SharedClock,
    profile: Arc<ProfileState>,
    bands: PressureBands,
    limit: u64,
    trend_window: usize,
    trend_escalation: f64,
    forced_strategy: Option<GcStrategy>,
    signal: Arc<PressureSignal>,
    history: Mutex<VecDeque<MemoryPressureSample>>,
    reclaimers: RwLock<Vec<Arc<dyn Reclaimer>>>,
    tracker: Arc<ObjectTracker>,
    gc_runs: AtomicU64,
    bytes_collected: AtomicU64,
    shut_down: AtomicBool,
}

impl MemoryGovernor {
    /// Creates a governor.
    ///
    /// A zero `limit_bytes` budgets against the probe's total memory.
    pub fn new(
        config: &MemoryConfig,
        profile: Arc<ProfileState>,
        probe: Arc<dyn MemoryProbe>,
        clock: SharedClock,
    ) -> RuntimeResult<Self> {
        let limit = if config.limit_bytes > 0 {
            config.limit_bytes
        } else {
            probe.total_bytes()?
        };
        if limit == 0 {
            return Err(RuntimeError::Probe(
                "memory budget resolved to zero bytes".to_string(),
            ));
        }

        Ok(Self {
            probe,
            clock,
            profile,
            bands: PressureBands::from(config),
            limit,
            trend_window: config.trend_window.max(2),
            trend_escalation: config.trend_escalation,
            forced_strategy: config.strategy,
            signal: Arc::new(PressureSignal::default()),
            history: Mutex::new(VecDeque::with_capacity(config.trend_window)),
            reclaimers: RwLock::new(Vec::new()),
            tracker: Arc::new(ObjectTracker::new()),
            gc_runs: AtomicU64::new(0),
            bytes_collected: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    /// The memory budget in bytes.
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// Shared handle to the latest pressure level.
    pub fn signal(&self) -> Arc<PressureSignal> {
        self.signal.clone()
    }

    /// The level of the most recent sample, without sampling.
    pub fn last_level(&self) -> PressureLevel {
        self.signal.level()
    }

    /// Registers a reclaimer to run on collection.
    pub fn register_reclaimer(&self, reclaimer: Arc<dyn Reclaimer>) {
        self.reclaimers.write().push(reclaimer);
    }

    /// Takes a reading and records it in the trend window.
    pub fn sample(&self) -> RuntimeResult<MemoryPressureSample> {
        let bytes_in_use = self.probe.bytes_in_use()?;
        let mut sample = MemoryPressureSample {
            timestamp: self.clock.now(),
            bytes_in_use,
            bytes_limit: self.limit,
            level: PressureLevel::Low,
        };
        sample.level = self.bands.level(sample.utilisation());

        {
            let mut history = self.history.lock();
            if history.len() == self.trend_window {
                history.pop_front();
            }
            history.push_back(sample);
        }

        let previous = self.signal.level();
        self.signal.store(sample.level);
        metrics::gauge!("keel_memory_pressure_level").set(f64::from(sample.level.as_u8()));
        if previous != sample.level {
            debug!(from = %previous, to = %sample.level, bytes_in_use, "memory pressure changed");
        }

        Ok(sample)
    }

    /// Samples kept for trend analysis, oldest first.
    pub fn history(&self) -> Vec<MemoryPressureSample> {
        self.history.lock().iter().copied().collect()
    }

    /// Mean utilisation change per sample across the trend window.
    pub fn trend(&self) -> f64 {
        let history = self.history.lock();
        match (history.front(), history.back()) {
            (Some(first), Some(last)) if history.len() >= 2 => {
                (last.utilisation() - first.utilisation()) / (history.len() - 1) as f64
            }
            _ => 0.0,
        }
    }

    /// Picks the strategy for `sample`.
    pub fn choose_strategy(&self, sample: &MemoryPressureSample) -> GcStrategy {
        if sample.level == PressureLevel::Critical {
            return GcStrategy::Aggressive;
        }
        self.forced_strategy
            .unwrap_or_else(|| self.profile.knobs().gc_strategy)
    }

    /// Whether `strategy` calls for a collection at `sample`.
    pub fn should_collect(&self, strategy: GcStrategy, sample: &MemoryPressureSample) -> bool {
        match strategy {
            GcStrategy::Conservative => sample.level >= PressureLevel::High,
            GcStrategy::Aggressive => sample.level >= PressureLevel::Medium,
            GcStrategy::Adaptive => {
                sample.level >= PressureLevel::High
                    || (sample.level == PressureLevel::Medium
                        && self.trend() >= self.trend_escalation)
            }
        }
    }

    /// Runs every reclaimer for `level` and prunes dead tracking handles.
    pub fn collect(&self, level: PressureLevel) -> CollectionReport {
        let reclaimers = self.reclaimers.read().clone();
        let bytes: u64 = reclaimers.iter().map(|r| r.reclaim(level)).sum();
        let pruned_handles = self.tracker.prune();

        self.gc_runs.fetch_add(1, Ordering::Relaxed);
        self.bytes_collected.fetch_add(bytes, Ordering::Relaxed);
        metrics::counter!("keel_gc_runs_total", "level" => level.to_string()).increment(1);
        info!(%level, bytes, reclaimers = reclaimers.len(), "memory collection ran");

        CollectionReport {
            bytes,
            reclaimers: reclaimers.len(),
            pruned_handles,
        }
    }

    /// Samples, chooses a strategy and collects if it calls for it.
    pub fn govern(&self) -> RuntimeResult<GovernorDecision> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(RuntimeError::ShutDown);
        }
        let sample = self.sample()?;
        let strategy = self.choose_strategy(&sample);
        let collected = self
            .should_collect(strategy, &sample)
            .then(|| self.collect(sample.level));
        Ok(GovernorDecision {
            sample,
            strategy,
            collected,
        })
    }

    /// The registry of tracked objects, for pools to register with.
    pub fn tracker(&self) -> Arc<ObjectTracker> {
        self.tracker.clone()
    }

    /// Counts `object` under `category` without keeping it alive.
    pub fn track_object<T: Any + Send + Sync>(&self, object: &Arc<T>, category: &'static str) {
        self.tracker.track(object, category);
    }

    /// Live tracked objects by category.
    pub fn live_objects(&self) -> HashMap<&'static str, usize> {
        self.tracker.live()
    }

    /// Collection runs so far.
    pub fn gc_runs(&self) -> u64 {
        self.gc_runs.load(Ordering::Relaxed)
    }

    /// Bytes reclaimed so far.
    pub fn bytes_collected(&self) -> u64 {
        self.bytes_collected.load(Ordering::Relaxed)
    }

    /// Stops governing and reports cumulative totals.
    ///
    /// Calling it again returns the same totals.
    pub fn shutdown(&self) -> GovernorReport {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            self.reclaimers.write().clear();
        }
        let report = GovernorReport {
            gc_runs: self.gc_runs(),
            bytes_collected: self.bytes_collected(),
            live_objects: self.live_objects(),
        };
        if report.live_objects.values().any(|n| *n > 0) {
            warn!(live = ?report.live_objects, "tracked objects still alive at shutdown");
        }
        report
    }
}

impl fmt::Debug for MemoryGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryGovernor")
            .field("limit", &self.limit)
            .field("bands", &self.bands)
            .field("last_level", &self.last_level())
            .field("gc_runs", &self.gc_runs())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ManualClock, PerformanceProfile};

    const MB: u64 = 1024 * 1024;

    struct CountingReclaimer {
        calls: AtomicU64,
        frees: u64,
    }

    impl Reclaimer for CountingReclaimer {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn reclaim(&self, _level: PressureLevel) -> u64 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.frees
        }
    }

    fn governor(config: MemoryConfig, profile: PerformanceProfile) -> (MemoryGovernor, Arc<ManualProbe>) {
        let probe = Arc::new(ManualProbe::new(0, 100 * MB));
        let gov = MemoryGovernor::new(
            &config,
            Arc::new(ProfileState::new(profile, true)),
            probe.clone(),
            Arc::new(ManualClock::new(Duration::from_secs(1))),
        )
        .unwrap();
        (gov, probe)
    }

    #[test]
    fn test_bands_bucket_utilisation() {
        let bands = PressureBands::from(&MemoryConfig::default());
        assert_eq!(bands.level(0.10), PressureLevel::Low);
        assert_eq!(bands.level(0.50), PressureLevel::Medium);
        assert_eq!(bands.level(0.80), PressureLevel::High);
        assert_eq!(bands.level(0.95), PressureLevel::Critical);
    }

    #[test]
    fn test_limit_defaults_to_probe_total() {
        let (gov, _) = governor(MemoryConfig::default(), PerformanceProfile::Balanced);
        assert_eq!(gov.limit(), 100 * MB);
    }

    #[test]
    fn test_sample_updates_signal() {
        let (gov, probe) = governor(MemoryConfig::default(), PerformanceProfile::Balanced);
        probe.set(80 * MB);
        let sample = gov.sample().unwrap();
        assert_eq!(sample.level, PressureLevel::High);
        assert_eq!(gov.last_level(), PressureLevel::High);
        assert_eq!(gov.signal().level(), PressureLevel::High);
    }

    #[test]
    fn test_conservative_waits_for_high() {
        let (gov, probe) = governor(MemoryConfig::default(), PerformanceProfile::Balanced);
        probe.set(60 * MB);
        let decision = gov.govern().unwrap();
        assert_eq!(decision.strategy, GcStrategy::Conservative);
        assert!(decision.collected.is_none());

        probe.set(80 * MB);
        assert!(gov.govern().unwrap().collected.is_some());
    }

    #[test]
    fn test_aggressive_collects_at_medium() {
        let (gov, probe) = governor(MemoryConfig::default(), PerformanceProfile::Extreme);
        probe.set(55 * MB);
        let decision = gov.govern().unwrap();
        assert_eq!(decision.strategy, GcStrategy::Aggressive);
        assert!(decision.collected.is_some());
    }

    #[test]
    fn test_adaptive_escalates_on_rising_trend() {
        let (gov, probe) = governor(MemoryConfig::default(), PerformanceProfile::High);

        // Flat at MEDIUM: no collection.
        for _ in 0..4 {
            probe.set(55 * MB);
            assert!(gov.govern().unwrap().collected.is_none());
        }

        let (gov, probe) = governor(MemoryConfig::default(), PerformanceProfile::High);
        // Climbing 10 points per sample while still MEDIUM.
        for used in [30, 40, 50] {
            probe.set(used * MB);
            let decision = gov.govern().unwrap();
            assert_eq!(decision.strategy, GcStrategy::Adaptive);
            if used == 50 {
                assert!(decision.collected.is_some());
            } else {
                assert!(decision.collected.is_none());
            }
        }
    }

    #[test]
    fn test_critical_forces_aggressive() {
        let config = MemoryConfig {
            strategy: Some(GcStrategy::Conservative),
            ..MemoryConfig::default()
        };
        let (gov, probe) = governor(config, PerformanceProfile::Balanced);
        probe.set(99 * MB);
        let decision = gov.govern().unwrap();
        assert_eq!(decision.strategy, GcStrategy::Aggressive);
    }

    #[test]
    fn test_forced_strategy_overrides_profile() {
        let config = MemoryConfig {
            strategy: Some(GcStrategy::Aggressive),
            ..MemoryConfig::default()
        };
        let (gov, probe) = governor(config, PerformanceProfile::Balanced);
        probe.set(55 * MB);
        assert_eq!(gov.govern().unwrap().strategy, GcStrategy::Aggressive);
    }

    #[test]
    fn test_collect_runs_reclaimers_and_accumulates() {
        let (gov, _) = governor(MemoryConfig::default(), PerformanceProfile::Balanced);
        let reclaimer = Arc::new(CountingReclaimer {
            calls: AtomicU64::new(0),
            frees: 512,
        });
        gov.register_reclaimer(reclaimer.clone());

        gov.collect(PressureLevel::High);
        gov.collect(PressureLevel::Critical);

        assert_eq!(reclaimer.calls.load(Ordering::SeqCst), 2);
        let report = gov.shutdown();
        assert_eq!(report.gc_runs, 2);
        assert_eq!(report.bytes_collected, 1024);
    }

    #[test]
    fn test_tracking_never_keeps_objects_alive() {
        let (gov, _) = governor(MemoryConfig::default(), PerformanceProfile::Balanced);
        let buffer = Arc::new(vec![0_u8; 16]);
        let other = Arc::new(String::from("x"));
        gov.track_object(&buffer, "buffer");
        gov.track_object(&other, "string");

        assert_eq!(gov.live_objects().get("buffer"), Some(&1));
        drop(buffer);
        assert_eq!(Arc::strong_count(&other), 1);

        let live = gov.live_objects();
        assert_eq!(live.get("buffer"), None);
        assert_eq!(live.get("string"), Some(&1));
    }

    #[test]
    fn test_tracker_stays_bounded_under_churn() {
        let tracker = ObjectTracker::new();
        let keep = Arc::new(0_u32);
        tracker.track(&keep, "kept");
        for i in 0..10_000_u32 {
            tracker.track(&Arc::new(i), "transient");
        }
        assert!(tracker.handles() <= 4);
        assert_eq!(tracker.live().get("kept"), Some(&1));
        assert_eq!(tracker.live().get("transient"), None);
    }

    #[test]
    fn test_govern_after_shutdown_fails() {
        let (gov, _) = governor(MemoryConfig::default(), PerformanceProfile::Balanced);
        gov.shutdown();
        assert!(matches!(gov.govern(), Err(RuntimeError::ShutDown)));
        assert_eq!(gov.shutdown().gc_runs, 0);
    }
}
