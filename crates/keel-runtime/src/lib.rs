//! # Keel Runtime
//!
//! Resource management for the Keel request-processing engine.
//!
//! The [`Runtime`] is an explicitly constructed handle with a documented
//! lifecycle: create it once with [`Runtime::start`] at application start,
//! pass it (or its parts) to every component that needs it, and call
//! [`Runtime::shutdown`] when the process is done. It owns:
//!
//! - [`ProfileState`] - the active performance profile
//! - [`BufferPool`] - pooled buffers for serialized output
//! - [`MemoryGovernor`] - pressure sampling, strategy selection and reclamation
//!
//! Generic pools for other value types are built with [`ObjectPool`] and
//! [`PoolManager`] and can be registered with the governor as
//! [`Reclaimer`]s.

#![doc(html_root_url = "https://docs.rs/keel-runtime/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod buffer;
mod error;
pub mod governor;
pub mod pool;
pub mod profile;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keel_config::KeelConfig;
use keel_core::{SharedClock, SystemClock};
use serde::Serialize;
use tracing::info;

pub use buffer::{BufferLease, BufferPool, LARGE_BUFFER_CATEGORY};
pub use error::{RuntimeError, RuntimeResult};
pub use governor::{
    CollectionReport, GovernorDecision, GovernorReport, ManualProbe, MemoryGovernor, MemoryPressureSample,
    MemoryProbe, ObjectTracker, PressureBands, PressureSignal, Reclaimer, SysinfoProbe,
};
pub use pool::{
    CapacityClass, ClassBounds, ObjectPool, PoolEntry, PoolManager, PoolManagerStats, PoolStats, Poolable,
    ReleaseOutcome, ShrinkReport,
};
pub use profile::{ProfileKnobs, ProfileState};

/// Diagnostics returned by [`Runtime::shutdown`].
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Collection runs over the runtime's life.
    pub gc_runs: u64,
    /// Bytes reclaimed over the runtime's life.
    pub bytes_collected: u64,
    /// Buffer pool statistics at shutdown.
    pub buffer_pool: PoolManagerStats,
    /// Profile switches over the runtime's life.
    pub profile_switches: u64,
    /// Tracked objects still alive, by category.
    pub live_objects: HashMap<&'static str, usize>,
}

/// The resource runtime handle.
#[derive(Debug)]
pub struct Runtime {
    clock: SharedClock,
    profile: Arc<ProfileState>,
    buffers: Arc<BufferPool>,
    governor: Arc<MemoryGovernor>,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Starts a runtime that probes this process with `sysinfo` and reads
    /// the wall clock.
    pub fn start(config: &KeelConfig) -> RuntimeResult<Arc<Self>> {
        let probe = Arc::new(SysinfoProbe::new()?);
        Self::with_parts(config, probe, SystemClock::shared())
    }

    /// Starts a runtime with an explicit probe and clock.
    pub fn with_parts(
        config: &KeelConfig,
        probe: Arc<dyn MemoryProbe>,
        clock: SharedClock,
    ) -> RuntimeResult<Arc<Self>> {
        let profile = Arc::new(ProfileState::new(
            config.profile.initial,
            config.profile.enabled,
        ));
        let governor = Arc::new(MemoryGovernor::new(
            &config.memory,
            profile.clone(),
            probe,
            clock.clone(),
        )?);
        let buffers = Arc::new(
            BufferPool::new(&config.pool, profile.clone(), governor.signal())
                .with_tracker(governor.tracker()),
        );
        governor.register_reclaimer(buffers.clone());

        info!(
            profile = %profile.current(),
            memory_limit = governor.limit(),
            serialize_threshold = buffers.threshold(),
            "keel runtime started"
        );

        Ok(Arc::new(Self {
            clock,
            profile,
            buffers,
            governor,
            shut_down: AtomicBool::new(false),
        }))
    }

    /// The clock shared by every component.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// The profile state.
    pub fn profile(&self) -> &Arc<ProfileState> {
        &self.profile
    }

    /// The serialization buffer pool.
    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// The memory governor.
    pub fn governor(&self) -> &Arc<MemoryGovernor> {
        &self.governor
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stops the governor and reports lifetime diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ShutDown`] if called twice.
    pub fn shutdown(&self) -> RuntimeResult<ShutdownReport> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::ShutDown);
        }
        let governor = self.governor.shutdown();
        let report = ShutdownReport {
            gc_runs: governor.gc_runs,
            bytes_collected: governor.bytes_collected,
            buffer_pool: self.buffers.stats(),
            profile_switches: self.profile.switch_count(),
            live_objects: governor.live_objects,
        };
        info!(
            gc_runs = report.gc_runs,
            bytes_collected = report.bytes_collected,
            "keel runtime shut down"
        );
        Ok(report)
    }
}
