//! Performance profile state.
//!
//! The active [`PerformanceProfile`] is process-wide, but it is never a
//! language-level static: one [`ProfileState`] is created by the runtime and
//! shared by handle with every component that reads it. Reads and switches
//! are single atomic operations, so a switch can happen while requests are
//! in flight; each request snapshots the profile when it starts.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use keel_core::{GcStrategy, PerformanceProfile};
use tracing::info;

use crate::pool::CapacityClass;

/// Aggressiveness knobs selected by a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileKnobs {
    /// Maximum idle entries kept per capacity class (small, medium, large).
    pub idle_ceiling: [usize; 3],
    /// Default collection strategy when none is forced by configuration.
    pub gc_strategy: GcStrategy,
}

impl ProfileKnobs {
    /// Returns the knobs for `profile`.
    #[must_use]
    pub const fn for_profile(profile: PerformanceProfile) -> Self {
        match profile {
            PerformanceProfile::Balanced => Self {
                idle_ceiling: [32, 8, 2],
                gc_strategy: GcStrategy::Conservative,
            },
            PerformanceProfile::High => Self {
                idle_ceiling: [128, 32, 8],
                gc_strategy: GcStrategy::Adaptive,
            },
            PerformanceProfile::Extreme => Self {
                idle_ceiling: [512, 128, 32],
                gc_strategy: GcStrategy::Aggressive,
            },
        }
    }

    /// Idle ceiling for one capacity class.
    #[must_use]
    pub const fn ceiling(&self, class: CapacityClass) -> usize {
        self.idle_ceiling[class.index()]
    }
}

/// Shared, lock-free profile state.
#[derive(Debug)]
pub struct ProfileState {
    current: AtomicU8,
    enabled: AtomicBool,
    pinned: AtomicBool,
    switches: AtomicU64,
}

impl ProfileState {
    /// Creates the state with `initial` active.
    #[must_use]
    pub fn new(initial: PerformanceProfile, enabled: bool) -> Self {
        Self {
            current: AtomicU8::new(initial.as_u8()),
            enabled: AtomicBool::new(enabled),
            pinned: AtomicBool::new(false),
            switches: AtomicU64::new(0),
        }
    }

    /// Returns the effective profile. A disabled state reads as `Balanced`.
    pub fn current(&self) -> PerformanceProfile {
        if self.enabled.load(Ordering::Acquire) {
            self.selected()
        } else {
            PerformanceProfile::Balanced
        }
    }

    /// Returns the selected profile, ignoring the enabled flag.
    pub fn selected(&self) -> PerformanceProfile {
        PerformanceProfile::from_u8(self.current.load(Ordering::Acquire))
    }

    /// Returns the knobs of the effective profile.
    pub fn knobs(&self) -> ProfileKnobs {
        ProfileKnobs::for_profile(self.current())
    }

    /// Turns profile-driven tuning on.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Turns profile-driven tuning off; components fall back to `Balanced`.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Returns `true` while profile-driven tuning is on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Returns `true` while an explicit override is in force.
    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    /// Number of profile changes since creation.
    pub fn switch_count(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Switches on behalf of the governor. Ignored while pinned.
    ///
    /// Returns `true` if the profile changed.
    pub fn switch_to(&self, profile: PerformanceProfile, reason: &str) -> bool {
        if self.is_pinned() {
            return false;
        }
        self.store(profile, reason)
    }

    /// Sets the profile explicitly and pins it against automatic switching.
    pub fn set_override(&self, profile: PerformanceProfile) -> bool {
        self.pinned.store(true, Ordering::Release);
        self.store(profile, "override")
    }

    /// Releases an explicit override.
    pub fn clear_override(&self) {
        self.pinned.store(false, Ordering::Release);
    }

    fn store(&self, profile: PerformanceProfile, reason: &str) -> bool {
        let previous = PerformanceProfile::from_u8(self.current.swap(profile.as_u8(), Ordering::AcqRel));
        if previous == profile {
            return false;
        }
        self.switches.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "keel_profile_switches_total",
            "to" => profile.as_str(),
            "reason" => reason.to_string()
        )
        .increment(1);
        info!(from = %previous, to = %profile, reason, "performance profile switched");
        true
    }
}

impl Default for ProfileState {
    fn default() -> Self {
        Self::new(PerformanceProfile::Balanced, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_knobs_grow_with_aggressiveness() {
        let balanced = ProfileKnobs::for_profile(PerformanceProfile::Balanced);
        let extreme = ProfileKnobs::for_profile(PerformanceProfile::Extreme);
        for class in CapacityClass::ALL {
            assert!(extreme.ceiling(class) > balanced.ceiling(class));
        }
        assert_eq!(balanced.gc_strategy, GcStrategy::Conservative);
        assert_eq!(
            ProfileKnobs::for_profile(PerformanceProfile::High).gc_strategy,
            GcStrategy::Adaptive
        );
    }

    #[test]
    fn test_switch_counts_only_changes() {
        let state = ProfileState::default();
        assert!(state.switch_to(PerformanceProfile::High, "load"));
        assert!(!state.switch_to(PerformanceProfile::High, "load"));
        assert_eq!(state.switch_count(), 1);
        assert_eq!(state.current(), PerformanceProfile::High);
    }

    #[test]
    fn test_override_pins_until_cleared() {
        let state = ProfileState::default();
        state.set_override(PerformanceProfile::Extreme);
        assert!(!state.switch_to(PerformanceProfile::Balanced, "pressure"));
        assert_eq!(state.current(), PerformanceProfile::Extreme);

        state.clear_override();
        assert!(state.switch_to(PerformanceProfile::Balanced, "pressure"));
    }

    #[test]
    fn test_disabled_reads_as_balanced() {
        let state = ProfileState::new(PerformanceProfile::Extreme, false);
        assert_eq!(state.current(), PerformanceProfile::Balanced);
        assert_eq!(state.selected(), PerformanceProfile::Extreme);

        state.enable();
        assert_eq!(state.current(), PerformanceProfile::Extreme);
    }
}
