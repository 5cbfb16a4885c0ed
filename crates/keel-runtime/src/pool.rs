//! Generic object pools partitioned by capacity class.
//!
//! An [`ObjectPool`] owns its idle entries; a borrower owns a checked-out
//! [`PoolEntry`] until it hands it back with [`ObjectPool::release`]. The
//! pool tracks every outstanding checkout by id, so a foreign entry, or one
//! that was never released, cannot skew its accounting: the former is
//! rejected on release and the latter shows up in `active_count`.
//!
//! [`PoolManager`] keeps one pool per [`CapacityClass`] so that a burst of
//! large borrows never evicts the many small entries hot paths reuse. Given
//! an [`ObjectTracker`], it registers every large-class checkout there until
//! the entry is released or dropped.

use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use keel_config::PoolConfig;
use keel_core::PressureLevel;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::governor::{ObjectTracker, Reclaimer};
use crate::profile::ProfileState;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Values that can be pooled.
pub trait Poolable: Send + 'static {
    /// Returns the value to its quiescent state before it is reused.
    fn reset(&mut self);

    /// Approximate heap bytes held by the value.
    fn footprint(&self) -> usize;
}

impl Poolable for BytesMut {
    fn reset(&mut self) {
        self.clear();
    }

    fn footprint(&self) -> usize {
        self.capacity()
    }
}

impl Poolable for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
    }

    fn footprint(&self) -> usize {
        self.capacity()
    }
}

impl Poolable for String {
    fn reset(&mut self) {
        self.clear();
    }

    fn footprint(&self) -> usize {
        self.capacity()
    }
}

/// Size bucket a pooled value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityClass {
    /// Up to `small_max_bytes`.
    Small,
    /// Up to `medium_max_bytes`.
    Medium,
    /// Anything larger.
    Large,
}

impl CapacityClass {
    /// All classes, smallest first.
    pub const ALL: [Self; 3] = [Self::Small, Self::Medium, Self::Large];

    /// Position of the class in [`ALL`](Self::ALL).
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Small => 0,
            Self::Medium => 1,
            Self::Large => 2,
        }
    }

    /// Lowercase name used in metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl fmt::Display for CapacityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class boundaries in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassBounds {
    /// Largest size in the small class.
    pub small_max: usize,
    /// Largest size in the medium class.
    pub medium_max: usize,
}

impl ClassBounds {
    /// Returns the class a request for `bytes` falls into.
    #[must_use]
    pub const fn classify(&self, bytes: usize) -> CapacityClass {
        if bytes <= self.small_max {
            CapacityClass::Small
        } else if bytes <= self.medium_max {
            CapacityClass::Medium
        } else {
            CapacityClass::Large
        }
    }

    /// Capacity a freshly built buffer of `class` starts with.
    #[must_use]
    pub const fn nominal_capacity(&self, class: CapacityClass) -> usize {
        match class {
            CapacityClass::Small => self.small_max,
            CapacityClass::Medium => self.medium_max,
            CapacityClass::Large => self.medium_max.saturating_mul(4),
        }
    }
}

impl Default for ClassBounds {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for ClassBounds {
    fn from(config: &PoolConfig) -> Self {
        Self {
            small_max: config.small_max_bytes,
            medium_max: config.medium_max_bytes,
        }
    }
}

/// A value checked out of an [`ObjectPool`].
///
/// Dereferences to the pooled value. Hand it back with
/// [`ObjectPool::release`], which consumes it, so an entry cannot be
/// released twice. Dropping it instead leaves the checkout counted in
/// `active_count`.
pub struct PoolEntry<T> {
    pool_id: u64,
    id: u64,
    class: CapacityClass,
    value: T,
    marker: Option<Arc<TrackedCheckout>>,
}

/// Liveness marker of a checkout registered with an [`ObjectTracker`].
struct TrackedCheckout;

impl<T> PoolEntry<T> {
    /// Checkout id, unique within the issuing pool.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Capacity class of the issuing pool.
    pub const fn class(&self) -> CapacityClass {
        self.class
    }

    /// Returns `true` if the checkout is registered with a tracker.
    pub const fn is_tracked(&self) -> bool {
        self.marker.is_some()
    }
}

impl<T> Deref for PoolEntry<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for PoolEntry<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> fmt::Debug for PoolEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("class", &self.class)
            .finish_non_exhaustive()
    }
}

/// What happened to a released entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Reset and returned to the idle set.
    Pooled,
    /// Reset and dropped because the idle set was at its ceiling.
    Discarded,
    /// Not a checkout of this pool; dropped without touching accounting.
    Rejected,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// Acquisitions served from the idle set.
    pub hits: u64,
    /// Acquisitions that built a new value.
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0 before the first acquisition.
    pub reuse_rate: f64,
    /// Entries currently checked out.
    pub active_count: usize,
    /// Entries currently idle.
    pub idle_count: usize,
    /// Entries dropped on release or by shrinking.
    pub discarded: u64,
    /// Releases refused because the entry was not outstanding.
    pub rejected: u64,
}

impl PoolStats {
    fn merge(self, other: Self) -> Self {
        let hits = self.hits + other.hits;
        let misses = self.misses + other.misses;
        Self {
            hits,
            misses,
            reuse_rate: reuse_rate(hits, misses),
            active_count: self.active_count + other.active_count,
            idle_count: self.idle_count + other.idle_count,
            discarded: self.discarded + other.discarded,
            rejected: self.rejected + other.rejected,
        }
    }
}

fn reuse_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Entries and bytes freed by a shrink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShrinkReport {
    /// Idle entries dropped.
    pub entries: usize,
    /// Sum of their footprints.
    pub bytes: u64,
}

struct PoolInner<T> {
    idle: Vec<T>,
    outstanding: HashSet<u64>,
}

/// A pool of reusable values of one capacity class.
pub struct ObjectPool<T: Poolable> {
    pool_id: u64,
    class: CapacityClass,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    profile: Arc<ProfileState>,
    inner: Mutex<PoolInner<T>>,
    next_id: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    discarded: AtomicU64,
    rejected: AtomicU64,
}

impl<T: Poolable> ObjectPool<T> {
    /// Creates an empty pool. Entries are built lazily by `factory`.
    pub fn new<F>(class: CapacityClass, profile: Arc<ProfileState>, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            class,
            factory: Box::new(factory),
            profile,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                outstanding: HashSet::new(),
            }),
            next_id: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Capacity class served by this pool.
    pub const fn class(&self) -> CapacityClass {
        self.class
    }

    /// Checks out an idle entry, building one if the idle set is empty.
    pub fn acquire(&self) -> PoolEntry<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reused = {
            let mut inner = self.inner.lock();
            inner.outstanding.insert(id);
            inner.idle.pop()
        };

        let value = if let Some(value) = reused {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("keel_pool_hits_total", "class" => self.class.as_str()).increment(1);
            value
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("keel_pool_misses_total", "class" => self.class.as_str())
                .increment(1);
            (self.factory)()
        };

        PoolEntry {
            pool_id: self.pool_id,
            id,
            class: self.class,
            value,
            marker: None,
        }
    }

    /// Returns an entry to the pool.
    ///
    /// The value is reset first, so nothing a borrower wrote is visible to
    /// the next one. The idle ceiling comes from the profile active at
    /// release time.
    pub fn release(&self, entry: PoolEntry<T>) -> ReleaseOutcome {
        let PoolEntry {
            pool_id, id, mut value, ..
        } = entry;

        if pool_id != self.pool_id {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(class = %self.class, entry_id = id, "released entry belongs to another pool");
            return ReleaseOutcome::Rejected;
        }

        value.reset();
        let ceiling = self.profile.knobs().ceiling(self.class);

        let mut inner = self.inner.lock();
        if !inner.outstanding.remove(&id) {
            drop(inner);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(class = %self.class, entry_id = id, "released entry was not checked out");
            return ReleaseOutcome::Rejected;
        }
        if inner.idle.len() >= ceiling {
            drop(inner);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return ReleaseOutcome::Discarded;
        }
        inner.idle.push(value);
        ReleaseOutcome::Pooled
    }

    /// Drops idle entries until at most `floor` remain.
    pub fn shrink_to(&self, floor: usize) -> ShrinkReport {
        let dropped: Vec<T> = {
            let mut inner = self.inner.lock();
            if inner.idle.len() <= floor {
                return ShrinkReport::default();
            }
            inner.idle.drain(floor..).collect()
        };

        let bytes = dropped.iter().map(|v| v.footprint() as u64).sum();
        let entries = dropped.len();
        self.discarded.fetch_add(entries as u64, Ordering::Relaxed);
        debug!(class = %self.class, entries, bytes, floor, "pool shrunk");
        ShrinkReport { entries, bytes }
    }

    /// Returns current statistics.
    pub fn stats(&self) -> PoolStats {
        let (active_count, idle_count) = {
            let inner = self.inner.lock();
            (inner.outstanding.len(), inner.idle.len())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        PoolStats {
            hits,
            misses,
            reuse_rate: reuse_rate(hits, misses),
            active_count,
            idle_count,
            discarded: self.discarded.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl<T: Poolable> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("class", &self.class)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Statistics for every class of a [`PoolManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolManagerStats {
    /// Small class.
    pub small: PoolStats,
    /// Medium class.
    pub medium: PoolStats,
    /// Large class.
    pub large: PoolStats,
}

impl PoolManagerStats {
    /// All classes combined.
    pub fn total(&self) -> PoolStats {
        self.small.merge(self.medium).merge(self.large)
    }
}

/// One [`ObjectPool`] per capacity class.
pub struct PoolManager<T: Poolable> {
    pools: [ObjectPool<T>; 3],
    bounds: ClassBounds,
    idle_floor: usize,
    tracker: Option<(Arc<ObjectTracker>, &'static str)>,
}

impl<T: Poolable> PoolManager<T> {
    /// Creates a manager whose pools build values with `factory(class)`.
    pub fn new<F>(bounds: ClassBounds, idle_floor: usize, profile: Arc<ProfileState>, factory: F) -> Self
    where
        F: Fn(CapacityClass) -> T + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let pools = CapacityClass::ALL.map(|class| {
            let factory = factory.clone();
            ObjectPool::new(class, profile.clone(), move || factory(class))
        });
        Self {
            pools,
            bounds,
            idle_floor,
            tracker: None,
        }
    }

    /// Registers large-class checkouts with `tracker` under `category`.
    pub fn with_tracker(mut self, tracker: Arc<ObjectTracker>, category: &'static str) -> Self {
        self.tracker = Some((tracker, category));
        self
    }

    /// Class boundaries used by [`acquire_for`](Self::acquire_for).
    pub const fn bounds(&self) -> ClassBounds {
        self.bounds
    }

    /// Returns the pool for `class`.
    pub fn pool(&self, class: CapacityClass) -> &ObjectPool<T> {
        &self.pools[class.index()]
    }

    /// Checks out an entry of `class`.
    pub fn acquire(&self, class: CapacityClass) -> PoolEntry<T> {
        let mut entry = self.pool(class).acquire();
        if let (CapacityClass::Large, Some((tracker, category))) = (class, &self.tracker) {
            let marker = Arc::new(TrackedCheckout);
            tracker.track(&marker, category);
            entry.marker = Some(marker);
        }
        entry
    }

    /// Checks out an entry sized for `bytes`.
    pub fn acquire_for(&self, bytes: usize) -> PoolEntry<T> {
        self.acquire(self.bounds.classify(bytes))
    }

    /// Returns an entry to the pool it came from.
    pub fn release(&self, entry: PoolEntry<T>) -> ReleaseOutcome {
        let class = entry.class();
        self.pool(class).release(entry)
    }

    /// Shrinks every class to `floor` idle entries.
    pub fn shrink_all(&self, floor: usize) -> ShrinkReport {
        self.pools.iter().fold(ShrinkReport::default(), |acc, pool| {
            let report = pool.shrink_to(floor);
            ShrinkReport {
                entries: acc.entries + report.entries,
                bytes: acc.bytes + report.bytes,
            }
        })
    }

    /// Returns per-class statistics.
    pub fn stats(&self) -> PoolManagerStats {
        PoolManagerStats {
            small: self.pools[0].stats(),
            medium: self.pools[1].stats(),
            large: self.pools[2].stats(),
        }
    }
}

impl<T: Poolable> Reclaimer for PoolManager<T> {
    fn name(&self) -> &'static str {
        "pool"
    }

    fn reclaim(&self, level: PressureLevel) -> u64 {
        match level {
            PressureLevel::Low => 0,
            PressureLevel::Critical => self.shrink_all(self.idle_floor).bytes,
            PressureLevel::Medium | PressureLevel::High => self
                .pools
                .iter()
                .map(|pool| {
                    let idle = pool.stats().idle_count;
                    let keep = if level == PressureLevel::High {
                        idle / 2
                    } else {
                        idle * 3 / 4
                    };
                    pool.shrink_to(keep.max(self.idle_floor)).bytes
                })
                .sum(),
        }
    }
}

impl<T: Poolable> fmt::Debug for PoolManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("bounds", &self.bounds)
            .field("idle_floor", &self.idle_floor)
            .field("tracked", &self.tracker.as_ref().map(|(_, category)| *category))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileKnobs;
    use keel_core::PerformanceProfile;
    use proptest::prelude::*;

    fn vec_pool() -> ObjectPool<Vec<u8>> {
        ObjectPool::new(
            CapacityClass::Small,
            Arc::new(ProfileState::default()),
            || Vec::with_capacity(64),
        )
    }

    #[test]
    fn test_second_acquire_reuses_released_entry() {
        let pool = vec_pool();
        let entry = pool.acquire();
        assert_eq!(pool.release(entry), ReleaseOutcome::Pooled);

        let _again = pool.acquire();
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.active_count, 1);
    }

    #[test]
    fn test_release_resets_contents() {
        let pool = vec_pool();
        let mut entry = pool.acquire();
        entry.extend_from_slice(b"secret");
        pool.release(entry);

        let entry = pool.acquire();
        assert!(entry.is_empty());
    }

    #[test]
    fn test_foreign_entry_rejected() {
        let a = vec_pool();
        let b = vec_pool();
        let entry = a.acquire();

        assert_eq!(b.release(entry), ReleaseOutcome::Rejected);
        assert_eq!(a.stats().active_count, 1);
        assert_eq!(b.stats().active_count, 0);
        assert_eq!(b.stats().idle_count, 0);
        assert_eq!(b.stats().rejected, 1);
    }

    #[test]
    fn test_unreleased_entry_counts_as_active() {
        let pool = vec_pool();
        let leaked = pool.acquire();
        drop(leaked);
        assert_eq!(pool.stats().active_count, 1);
    }

    #[test]
    fn test_idle_ceiling_follows_profile() {
        let profile = Arc::new(ProfileState::default());
        let pool = ObjectPool::new(CapacityClass::Large, profile.clone(), Vec::<u8>::new);
        let ceiling = ProfileKnobs::for_profile(PerformanceProfile::Balanced).ceiling(CapacityClass::Large);

        let entries: Vec<_> = (0..ceiling + 1).map(|_| pool.acquire()).collect();
        let outcomes: Vec<_> = entries.into_iter().map(|e| pool.release(e)).collect();

        assert_eq!(outcomes.last(), Some(&ReleaseOutcome::Discarded));
        assert_eq!(pool.stats().idle_count, ceiling);

        profile.switch_to(PerformanceProfile::Extreme, "test");
        let entries: Vec<_> = (0..ceiling * 2).map(|_| pool.acquire()).collect();
        for entry in entries {
            assert_eq!(pool.release(entry), ReleaseOutcome::Pooled);
        }
        assert_eq!(pool.stats().idle_count, ceiling * 2);
    }

    #[test]
    fn test_shrink_reports_bytes() {
        let pool = vec_pool();
        let entries: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        for e in entries {
            pool.release(e);
        }

        let report = pool.shrink_to(2);
        assert_eq!(report.entries, 3);
        assert_eq!(report.bytes, 3 * 64);
        assert_eq!(pool.stats().idle_count, 2);
        assert_eq!(pool.shrink_to(2), ShrinkReport::default());
    }

    #[test]
    fn test_manager_classifies_by_size() {
        let manager = PoolManager::new(
            ClassBounds::default(),
            1,
            Arc::new(ProfileState::default()),
            |_| BytesMut::new(),
        );
        assert_eq!(manager.acquire_for(100).class(), CapacityClass::Small);
        assert_eq!(manager.acquire_for(10 * 1024).class(), CapacityClass::Medium);
        assert_eq!(manager.acquire_for(1 << 20).class(), CapacityClass::Large);
        assert_eq!(manager.stats().total().active_count, 3);
    }

    #[test]
    fn test_manager_tracks_large_checkouts_until_returned() {
        let tracker = Arc::new(ObjectTracker::new());
        let manager = PoolManager::new(
            ClassBounds::default(),
            1,
            Arc::new(ProfileState::default()),
            |_| BytesMut::new(),
        )
        .with_tracker(tracker.clone(), "large_buffers");

        let small = manager.acquire_for(100);
        let large = manager.acquire_for(1 << 20);
        let leaked = manager.acquire_for(1 << 20);
        assert!(!small.is_tracked());
        assert!(large.is_tracked());
        assert_eq!(tracker.live().get("large_buffers"), Some(&2));

        manager.release(large);
        drop(leaked);
        manager.release(small);
        assert!(tracker.live().is_empty());
        assert_eq!(manager.stats().large.active_count, 1);
    }

    #[test]
    fn test_manager_reclaims_to_floor_under_critical_pressure() {
        let manager = PoolManager::new(
            ClassBounds::default(),
            1,
            Arc::new(ProfileState::default()),
            |_| Vec::<u8>::with_capacity(10),
        );
        let entries: Vec<_> = (0..6).map(|_| manager.acquire(CapacityClass::Small)).collect();
        for e in entries {
            manager.release(e);
        }

        assert_eq!(manager.reclaim(PressureLevel::Low), 0);
        assert_eq!(manager.reclaim(PressureLevel::Medium), 20);
        assert_eq!(manager.reclaim(PressureLevel::High), 20);
        assert_eq!(manager.pool(CapacityClass::Small).stats().idle_count, 2);
        assert_eq!(manager.reclaim(PressureLevel::Critical), 10);
        assert_eq!(manager.pool(CapacityClass::Small).stats().idle_count, 1);
    }

    proptest! {
        #[test]
        fn prop_balanced_pairs_leave_no_active_entries(batches in proptest::collection::vec(1usize..8, 1..40)) {
            let pool = vec_pool();
            let mut previous_rate = 0.0;
            for batch in &batches {
                let idle_before = pool.stats().idle_count;
                let entries: Vec<_> = (0..*batch).map(|_| pool.acquire()).collect();
                for entry in entries {
                    pool.release(entry);
                }
                let stats = pool.stats();
                prop_assert_eq!(stats.active_count, 0);
                // Once the idle set covers the batch, every acquire hits.
                if *batch <= idle_before {
                    prop_assert!(stats.reuse_rate >= previous_rate);
                }
                previous_rate = stats.reuse_rate;
            }
        }
    }
}
