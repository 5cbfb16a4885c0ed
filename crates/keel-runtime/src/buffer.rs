//! Pooled buffers for serialized output.
//!
//! Payloads below the configured threshold skip the pool: allocating and
//! dropping a tiny buffer is cheaper than the checkout bookkeeping. Larger
//! payloads borrow a [`BytesMut`] from a [`PoolManager`] sized by capacity
//! class. Under CRITICAL memory pressure, large-class requests also fall
//! back to direct allocation so the pool stops growing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use http::StatusCode;
use keel_config::PoolConfig;
use keel_core::{json_response, KeelError, PressureLevel, Response};
use serde::Serialize;
use tracing::warn;

use crate::error::RuntimeResult;
use crate::governor::{ObjectTracker, PressureSignal, Reclaimer};
use crate::pool::{
    CapacityClass, ClassBounds, PoolEntry, PoolManager, PoolManagerStats, ReleaseOutcome,
};
use crate::profile::ProfileState;

/// Tracker category of large pooled buffers that are checked out.
pub const LARGE_BUFFER_CATEGORY: &str = "large_buffer";

/// A buffer handed out by [`BufferPool::acquire_for`].
#[derive(Debug)]
pub enum BufferLease {
    /// Checked out of the pool; must go back through [`BufferPool::release`].
    Pooled(PoolEntry<BytesMut>),
    /// Allocated for this use only.
    Direct(BytesMut),
}

impl BufferLease {
    /// Returns `true` for pooled leases.
    pub const fn is_pooled(&self) -> bool {
        matches!(self, Self::Pooled(_))
    }

    /// The underlying buffer.
    pub fn buf(&self) -> &BytesMut {
        match self {
            Self::Pooled(entry) => entry,
            Self::Direct(buf) => buf,
        }
    }

    /// The underlying buffer, mutably.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        match self {
            Self::Pooled(entry) => entry,
            Self::Direct(buf) => buf,
        }
    }
}

/// Buffer pool for serialization output.
#[derive(Debug)]
pub struct BufferPool {
    pools: PoolManager<BytesMut>,
    threshold: usize,
    pressure: Arc<PressureSignal>,
    last_json_len: AtomicUsize,
}

impl BufferPool {
    /// Creates a buffer pool from pool configuration.
    pub fn new(config: &PoolConfig, profile: Arc<ProfileState>, pressure: Arc<PressureSignal>) -> Self {
        let bounds = ClassBounds::from(config);
        let pools = PoolManager::new(bounds, config.idle_floor, profile, move |class| {
            BytesMut::with_capacity(bounds.nominal_capacity(class))
        });
        Self {
            pools,
            threshold: config.serialize_threshold_bytes,
            pressure,
            last_json_len: AtomicUsize::new(0),
        }
    }

    /// Registers large pooled checkouts with `tracker` under
    /// [`LARGE_BUFFER_CATEGORY`].
    pub fn with_tracker(mut self, tracker: Arc<ObjectTracker>) -> Self {
        self.pools = self.pools.with_tracker(tracker, LARGE_BUFFER_CATEGORY);
        self
    }

    /// Payload size below which buffers are allocated directly.
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    /// The underlying per-class pools.
    pub const fn manager(&self) -> &PoolManager<BytesMut> {
        &self.pools
    }

    /// Per-class statistics.
    pub fn stats(&self) -> PoolManagerStats {
        self.pools.stats()
    }

    /// Leases a buffer able to hold `len` bytes.
    pub fn acquire_for(&self, len: usize) -> BufferLease {
        if len < self.threshold {
            return BufferLease::Direct(BytesMut::with_capacity(len));
        }

        let class = self.pools.bounds().classify(len);
        if class == CapacityClass::Large && self.pressure.level() == PressureLevel::Critical {
            return BufferLease::Direct(BytesMut::with_capacity(len));
        }

        let mut entry = self.pools.acquire(class);
        entry.reserve(len);
        BufferLease::Pooled(entry)
    }

    /// Returns a lease. Direct leases are dropped.
    pub fn release(&self, lease: BufferLease) -> Option<ReleaseOutcome> {
        match lease {
            BufferLease::Pooled(entry) => Some(self.pools.release(entry)),
            BufferLease::Direct(_) => None,
        }
    }

    /// Runs `f` with a leased buffer and releases it afterwards, whatever
    /// `f` returns.
    pub fn with_buffer<R>(&self, len: usize, f: impl FnOnce(&mut BytesMut) -> R) -> R {
        let mut lease = self.acquire_for(len);
        let out = f(lease.buf_mut());
        self.release(lease);
        out
    }

    /// Serializes `value` as JSON, sizing the buffer by `size_hint`.
    ///
    /// The buffer goes back to the pool on success and on failure.
    pub fn serialize_json_sized<T: Serialize + ?Sized>(
        &self,
        value: &T,
        size_hint: usize,
    ) -> RuntimeResult<Bytes> {
        let mut lease = self.acquire_for(size_hint);
        let result = serde_json::to_writer(lease.buf_mut().writer(), value);

        let bytes = match (&result, &mut lease) {
            (Err(_), _) => Bytes::new(),
            (Ok(()), BufferLease::Pooled(entry)) => Bytes::copy_from_slice(&entry[..]),
            (Ok(()), BufferLease::Direct(buf)) => std::mem::take(buf).freeze(),
        };
        self.release(lease);

        result?;
        self.last_json_len.store(bytes.len(), Ordering::Relaxed);
        Ok(bytes)
    }

    /// Serializes `value` as JSON, sizing the buffer by the previous
    /// payload.
    pub fn serialize_json<T: Serialize + ?Sized>(&self, value: &T) -> RuntimeResult<Bytes> {
        self.serialize_json_sized(value, self.last_json_len.load(Ordering::Relaxed))
    }

    /// Builds a JSON response for `value`.
    ///
    /// A serialization failure yields a 500 error envelope instead.
    pub fn json_response<T: Serialize + ?Sized>(&self, status: StatusCode, value: &T) -> Response {
        match self.serialize_json(value) {
            Ok(body) => json_response(status, body),
            Err(e) => {
                warn!(error = %e, "response serialization failed");
                KeelError::serialization("Failed to serialize response", e).into_response(None)
            }
        }
    }
}

impl Reclaimer for BufferPool {
    fn name(&self) -> &'static str {
        "buffer_pool"
    }

    fn reclaim(&self, level: PressureLevel) -> u64 {
        self.pools.reclaim(level)
    }
}
