//! Key-value storage for resilience state.
//!
//! Circuit and rate-window records live behind [`StateStore`] so a
//! networked cache and the in-process [`MemoryStore`] are interchangeable.
//! The store owns atomicity: middleware only relies on
//! [`compare_and_swap`](StateStore::compare_and_swap) being atomic per key.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use keel_core::{Clock, SharedClock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::middleware::BoxFuture;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// CAS attempts before an update gives up.
pub const MAX_CAS_ATTEMPTS: usize = 8;

/// Errors raised by state stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("state store backend error: {0}")]
    Backend(String),

    /// A stored record could not be encoded or decoded.
    #[error("state record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Concurrent writers kept winning the compare-and-swap.
    #[error("gave up updating '{key}' after {attempts} attempts")]
    Contention {
        /// The contended key.
        key: String,
        /// Attempts made.
        attempts: usize,
    },
}

/// Shared key-value storage with TTLs and atomic compare-and-swap.
pub trait StateStore: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Reads a live value.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Bytes>>>;

    /// Writes a value, expiring it after `ttl` if given.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, StoreResult<()>>;

    /// Writes `value` only if the live value equals `expected`
    /// (`None` meaning absent). Returns whether the write happened.
    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        expected: Option<Bytes>,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, StoreResult<bool>>;
}

impl dyn StateStore {
    /// Reads and decodes a JSON record.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Reads and decodes a JSON record, or returns `default` if absent.
    pub async fn get_json_or<T: DeserializeOwned>(&self, key: &str, default: T) -> StoreResult<T> {
        Ok(self.get_json(key).await?.unwrap_or(default))
    }

    /// Encodes and writes a JSON record.
    pub async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let raw = Bytes::from(serde_json::to_vec(value)?);
        self.set(key, raw, ttl).await
    }

    /// Read-modify-writes a JSON record with compare-and-swap, retrying on
    /// conflict.
    ///
    /// `update` sees the current record (or `T::default()` if absent) and
    /// may run more than once. An update that leaves the encoded record
    /// unchanged skips the write, and an absent record that stays at its
    /// default is not stored at all.
    pub async fn update_json<T, R, F>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        mut update: F,
    ) -> StoreResult<R>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnMut(&mut T) -> R,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(key).await?;
            let mut record: T = match &current {
                Some(raw) => serde_json::from_slice(raw)?,
                None => T::default(),
            };
            let result = update(&mut record);
            let next = Bytes::from(serde_json::to_vec(&record)?);
            let unchanged = match &current {
                Some(raw) => *raw == next,
                None => next == serde_json::to_vec(&T::default())?,
            };
            if unchanged {
                return Ok(result);
            }
            if self.compare_and_swap(key, current, next, ttl).await? {
                return Ok(result);
            }
        }
        Err(StoreError::Contention {
            key: key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    expires_at: Option<Duration>,
}

impl StoredValue {
    fn live(&self, now: Duration) -> Option<&Bytes> {
        match self.expires_at {
            Some(at) if now >= at => None,
            _ => Some(&self.value),
        }
    }
}

/// In-process store backed by a concurrent map.
///
/// Expiry is read against the given [`Clock`]; expired entries are dropped
/// lazily on access or by [`purge_expired`](Self::purge_expired).
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: SharedClock,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Creates an empty store behind a shared handle.
    #[must_use]
    pub fn shared(clock: SharedClock) -> Arc<dyn StateStore> {
        Arc::new(Self::new(clock))
    }

    /// Number of stored entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops expired entries.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.entries.retain(|_, stored| stored.live(now).is_some());
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<Duration> {
        ttl.map(|ttl| self.clock.now().saturating_add(ttl))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl StateStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Bytes>>> {
        let now = self.clock.now();
        let value = match self.entries.get(key) {
            Some(stored) => stored.live(now).cloned(),
            None => None,
        };
        if value.is_none() {
            self.entries
                .remove_if(key, |_, stored| stored.live(now).is_none());
        }
        Box::pin(async move { Ok(value) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, StoreResult<()>> {
        let stored = StoredValue {
            value,
            expires_at: self.expiry(ttl),
        };
        self.entries.insert(key.to_string(), stored);
        Box::pin(async { Ok(()) })
    }

    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        expected: Option<Bytes>,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        let now = self.clock.now();
        let stored = StoredValue {
            value,
            expires_at: self.expiry(ttl),
        };
        let swapped = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().live(now) == expected.as_ref() {
                    occupied.insert(stored);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(stored);
                    true
                } else {
                    false
                }
            }
        };
        Box::pin(async move { Ok(swapped) })
    }
}

/// A store that keeps nothing.
///
/// Every read misses and every write succeeds, so resilience stages see a
/// fresh record on each request and never trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

impl StateStore for NullStore {
    fn name(&self) -> &'static str {
        "null"
    }

    fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, StoreResult<Option<Bytes>>> {
        Box::pin(async { Ok(None) })
    }

    fn set<'a>(
        &'a self,
        _key: &'a str,
        _value: Bytes,
        _ttl: Option<Duration>,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn compare_and_swap<'a>(
        &'a self,
        _key: &'a str,
        _expected: Option<Bytes>,
        _value: Bytes,
        _ttl: Option<Duration>,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async { Ok(true) })
    }
}
