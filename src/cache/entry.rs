use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared};

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::subscriber::{Listener, Listeners};

/// Lifecycle status of a cached query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// Never fetched.
    Idle,
    /// A fetch is in flight. Any previous value is still available.
    Loading,
    /// The last fetch succeeded.
    Success,
    /// The last fetch failed. Any previous value is still available.
    Error,
}

/// A snapshot of one cached query.
pub struct QueryEntry<V> {
    /// The key this entry is cached under.
    pub key: QueryKey,
    /// Current status.
    pub status: QueryStatus,
    /// Last known good value, if any.
    pub value: Option<Arc<V>>,
    /// Error from the last failed fetch.
    pub error: Option<QueryError>,
    /// Generation of the most recent fetch start or cancellation.
    pub fetch_generation: u64,
    /// Whether the value is known to be outdated.
    pub is_stale: bool,
    /// When the value was last written.
    pub updated_at: Option<Instant>,
}

impl<V> QueryEntry<V> {
    pub(crate) const fn idle(key: QueryKey) -> Self {
        Self {
            key,
            status: QueryStatus::Idle,
            value: None,
            error: None,
            fetch_generation: 0,
            is_stale: false,
            updated_at: None,
        }
    }

    /// Returns the value if one is cached, otherwise `None`.
    pub fn data(&self) -> Option<&V> {
        self.value.as_deref()
    }

    /// Returns `true` if the query has never been fetched.
    pub const fn is_idle(&self) -> bool {
        matches!(self.status, QueryStatus::Idle)
    }

    /// Returns `true` if a fetch is in flight.
    pub const fn is_loading(&self) -> bool {
        matches!(self.status, QueryStatus::Loading)
    }

    /// Returns `true` if the last fetch succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Success)
    }

    /// Returns `true` if the last fetch failed.
    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Error)
    }
}

impl<V: Send + Sync + 'static> QueryEntry<V> {
    pub(crate) fn from_raw(key: &QueryKey, raw: &RawEntry) -> Self {
        let value = raw.value.clone().and_then(|value| match value.downcast::<V>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(
                    key = %key,
                    expected = std::any::type_name::<V>(),
                    "cached value has a different type, reading as empty"
                );
                None
            }
        });

        Self {
            key: key.clone(),
            status: raw.status,
            value,
            error: raw.error.clone(),
            fetch_generation: raw.generation,
            is_stale: raw.is_stale,
            updated_at: raw.updated_at,
        }
    }
}

impl<V> Clone for QueryEntry<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            status: self.status,
            value: self.value.clone(),
            error: self.error.clone(),
            fetch_generation: self.fetch_generation,
            is_stale: self.is_stale,
            updated_at: self.updated_at,
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for QueryEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEntry")
            .field("key", &self.key)
            .field("status", &self.status)
            .field("value", &self.value)
            .field("error", &self.error)
            .field("fetch_generation", &self.fetch_generation)
            .field("is_stale", &self.is_stale)
            .finish_non_exhaustive()
    }
}

/// Type-erased entry state as stored in the cache.
#[derive(Clone)]
pub(crate) struct RawEntry {
    pub status: QueryStatus,
    pub value: Option<Arc<dyn Any + Send + Sync>>,
    pub error: Option<QueryError>,
    pub generation: u64,
    /// Bumped on every published transition; orders notifications per key.
    pub revision: u64,
    pub is_stale: bool,
    pub updated_at: Option<Instant>,
}

impl RawEntry {
    pub const fn new() -> Self {
        Self {
            status: QueryStatus::Idle,
            value: None,
            error: None,
            generation: 0,
            revision: 0,
            is_stale: false,
            updated_at: None,
        }
    }

    /// Replaces the entry, keeping the counters that must only move forward.
    pub fn replace_with(&mut self, saved: Self) {
        let (generation, revision) = (self.generation, self.revision);
        *self = saved;
        self.generation = generation;
        self.revision = revision;
    }

    /// Checks if the value has outlived `stale_time`.
    fn is_expired(&self, stale_time: Option<Duration>) -> bool {
        match (stale_time, self.updated_at) {
            (Some(stale_time), Some(updated_at)) => updated_at.elapsed() > stale_time,
            _ => false,
        }
    }
}

/// A fetch that is currently running for a slot.
pub(crate) struct InFlight {
    pub generation: u64,
    /// Status to return to if the fetch is cancelled.
    pub prior_status: QueryStatus,
    /// Set when the slot is invalidated after this fetch started.
    pub expired: bool,
    pub done: Shared<BoxFuture<'static, ()>>,
}

/// Everything the cache keeps for one key.
pub(crate) struct Slot {
    pub id: u64,
    pub raw: RawEntry,
    pub in_flight: Option<InFlight>,
    pub listeners: Listeners<RawEntry>,
    pub touched: Instant,
}

impl Slot {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            raw: RawEntry::new(),
            in_flight: None,
            listeners: Listeners::new(),
            touched: Instant::now(),
        }
    }

    /// The entry as observers should see it, with age-based staleness applied.
    pub fn view(&self, stale_time: Option<Duration>) -> RawEntry {
        let mut raw = self.raw.clone();
        if raw.is_expired(stale_time) {
            raw.is_stale = true;
        }
        raw
    }

    /// Records a transition and returns what its listeners should receive.
    pub fn publish(&mut self, stale_time: Option<Duration>) -> (RawEntry, Vec<Listener<RawEntry>>) {
        self.raw.revision += 1;
        (self.view(stale_time), self.listeners.snapshot())
    }

    /// The entry as it would be with any in-flight fetch abandoned.
    pub fn settled(&self) -> RawEntry {
        let mut raw = self.raw.clone();
        if let Some(in_flight) = &self.in_flight {
            raw.status = in_flight.prior_status;
        }
        raw
    }

    /// Whether `ensure_fresh` has to start a new generation.
    pub fn needs_fetch(&self, stale_time: Option<Duration>) -> bool {
        match self.raw.status {
            QueryStatus::Idle => true,
            _ => self.raw.is_stale || self.raw.is_expired(stale_time),
        }
    }

    /// Starts a new generation, abandoning any in-flight fetch.
    pub fn bump_generation(&mut self) -> Option<InFlight> {
        self.raw.generation += 1;
        self.in_flight.take()
    }

    /// Marks the value as outdated. Returns `false` if nothing changed.
    pub fn mark_stale(&mut self) -> bool {
        let mut changed = !self.raw.is_stale;
        self.raw.is_stale = true;
        if let Some(in_flight) = &mut self.in_flight {
            changed |= !in_flight.expired;
            in_flight.expired = true;
        }
        changed
    }

    /// Stores a value, resetting staleness.
    pub fn update(&mut self, value: Arc<dyn Any + Send + Sync>) {
        let now = Instant::now();
        self.raw.status = QueryStatus::Success;
        self.raw.value = Some(value);
        self.raw.error = None;
        self.raw.is_stale = false;
        self.raw.updated_at = Some(now);
        self.touched = now;
    }

    /// Checks if this slot should be garbage collected based on cache time.
    pub fn should_gc(&self, cache_time: Duration) -> bool {
        self.listeners.is_empty() && self.in_flight.is_none() && self.touched.elapsed() > cache_time
    }
}
