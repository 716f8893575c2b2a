//! Keyed store of read-model results.
//!
//! The [`QueryCache`] owns every [`QueryEntry`]. Observers read snapshots with
//! [`get`](QueryCache::get), register listeners with
//! [`subscribe`](QueryCache::subscribe), and ask for data with
//! [`ensure_fresh`](QueryCache::ensure_fresh).
//!
//! # Generations
//!
//! Every entry carries a fetch generation. Starting a fetch, cancelling, writing
//! data directly and restoring a snapshot each move the generation forward. A
//! fetch only commits its result if the entry's generation still matches the one
//! it started with, so a response that arrives after it has been superseded is
//! dropped and the entry never regresses to older data.
//!
//! A fetch that never completes normally (its future panicked, or the runtime
//! dropped the task) settles its generation as a
//! [`QueryError::Transport`] error, so the key does not stay `Loading`.
//!
//! # Notifications
//!
//! Listeners run after the transition is committed and outside every lock.
//! Each transition carries a per-key revision, and a listener never sees a
//! revision older than one it already received, also when transitions on one
//! key are committed from several threads.
//!
//! # Example
//!
//! ```rust
//! use futures::FutureExt;
//! use querysync::{QueryCache, QueryError};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache = QueryCache::new();
//!
//! let fetch = cache.ensure_fresh("friendRequestsSent", |_key| {
//!     async { Ok::<_, QueryError>(vec![7_u64, 8]) }.boxed()
//! });
//! fetch.settled().await;
//!
//! let entry = cache.get::<Vec<u64>>("friendRequestsSent");
//! assert_eq!(entry.data(), Some(&vec![7, 8]));
//! # }
//! ```

mod entry;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::stream::BoxStream;

use crate::config::CacheConfig;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::subscriber::{self, Listener, Subscription};

pub use entry::{QueryEntry, QueryStatus};
use entry::{InFlight, RawEntry, Slot};

/// What [`QueryCache::ensure_fresh`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A new generation was started.
    Started,
    /// A fetch for the current generation was already in flight and was joined.
    Joined,
    /// The cached entry is fresh; nothing was fetched.
    Fresh,
}

/// Result of [`QueryCache::ensure_fresh`].
///
/// Awaiting [`settled`](Self::settled) waits until the fetch this handle refers
/// to has completed (whether or not its result was committed).
#[must_use]
pub struct FetchHandle {
    outcome: FetchOutcome,
    generation: u64,
    done: Option<Shared<BoxFuture<'static, ()>>>,
}

impl FetchHandle {
    /// What the call did.
    pub const fn outcome(&self) -> FetchOutcome {
        self.outcome
    }

    /// The entry generation at the time of the call.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `true` if a fetch is running for this handle.
    pub const fn is_fetching(&self) -> bool {
        self.done.is_some()
    }

    /// Waits for the fetch to complete. Returns immediately for a fresh entry.
    pub async fn settled(self) {
        if let Some(done) = self.done {
            done.await;
        }
    }
}

impl fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle")
            .field("outcome", &self.outcome)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// A saved copy of one entry, used to roll back local writes.
#[derive(Clone)]
pub struct EntrySnapshot {
    key: QueryKey,
    raw: Option<RawEntry>,
}

impl EntrySnapshot {
    /// The key the snapshot was taken from.
    pub const fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl fmt::Debug for EntrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntrySnapshot")
            .field("key", &self.key)
            .field("status", &self.raw.as_ref().map(|raw| raw.status))
            .finish_non_exhaustive()
    }
}

struct CacheInner {
    slots: DashMap<QueryKey, Slot>,
    config: CacheConfig,
    next_slot: AtomicU64,
}

impl CacheInner {
    /// Slot ids keep a fetch that outlived its entry from landing in a new one.
    fn new_slot(&self) -> Slot {
        Slot::new(self.next_slot.fetch_add(1, Ordering::Relaxed))
    }
}

/// The spawned side of a fetch.
///
/// If the task ends without completing (the fetch panicked, or the runtime
/// dropped it) the generation is settled as an error on drop, so the entry
/// does not stay `Loading` with a fetch nobody will ever finish.
struct FetchTask {
    cache: Weak<CacheInner>,
    key: QueryKey,
    slot_id: u64,
    generation: u64,
    done: Option<oneshot::Sender<()>>,
}

impl FetchTask {
    fn complete<V>(mut self, result: Result<V, QueryError>)
    where
        V: Send + Sync + 'static,
    {
        self.settle(result);
    }

    fn settle<V>(&mut self, result: Result<V, QueryError>)
    where
        V: Send + Sync + 'static,
    {
        let Some(done) = self.done.take() else {
            return;
        };
        if let Some(inner) = self.cache.upgrade() {
            QueryCache { inner }.commit(&self.key, self.slot_id, self.generation, result);
        } else {
            tracing::debug!(key = %self.key, generation = self.generation, "query.fetch.orphaned");
        }
        let _ = done.send(());
    }
}

impl Drop for FetchTask {
    fn drop(&mut self) {
        if self.done.is_none() {
            return;
        }
        tracing::warn!(key = %self.key, generation = self.generation, "query.fetch.aborted");
        self.settle::<()>(Err(QueryError::Transport("fetch aborted".to_string())));
    }
}

/// The query cache.
///
/// Cloning is cheap and every clone shares the same entries. A cache is meant to
/// be constructed once per session and passed to whoever needs it.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    /// Creates a new cache with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Creates a new cache with the given configuration.
    #[must_use]
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                slots: DashMap::new(),
                config,
                next_slot: AtomicU64::new(0),
            }),
        }
    }

    /// Gets the cache configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Returns the current entry for `key`. Never blocks.
    ///
    /// A key that was never fetched reads as [`QueryStatus::Idle`] with
    /// generation 0.
    pub fn get<V>(&self, key: impl Into<QueryKey>) -> QueryEntry<V>
    where
        V: Send + Sync + 'static,
    {
        let key = key.into();
        let raw = self
            .inner
            .slots
            .get(&key)
            .map(|slot| slot.view(self.inner.config.stale_time));
        match raw {
            Some(raw) => QueryEntry::from_raw(&key, &raw),
            None => QueryEntry::idle(key),
        }
    }

    /// Current fetch generation of `key`, 0 if the key has no entry.
    pub fn generation(&self, key: impl Into<QueryKey>) -> u64 {
        self.inner
            .slots
            .get(&key.into())
            .map_or(0, |slot| slot.raw.generation)
    }

    /// Makes sure `key` holds fresh data, fetching it with `fetch` if needed.
    ///
    /// A fetch is started when the entry is idle, was invalidated, or is older
    /// than [`CacheConfig::stale_time`]. While it runs the entry is `Loading`
    /// and keeps its previous value. Calls made while a fetch for the current
    /// generation is in flight join that fetch instead of starting another one;
    /// `fetch` is not called for them.
    ///
    /// The fetch runs as a Tokio task, so the returned handle never has to be
    /// awaited for the result to land in the cache.
    ///
    /// # Panics
    ///
    /// Panics if a fetch has to be started outside of a Tokio runtime.
    pub fn ensure_fresh<V, F>(&self, key: impl Into<QueryKey>, fetch: F) -> FetchHandle
    where
        V: Send + Sync + 'static,
        F: FnOnce(&QueryKey) -> BoxFuture<'static, Result<V, QueryError>>,
    {
        let key = key.into();
        let stale_time = self.inner.config.stale_time;

        let (slot_id, generation, done, tx, raw, listeners) = {
            let mut slot = self.inner.slots.entry(key.clone()).or_insert_with(|| self.inner.new_slot());

            if let Some(in_flight) = &slot.in_flight
                && !in_flight.expired
            {
                tracing::trace!(key = %key, generation = in_flight.generation, "query.join");
                return FetchHandle {
                    outcome: FetchOutcome::Joined,
                    generation: in_flight.generation,
                    done: Some(in_flight.done.clone()),
                };
            }

            if !slot.needs_fetch(stale_time) {
                return FetchHandle {
                    outcome: FetchOutcome::Fresh,
                    generation: slot.raw.generation,
                    done: None,
                };
            }

            let prior_status = match slot.bump_generation() {
                Some(abandoned) => abandoned.prior_status,
                None => slot.raw.status,
            };
            let generation = slot.raw.generation;
            slot.raw.status = QueryStatus::Loading;

            let (tx, rx) = oneshot::channel::<()>();
            let done = rx.map(|_| ()).boxed().shared();
            slot.in_flight = Some(InFlight {
                generation,
                prior_status,
                expired: false,
                done: done.clone(),
            });

            let (raw, listeners) = slot.publish(stale_time);
            (slot.id, generation, done, tx, raw, listeners)
        };

        tracing::debug!(key = %key, generation, "query.fetch.start");
        subscriber::notify(&listeners, &raw);

        let task = FetchTask {
            cache: Arc::downgrade(&self.inner),
            key,
            slot_id,
            generation,
            done: Some(tx),
        };
        let future = fetch(&task.key);
        tokio::spawn(async move {
            let result = future.await;
            task.complete(result);
        });

        FetchHandle {
            outcome: FetchOutcome::Started,
            generation,
            done: Some(done),
        }
    }

    /// Applies a completed fetch if its generation is still current.
    fn commit<V>(
        &self,
        key: &QueryKey,
        slot_id: u64,
        generation: u64,
        result: Result<V, QueryError>,
    )
    where
        V: Send + Sync + 'static,
    {
        let (raw, listeners) = {
            let Some(mut slot) = self
                .inner
                .slots
                .get_mut(key)
                .filter(|slot| slot.id == slot_id)
            else {
                tracing::debug!(key = %key, generation, "query.fetch.discard: entry removed");
                return;
            };

            if slot.raw.generation != generation {
                tracing::debug!(
                    key = %key,
                    generation,
                    current = slot.raw.generation,
                    "query.fetch.discard: superseded"
                );
                return;
            }

            let expired = slot.in_flight.take().is_some_and(|in_flight| in_flight.expired);
            match result {
                Ok(value) => {
                    slot.update(Arc::new(value));
                    slot.raw.is_stale = expired;
                    tracing::debug!(key = %key, generation, "query.fetch.success");
                }
                Err(error) => {
                    tracing::debug!(key = %key, generation, error = %error, "query.fetch.error");
                    slot.raw.status = QueryStatus::Error;
                    slot.raw.error = Some(error);
                }
            }

            slot.publish(self.inner.config.stale_time)
        };

        subscriber::notify(&listeners, &raw);
    }

    /// Marks `key` stale so the next [`ensure_fresh`](Self::ensure_fresh) fetches.
    ///
    /// The cached value stays readable. A fetch that is already in flight is
    /// not joined by later calls; its result still lands but stays stale.
    /// Invalidating an already stale entry does nothing.
    pub fn invalidate(&self, key: impl Into<QueryKey>) {
        let key = key.into();
        let (raw, listeners) = {
            let Some(mut slot) = self.inner.slots.get_mut(&key) else {
                return;
            };

            let was_stale = slot.raw.is_stale;
            if !slot.mark_stale() {
                return;
            }
            tracing::debug!(key = %key, generation = slot.raw.generation, "query.invalidate");

            if was_stale {
                return;
            }
            slot.publish(self.inner.config.stale_time)
        };

        subscriber::notify(&listeners, &raw);
    }

    /// Discards any outstanding fetch for `key` without starting a new one.
    ///
    /// The generation moves forward, so a response that is still on its way is
    /// dropped when it arrives. An entry that was `Loading` returns to the
    /// status it had before that fetch started. Keys without an entry are left
    /// alone.
    pub fn cancel(&self, key: impl Into<QueryKey>) {
        let key = key.into();
        let (raw, listeners) = {
            let Some(mut slot) = self.inner.slots.get_mut(&key) else {
                return;
            };

            let abandoned = slot.bump_generation();
            tracing::debug!(
                key = %key,
                generation = slot.raw.generation,
                abandoned = abandoned.is_some(),
                "query.cancel"
            );

            let Some(abandoned) = abandoned else {
                return;
            };
            slot.raw.status = abandoned.prior_status;
            slot.publish(self.inner.config.stale_time)
        };

        subscriber::notify(&listeners, &raw);
    }

    /// Keys currently cached under `prefix` (including `prefix` itself).
    pub fn keys_matching(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        self.inner
            .slots
            .iter()
            .filter(|slot| prefix.is_prefix_of(slot.key()))
            .map(|slot| slot.key().clone())
            .collect()
    }

    /// [`cancel`](Self::cancel)s every key under `prefix`.
    pub fn cancel_matching(&self, prefix: &QueryKey) {
        for key in self.keys_matching(prefix) {
            self.cancel(key);
        }
    }

    /// [`invalidate`](Self::invalidate)s every key under `prefix`.
    pub fn invalidate_matching(&self, prefix: &QueryKey) {
        for key in self.keys_matching(prefix) {
            self.invalidate(key);
        }
    }

    /// Writes `value` for `key` directly, as if a fetch had just succeeded.
    ///
    /// Any fetch in flight for `key` is superseded.
    pub fn set_data<V>(&self, key: impl Into<QueryKey>, value: V)
    where
        V: Send + Sync + 'static,
    {
        let key = key.into();
        let (raw, listeners) = {
            let mut slot = self.inner.slots.entry(key.clone()).or_insert_with(|| self.inner.new_slot());
            slot.bump_generation();
            slot.update(Arc::new(value));
            tracing::debug!(key = %key, generation = slot.raw.generation, "query.set_data");
            slot.publish(self.inner.config.stale_time)
        };

        subscriber::notify(&listeners, &raw);
    }

    /// Captures `key` so it can later be [`restore`](Self::restore)d.
    ///
    /// A fetch in flight is not part of the snapshot: the entry is captured with
    /// the status it had before that fetch started.
    pub fn snapshot(&self, key: impl Into<QueryKey>) -> EntrySnapshot {
        let key = key.into();
        let raw = self.inner.slots.get(&key).map(|slot| slot.settled());
        EntrySnapshot { key, raw }
    }

    /// Puts a snapshot back in place, superseding anything in flight.
    ///
    /// Restoring a snapshot of a key that had no entry resets it to idle.
    pub fn restore(&self, snapshot: EntrySnapshot) {
        let EntrySnapshot { key, raw: saved } = snapshot;
        let (raw, listeners) = {
            let mut slot = self.inner.slots.entry(key.clone()).or_insert_with(|| self.inner.new_slot());
            slot.bump_generation();
            slot.raw.replace_with(saved.unwrap_or_else(RawEntry::new));
            tracing::debug!(key = %key, generation = slot.raw.generation, "query.restore");
            slot.publish(self.inner.config.stale_time)
        };

        subscriber::notify(&listeners, &raw);
    }

    /// Forgets the entry for `key`.
    ///
    /// A fetch in flight is discarded. If the key still has subscribers the
    /// entry is reset to idle (and they are notified) instead of dropped.
    pub fn remove(&self, key: impl Into<QueryKey>) {
        let key = key.into();
        if self
            .inner
            .slots
            .remove_if(&key, |_, slot| slot.listeners.is_empty())
            .is_some()
        {
            tracing::debug!(key = %key, "query.remove");
            return;
        }

        let (raw, listeners) = {
            let Some(mut slot) = self.inner.slots.get_mut(&key) else {
                return;
            };
            slot.bump_generation();
            slot.raw.replace_with(RawEntry::new());
            tracing::debug!(
                key = %key,
                generation = slot.raw.generation,
                "query.remove: reset observed entry"
            );
            slot.publish(self.inner.config.stale_time)
        };

        subscriber::notify(&listeners, &raw);
    }

    /// Removes unobserved, settled entries not touched for
    /// [`CacheConfig::cache_time`]. Returns how many were removed.
    pub fn gc(&self) -> usize {
        let cache_time = self.inner.config.cache_time;
        let before = self.inner.slots.len();
        self.inner.slots.retain(|_, slot| !slot.should_gc(cache_time));
        let removed = before.saturating_sub(self.inner.slots.len());
        if removed > 0 {
            tracing::debug!(removed, "query.gc");
        }
        removed
    }

    /// Registers `listener` for every transition of `key`.
    ///
    /// The listener is called once right away with the current entry, then after
    /// each committed transition.
    pub fn subscribe<V, L>(&self, key: impl Into<QueryKey>, listener: L) -> Subscription
    where
        V: Send + Sync + 'static,
        L: Fn(&QueryEntry<V>) + Send + Sync + 'static,
    {
        let key = key.into();
        let typed_key = key.clone();
        // Transitions are published after the shard lock is released, so two
        // threads can deliver them out of order. Older revisions are dropped.
        let delivered = AtomicU64::new(0);
        let listener: Listener<RawEntry> = Arc::new(move |raw: &RawEntry| {
            if delivered.fetch_max(raw.revision + 1, Ordering::AcqRel) > raw.revision {
                return;
            }
            listener(&QueryEntry::from_raw(&typed_key, raw));
        });

        let (id, current) = {
            let mut slot = self.inner.slots.entry(key.clone()).or_insert_with(|| self.inner.new_slot());
            let id = slot.listeners.insert(Arc::clone(&listener));
            (id, slot.view(self.inner.config.stale_time))
        };
        listener(&current);

        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade()
                && let Some(mut slot) = inner.slots.get_mut(&key)
            {
                slot.listeners.remove(id);
            }
        })
    }

    /// Observes `key` as a stream. The first item is the current entry.
    pub fn watch<V>(&self, key: impl Into<QueryKey>) -> BoxStream<'static, QueryEntry<V>>
    where
        V: Send + Sync + 'static,
    {
        let key = key.into();
        subscriber::stream_of(|listener: Listener<QueryEntry<V>>| {
            self.subscribe(key, move |entry: &QueryEntry<V>| listener(entry))
        })
    }

    /// Number of listeners registered for `key`.
    pub fn subscriber_count(&self, key: impl Into<QueryKey>) -> usize {
        self.inner
            .slots
            .get(&key.into())
            .map_or(0, |slot| slot.listeners.len())
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    /// Every cached key.
    #[must_use]
    pub fn keys(&self) -> Vec<QueryKey> {
        self.inner
            .slots
            .iter()
            .map(|slot| slot.key().clone())
            .collect()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.inner.slots.len())
            .field("config", &self.inner.config)
            .finish()
    }
}
