//! Mutation lifecycle coordination.
//!
//! A [`Mutation`] declares one remote write: its input and output types, the
//! operation name sent to the [`Gateway`], and the query keys it makes obsolete.
//! A [`MutationCoordinator`] runs it against a [`QueryCache`]:
//!
//! 1. a second run while one is in flight is rejected with
//!    [`QueryError::Conflict`], and invalid input with [`QueryError::Validation`]
//! 2. the error sink is cleared
//! 3. in-flight reads of the affected keys are cancelled, and the optional
//!    optimistic update is applied
//! 4. the state becomes `Loading`
//! 5. the gateway is called exactly once
//! 6. on success the affected keys are invalidated and the state becomes `Success`
//! 7. on failure nothing is invalidated, any optimistic update is rolled back, the
//!    error is reported and the state becomes `Error`
//!
//! A run whose future is dropped after dispatch has an unknown outcome: its
//! optimistic update is rolled back and the affected keys are invalidated.
//!
//! # Example
//!
//! ```rust
//! use futures::FutureExt;
//! use querysync::{ErrorSlot, GatewayError, Mutation, MutationCoordinator, QueryCache, QueryKey};
//!
//! struct CancelFriendRequest;
//!
//! impl Mutation for CancelFriendRequest {
//!     type Input = u64;
//!     type Output = ();
//!     const NAME: &'static str = "cancelFriendRequest";
//!
//!     fn affected_keys(&self, _friend_request_id: &u64) -> Vec<QueryKey> {
//!         vec![QueryKey::new("friendRequestsSent")]
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache = QueryCache::new();
//! let errors = ErrorSlot::new();
//! let gateway = |_: &'static str, _: u64| async { Ok::<_, GatewayError>(()) }.boxed();
//!
//! let cancel = MutationCoordinator::new(cache.clone(), gateway, CancelFriendRequest)
//!     .with_error_sink(errors.clone());
//!
//! cancel.run(7).await.unwrap();
//! assert!(cancel.state().is_success());
//! assert_eq!(errors.message(), None);
//! # }
//! ```

use std::sync::Arc;

use futures::stream::BoxStream;
use parking_lot::Mutex;

use crate::cache::{EntrySnapshot, QueryCache};
use crate::error::QueryError;
use crate::gateway::Gateway;
use crate::key::QueryKey;
use crate::sink::ErrorSink;
use crate::subscriber::{self, Listener, Listeners, Subscription};

/// A remote write, declared as a type.
pub trait Mutation: Send + Sync + 'static {
    /// Request payload.
    type Input: Send + 'static;
    /// Response payload.
    type Output: Send + 'static;

    /// Operation name passed to the gateway.
    const NAME: &'static str;

    /// Keys (or key prefixes) whose cached data this mutation makes obsolete.
    fn affected_keys(&self, input: &Self::Input) -> Vec<QueryKey>;

    /// Rejects malformed input before anything is dispatched.
    ///
    /// # Errors
    ///
    /// Returns a description of what is wrong with `input`.
    fn validate(&self, _input: &Self::Input) -> Result<(), String> {
        Ok(())
    }

    /// Adjusts the cache before the server confirms the mutation.
    ///
    /// Affected entries are snapshotted first and restored if the mutation
    /// fails, unless something newer has replaced them in the meantime.
    fn optimistic_update(&self, _cache: &QueryCache, _input: &Self::Input) {}
}

/// Lifecycle status of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationStatus {
    /// Not yet started, or reset.
    Idle,
    /// The remote call is in progress.
    Loading,
    /// The last run succeeded.
    Success,
    /// The last run failed.
    Error,
}

/// The state of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationState {
    /// Current status.
    pub status: MutationStatus,
    /// Error of the last failed run.
    pub error: Option<QueryError>,
}

impl MutationState {
    const fn idle() -> Self {
        Self {
            status: MutationStatus::Idle,
            error: None,
        }
    }

    const fn with_status(status: MutationStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }

    /// Returns `true` if the mutation has not run since creation or reset.
    pub const fn is_idle(&self) -> bool {
        matches!(self.status, MutationStatus::Idle)
    }

    /// Returns `true` if the mutation is currently loading.
    pub const fn is_loading(&self) -> bool {
        matches!(self.status, MutationStatus::Loading)
    }

    /// Returns `true` if the mutation succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self.status, MutationStatus::Success)
    }

    /// Returns `true` if the mutation failed.
    pub const fn is_error(&self) -> bool {
        matches!(self.status, MutationStatus::Error)
    }
}

impl Default for MutationState {
    fn default() -> Self {
        Self::idle()
    }
}

struct Lifecycle {
    state: MutationState,
    /// A run has claimed the coordinator and not yet finished.
    in_flight: bool,
    poisoned: Option<QueryError>,
    listeners: Listeners<MutationState>,
}

impl Lifecycle {
    fn transition(&mut self, state: MutationState) -> (MutationState, Vec<Listener<MutationState>>) {
        self.state = state;
        (self.state.clone(), self.listeners.snapshot())
    }
}

/// An entry saved before the optimistic update, and the generation that update left behind.
struct Rollback {
    snapshot: EntrySnapshot,
    after: u64,
}

/// Cache work owed by a dispatched run whose outcome is not yet known.
struct Dispatched {
    affected: Vec<QueryKey>,
    rollbacks: Vec<Rollback>,
}

impl Dispatched {
    /// Undoes optimistic writes that nothing newer has replaced.
    fn roll_back(&mut self, cache: &QueryCache) {
        for rollback in self.rollbacks.drain(..) {
            if cache.generation(rollback.snapshot.key()) == rollback.after {
                cache.restore(rollback.snapshot);
            }
        }
    }

    fn invalidate(&self, cache: &QueryCache) {
        for key in &self.affected {
            cache.invalidate_matching(key);
        }
    }
}

/// Releases the coordinator when a run ends, including when its future is dropped.
struct RunClaim<'a> {
    lifecycle: &'a Mutex<Lifecycle>,
    cache: &'a QueryCache,
    operation: &'static str,
    dispatched: Option<Dispatched>,
    finished: bool,
}

impl RunClaim<'_> {
    fn dispatch(&mut self, affected: Vec<QueryKey>, rollbacks: Vec<Rollback>) {
        self.dispatched = Some(Dispatched { affected, rollbacks });
    }

    fn succeeded(&mut self) {
        if let Some(dispatched) = self.dispatched.take() {
            dispatched.invalidate(self.cache);
        }
    }

    fn failed(&mut self) {
        if let Some(mut dispatched) = self.dispatched.take() {
            dispatched.roll_back(self.cache);
        }
    }

    fn finish(mut self, state: MutationState, poison: Option<QueryError>) {
        self.finished = true;
        let (state, listeners) = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.in_flight = false;
            if poison.is_some() {
                lifecycle.poisoned = poison;
            }
            lifecycle.transition(state)
        };
        subscriber::notify(&listeners, &state);
    }
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        // The gateway call went down with the run, so whether the server
        // applied the mutation is unknown.
        if let Some(mut dispatched) = self.dispatched.take() {
            tracing::debug!(
                operation = self.operation,
                affected = dispatched.affected.len(),
                "mutation.abandoned: outcome unknown"
            );
            dispatched.roll_back(self.cache);
            dispatched.invalidate(self.cache);
        }

        let abandoned = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.in_flight = false;
            lifecycle
                .state
                .is_loading()
                .then(|| lifecycle.transition(MutationState::idle()))
        };

        if let Some((state, listeners)) = abandoned {
            subscriber::notify(&listeners, &state);
        }
    }
}

/// Runs one [`Mutation`] at a time against a cache.
///
/// At most one run is in flight per coordinator. Callers that need independent
/// concurrent mutations use separate coordinators.
pub struct MutationCoordinator<M: Mutation> {
    mutation: M,
    cache: QueryCache,
    gateway: Arc<dyn Gateway<M::Input, M::Output>>,
    error_sink: Option<Arc<dyn ErrorSink>>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl<M: Mutation> MutationCoordinator<M> {
    /// Creates a coordinator for `mutation`.
    pub fn new(
        cache: QueryCache,
        gateway: impl Gateway<M::Input, M::Output> + 'static,
        mutation: M,
    ) -> Self {
        Self {
            mutation,
            cache,
            gateway: Arc::new(gateway),
            error_sink: None,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: MutationState::idle(),
                in_flight: false,
                poisoned: None,
                listeners: Listeners::new(),
            })),
        }
    }

    /// Surfaces errors to `sink`.
    #[must_use]
    pub fn with_error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.error_sink = Some(Arc::new(sink));
        self
    }

    /// The mutation definition.
    pub const fn mutation(&self) -> &M {
        &self.mutation
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> MutationState {
        self.lifecycle.lock().state.clone()
    }

    /// Returns `true` once a fatal gateway failure has disabled this coordinator.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.lifecycle.lock().poisoned.is_some()
    }

    /// Runs the mutation once.
    ///
    /// Dropping the returned future before it completes abandons the run. The
    /// gateway call is dropped with it, so its outcome is unknown: optimistic
    /// writes that are still current are rolled back, the affected keys are
    /// invalidated, the coordinator is released and a `Loading` state returns
    /// to `Idle`.
    ///
    /// # Errors
    ///
    /// - [`QueryError::Conflict`] if another run is in flight (nothing changes)
    /// - [`QueryError::Validation`] if [`Mutation::validate`] rejects the input
    /// - [`QueryError::Transport`] if the gateway call fails
    /// - [`QueryError::Fatal`] if the gateway failed fatally, now or earlier
    pub async fn run(&self, input: M::Input) -> Result<M::Output, QueryError> {
        let mut claim = self.claim()?;

        if let Err(reason) = self.mutation.validate(&input) {
            let error = QueryError::Validation(reason);
            tracing::debug!(operation = M::NAME, error = %error, "mutation.rejected");
            self.report(&error);
            return Err(error);
        }

        if let Some(sink) = &self.error_sink {
            sink.clear();
        }

        let affected = self.mutation.affected_keys(&input);
        for key in &affected {
            self.cache.cancel_matching(key);
        }
        let rollbacks = self.apply_optimistic_update(&affected, &input);
        let affected_count = affected.len();
        claim.dispatch(affected, rollbacks);

        let (state, listeners) = self
            .lifecycle
            .lock()
            .transition(MutationState::with_status(MutationStatus::Loading));
        tracing::debug!(operation = M::NAME, affected = affected_count, "mutation.dispatch");
        subscriber::notify(&listeners, &state);

        match self.gateway.call(M::NAME, input).await {
            Ok(output) => {
                claim.succeeded();
                tracing::debug!(operation = M::NAME, "mutation.success");
                claim.finish(MutationState::with_status(MutationStatus::Success), None);
                Ok(output)
            }
            Err(error) => {
                let error = QueryError::from(error);
                tracing::debug!(operation = M::NAME, error = %error, "mutation.error");

                claim.failed();
                self.report(&error);

                let poison = error.is_fatal().then(|| error.clone());
                if poison.is_some() {
                    tracing::warn!(operation = M::NAME, error = %error, "mutation.poisoned");
                }
                claim.finish(
                    MutationState {
                        status: MutationStatus::Error,
                        error: Some(error.clone()),
                    },
                    poison,
                );
                Err(error)
            }
        }
    }

    /// Returns the coordinator to `Idle` with no error.
    ///
    /// A run that is still in flight is not cancelled: it keeps the coordinator
    /// busy, and its completion still invalidates the cache and sets the final
    /// state.
    pub fn reset(&self) {
        let (state, listeners) = self.lifecycle.lock().transition(MutationState::idle());
        tracing::trace!(operation = M::NAME, "mutation.reset");
        subscriber::notify(&listeners, &state);
    }

    /// Registers `listener` for every state transition.
    ///
    /// The listener is called once right away with the current state.
    pub fn subscribe<L>(&self, listener: L) -> Subscription
    where
        L: Fn(&MutationState) + Send + Sync + 'static,
    {
        let listener: Listener<MutationState> = Arc::new(listener);
        let (id, current) = {
            let mut lifecycle = self.lifecycle.lock();
            let id = lifecycle.listeners.insert(Arc::clone(&listener));
            (id, lifecycle.state.clone())
        };
        listener(&current);

        let weak = Arc::downgrade(&self.lifecycle);
        Subscription::new(move || {
            if let Some(lifecycle) = weak.upgrade() {
                lifecycle.lock().listeners.remove(id);
            }
        })
    }

    /// Observes state transitions as a stream. The first item is the current state.
    pub fn watch(&self) -> BoxStream<'static, MutationState> {
        subscriber::stream_of(|listener: Listener<MutationState>| {
            self.subscribe(move |state: &MutationState| listener(state))
        })
    }

    fn claim(&self) -> Result<RunClaim<'_>, QueryError> {
        let mut lifecycle = self.lifecycle.lock();
        if let Some(fatal) = &lifecycle.poisoned {
            return Err(fatal.clone());
        }
        if lifecycle.in_flight {
            tracing::debug!(operation = M::NAME, "mutation.conflict");
            return Err(QueryError::Conflict {
                operation: M::NAME,
            });
        }
        lifecycle.in_flight = true;

        Ok(RunClaim {
            lifecycle: &self.lifecycle,
            cache: &self.cache,
            operation: M::NAME,
            dispatched: None,
            finished: false,
        })
    }

    fn apply_optimistic_update(&self, affected: &[QueryKey], input: &M::Input) -> Vec<Rollback> {
        let mut snapshots: Vec<(EntrySnapshot, u64)> = Vec::new();
        for prefix in affected {
            let mut keys = self.cache.keys_matching(prefix);
            if !keys.contains(prefix) {
                keys.push(prefix.clone());
            }
            for key in keys {
                if snapshots.iter().any(|(snapshot, _)| snapshot.key() == &key) {
                    continue;
                }
                let before = self.cache.generation(&key);
                snapshots.push((self.cache.snapshot(key), before));
            }
        }

        self.mutation.optimistic_update(&self.cache, input);

        snapshots
            .into_iter()
            .filter_map(|(snapshot, before)| {
                let after = self.cache.generation(snapshot.key());
                (after != before).then_some(Rollback { snapshot, after })
            })
            .collect()
    }

    fn report(&self, error: &QueryError) {
        if let Some(sink) = &self.error_sink {
            sink.report(error);
        }
    }
}

impl<M: Mutation + std::fmt::Debug> std::fmt::Debug for MutationCoordinator<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("mutation", &self.mutation)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::sink::ErrorSlot;
    use futures::{FutureExt, StreamExt};
    use std::pin::pin;
    use tokio::sync::oneshot;

    const SENT: &str = "friendRequestsSent";

    type Calls = Arc<Mutex<Vec<(&'static str, u64)>>>;

    struct CancelFriendRequest;

    impl Mutation for CancelFriendRequest {
        type Input = u64;
        type Output = ();
        const NAME: &'static str = "cancelFriendRequest";

        fn affected_keys(&self, _: &u64) -> Vec<QueryKey> {
            vec![QueryKey::new(SENT)]
        }

        fn validate(&self, friend_request_id: &u64) -> Result<(), String> {
            if *friend_request_id == 0 {
                return Err("friend request id must be positive".to_string());
            }
            Ok(())
        }
    }

    /// Removes the request from the sent list before the server confirms.
    struct CancelOptimistically;

    impl Mutation for CancelOptimistically {
        type Input = u64;
        type Output = ();
        const NAME: &'static str = "cancelFriendRequest";

        fn affected_keys(&self, _: &u64) -> Vec<QueryKey> {
            vec![QueryKey::new(SENT)]
        }

        fn optimistic_update(&self, cache: &QueryCache, friend_request_id: &u64) {
            let sent = cache.get::<Vec<u64>>(SENT);
            if let Some(ids) = sent.data() {
                let remaining: Vec<u64> = ids.iter().copied().filter(|id| id != friend_request_id).collect();
                cache.set_data(SENT, remaining);
            }
        }
    }

    fn replying(calls: Calls, result: Result<(), GatewayError>) -> impl Gateway<u64, ()> {
        move |operation: &'static str, input: u64| {
            calls.lock().push((operation, input));
            let result = result.clone();
            async move { result }.boxed()
        }
    }

    /// A gateway whose single reply is sent by the test.
    fn pending(calls: Calls) -> (oneshot::Sender<Result<(), GatewayError>>, impl Gateway<u64, ()>) {
        let (tx, rx) = oneshot::channel();
        let rx = Arc::new(Mutex::new(Some(rx)));
        let gateway = move |operation: &'static str, input: u64| {
            calls.lock().push((operation, input));
            let rx = rx.lock().take();
            async move {
                match rx {
                    Some(rx) => rx
                        .await
                        .unwrap_or_else(|_| Err(GatewayError::Transport("dropped".to_string()))),
                    None => Err(GatewayError::Transport("no reply scripted".to_string())),
                }
            }
            .boxed()
        };
        (tx, gateway)
    }

    fn seeded_cache() -> QueryCache {
        let cache = QueryCache::new();
        cache.set_data(SENT, vec![7_u64, 8]);
        cache
    }

    #[tokio::test]
    async fn test_run_success_invalidates_affected_keys() {
        let cache = seeded_cache();
        let calls = Calls::default();
        let errors = ErrorSlot::new();
        let coordinator =
            MutationCoordinator::new(cache.clone(), replying(calls.clone(), Ok(())), CancelFriendRequest)
                .with_error_sink(errors.clone());

        assert_eq!(coordinator.run(7).await, Ok(()));

        assert!(coordinator.state().is_success());
        assert_eq!(coordinator.state().error, None);
        assert_eq!(*calls.lock(), [("cancelFriendRequest", 7)]);
        assert_eq!(errors.message(), None);

        let sent = cache.get::<Vec<u64>>(SENT);
        assert!(sent.is_stale);
        assert_eq!(sent.data(), Some(&vec![7, 8]));
    }

    #[tokio::test]
    async fn test_run_failure_leaves_cache_untouched() {
        let cache = seeded_cache();
        let calls = Calls::default();
        let errors = ErrorSlot::new();
        let not_found = GatewayError::Transport("NOT_FOUND".to_string());
        let coordinator =
            MutationCoordinator::new(cache.clone(), replying(calls.clone(), Err(not_found)), CancelFriendRequest)
                .with_error_sink(errors.clone());

        let result = coordinator.run(7).await;
        assert_eq!(result, Err(QueryError::Transport("NOT_FOUND".to_string())));

        let state = coordinator.state();
        assert!(state.is_error());
        assert_eq!(state.error, Some(QueryError::Transport("NOT_FOUND".to_string())));
        assert_eq!(errors.message(), Some("NOT_FOUND".to_string()));

        let sent = cache.get::<Vec<u64>>(SENT);
        assert!(sent.is_success());
        assert!(!sent.is_stale);
        assert_eq!(sent.data(), Some(&vec![7, 8]));
    }

    #[tokio::test]
    async fn test_reentrant_run_is_rejected() {
        let cache = seeded_cache();
        let calls = Calls::default();
        let (tx, gateway) = pending(calls.clone());
        let coordinator = MutationCoordinator::new(cache, gateway, CancelFriendRequest);

        let mut first = pin!(coordinator.run(7));
        assert!(futures::poll!(first.as_mut()).is_pending());
        assert!(coordinator.state().is_loading());

        let second = coordinator.run(8).await;
        assert_eq!(
            second,
            Err(QueryError::Conflict {
                operation: "cancelFriendRequest"
            })
        );
        assert!(coordinator.state().is_loading());
        assert_eq!(calls.lock().len(), 1);

        tx.send(Ok(())).expect("gateway is waiting");
        assert_eq!(first.await, Ok(()));
        assert!(coordinator.state().is_success());
    }

    #[tokio::test]
    async fn test_validation_never_reaches_gateway() {
        let calls = Calls::default();
        let errors = ErrorSlot::new();
        let coordinator =
            MutationCoordinator::new(seeded_cache(), replying(calls.clone(), Ok(())), CancelFriendRequest)
                .with_error_sink(errors.clone());

        let result = coordinator.run(0).await;
        assert_eq!(
            result,
            Err(QueryError::Validation("friend request id must be positive".to_string()))
        );
        assert!(calls.lock().is_empty());
        assert!(coordinator.state().is_idle());
        assert_eq!(
            errors.message(),
            Some("friend request id must be positive".to_string())
        );

        // The coordinator is free again.
        assert_eq!(coordinator.run(7).await, Ok(()));
        assert_eq!(errors.message(), None);
    }

    #[tokio::test]
    async fn test_error_is_cleared_before_next_dispatch() {
        let calls = Calls::default();
        let errors = ErrorSlot::new();
        let (tx, gateway) = pending(calls.clone());
        let coordinator = MutationCoordinator::new(seeded_cache(), gateway, CancelFriendRequest)
            .with_error_sink(errors.clone());
        errors.report(&QueryError::Transport("previous".to_string()));

        let mut run = pin!(coordinator.run(7));
        assert!(futures::poll!(run.as_mut()).is_pending());
        assert_eq!(errors.message(), None);

        tx.send(Ok(())).expect("gateway is waiting");
        assert_eq!(run.await, Ok(()));
    }

    #[tokio::test]
    async fn test_run_cancels_in_flight_reads() {
        let cache = seeded_cache();
        cache.invalidate(SENT);
        let (read_tx, read_rx) = oneshot::channel::<Result<Vec<u64>, QueryError>>();
        let read = cache.ensure_fresh(SENT, move |_: &QueryKey| {
            async move {
                read_rx
                    .await
                    .unwrap_or_else(|_| Err(QueryError::Transport("dropped".to_string())))
            }
            .boxed()
        });
        let read_generation = read.generation();

        let calls = Calls::default();
        let (tx, gateway) = pending(calls);
        let coordinator = MutationCoordinator::new(cache.clone(), gateway, CancelFriendRequest);

        let mut run = pin!(coordinator.run(7));
        assert!(futures::poll!(run.as_mut()).is_pending());
        assert_eq!(cache.generation(SENT), read_generation + 1);

        // The read was issued before the mutation and must not land.
        read_tx.send(Ok(vec![7, 8, 9])).expect("fetch is still running");
        read.settled().await;
        assert_eq!(cache.get::<Vec<u64>>(SENT).data(), Some(&vec![7, 8]));

        tx.send(Ok(())).expect("gateway is waiting");
        assert_eq!(run.await, Ok(()));
        assert!(cache.get::<Vec<u64>>(SENT).is_stale);
    }

    #[tokio::test]
    async fn test_reset_is_fire_and_forget() {
        let cache = seeded_cache();
        let calls = Calls::default();
        let (tx, gateway) = pending(calls.clone());
        let coordinator = MutationCoordinator::new(cache.clone(), gateway, CancelFriendRequest);

        let mut run = pin!(coordinator.run(7));
        assert!(futures::poll!(run.as_mut()).is_pending());

        coordinator.reset();
        assert!(coordinator.state().is_idle());

        // Still busy until the outstanding call settles.
        assert!(matches!(
            coordinator.run(8).await,
            Err(QueryError::Conflict { .. })
        ));
        assert_eq!(calls.lock().len(), 1);

        tx.send(Ok(())).expect("gateway is waiting");
        assert_eq!(run.await, Ok(()));
        assert!(coordinator.state().is_success());
        assert!(cache.get::<Vec<u64>>(SENT).is_stale);

        coordinator.reset();
        assert_eq!(coordinator.state(), MutationState::default());
    }

    #[tokio::test]
    async fn test_fatal_error_poisons_coordinator() {
        let calls = Calls::default();
        let errors = ErrorSlot::new();
        let fatal = GatewayError::Fatal("transport destroyed".to_string());
        let coordinator =
            MutationCoordinator::new(seeded_cache(), replying(calls.clone(), Err(fatal)), CancelFriendRequest)
                .with_error_sink(errors.clone());

        let result = coordinator.run(7).await;
        assert_eq!(result, Err(QueryError::Fatal("transport destroyed".to_string())));
        assert!(coordinator.is_poisoned());
        assert!(coordinator.state().is_error());
        assert_eq!(errors.message(), Some("transport destroyed".to_string()));

        let again = coordinator.run(8).await;
        assert_eq!(again, Err(QueryError::Fatal("transport destroyed".to_string())));
        assert_eq!(calls.lock().len(), 1);

        coordinator.reset();
        assert!(coordinator.is_poisoned());
    }

    #[tokio::test]
    async fn test_optimistic_update_rolled_back_on_failure() {
        let cache = seeded_cache();
        let calls = Calls::default();
        let (tx, gateway) = pending(calls);
        let coordinator = MutationCoordinator::new(cache.clone(), gateway, CancelOptimistically);

        let mut run = pin!(coordinator.run(7));
        assert!(futures::poll!(run.as_mut()).is_pending());
        assert_eq!(cache.get::<Vec<u64>>(SENT).data(), Some(&vec![8]));

        tx.send(Err(GatewayError::Transport("NOT_FOUND".to_string())))
            .expect("gateway is waiting");
        assert!(run.await.is_err());

        let sent = cache.get::<Vec<u64>>(SENT);
        assert_eq!(sent.data(), Some(&vec![7, 8]));
        assert!(sent.is_success());
        assert!(!sent.is_stale);
    }

    #[tokio::test]
    async fn test_optimistic_update_kept_on_success() {
        let cache = seeded_cache();
        let coordinator =
            MutationCoordinator::new(cache.clone(), replying(Calls::default(), Ok(())), CancelOptimistically);

        assert_eq!(coordinator.run(7).await, Ok(()));

        let sent = cache.get::<Vec<u64>>(SENT);
        assert_eq!(sent.data(), Some(&vec![8]));
        assert!(sent.is_stale);
    }

    #[tokio::test]
    async fn test_newer_data_is_not_rolled_back() {
        let cache = seeded_cache();
        let (tx, gateway) = pending(Calls::default());
        let coordinator = MutationCoordinator::new(cache.clone(), gateway, CancelOptimistically);

        let mut run = pin!(coordinator.run(7));
        assert!(futures::poll!(run.as_mut()).is_pending());
        cache.set_data(SENT, vec![8_u64, 9]);

        tx.send(Err(GatewayError::Transport("NOT_FOUND".to_string())))
            .expect("gateway is waiting");
        assert!(run.await.is_err());
        assert_eq!(cache.get::<Vec<u64>>(SENT).data(), Some(&vec![8, 9]));
    }

    #[tokio::test]
    async fn test_dropped_run_releases_coordinator() {
        let cache = seeded_cache();
        let calls = Calls::default();
        let (_tx, gateway) = pending(calls.clone());
        let coordinator = MutationCoordinator::new(cache.clone(), gateway, CancelOptimistically);

        {
            let mut run = pin!(coordinator.run(7));
            assert!(futures::poll!(run.as_mut()).is_pending());
            assert!(coordinator.state().is_loading());
            assert_eq!(cache.get::<Vec<u64>>(SENT).data(), Some(&vec![8]));
        }

        assert!(coordinator.state().is_idle());

        // Whether the server cancelled the request is unknown: the optimistic
        // removal is undone and the list has to be refetched.
        let sent = cache.get::<Vec<u64>>(SENT);
        assert_eq!(sent.data(), Some(&vec![7, 8]));
        assert!(sent.is_success());
        assert!(sent.is_stale);

        // The scripted reply was consumed by the abandoned call.
        assert_eq!(
            coordinator.run(8).await,
            Err(QueryError::Transport("no reply scripted".to_string()))
        );
        assert_eq!(calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_run_keeps_newer_data() {
        let cache = seeded_cache();
        let (_tx, gateway) = pending(Calls::default());
        let coordinator = MutationCoordinator::new(cache.clone(), gateway, CancelOptimistically);

        {
            let mut run = pin!(coordinator.run(7));
            assert!(futures::poll!(run.as_mut()).is_pending());
            cache.set_data(SENT, vec![8_u64, 9]);
        }

        let sent = cache.get::<Vec<u64>>(SENT);
        assert_eq!(sent.data(), Some(&vec![8, 9]));
        assert!(sent.is_stale);
    }

    #[tokio::test]
    async fn test_rejected_run_touches_nothing_on_drop() {
        let cache = seeded_cache();
        let coordinator =
            MutationCoordinator::new(cache.clone(), replying(Calls::default(), Ok(())), CancelFriendRequest);

        assert!(coordinator.run(0).await.is_err());
        let sent = cache.get::<Vec<u64>>(SENT);
        assert_eq!(sent.data(), Some(&vec![7, 8]));
        assert!(!sent.is_stale);
    }

    #[tokio::test]
    async fn test_subscribe_sees_every_transition() {
        let coordinator =
            MutationCoordinator::new(seeded_cache(), replying(Calls::default(), Ok(())), CancelFriendRequest);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = coordinator.subscribe(move |state: &MutationState| sink.lock().push(state.status));

        coordinator.run(7).await.expect("gateway succeeds");
        coordinator.reset();

        assert_eq!(
            *seen.lock(),
            [
                MutationStatus::Idle,
                MutationStatus::Loading,
                MutationStatus::Success,
                MutationStatus::Idle
            ]
        );

        subscription.unsubscribe();
        coordinator.run(7).await.expect("gateway succeeds");
        assert_eq!(seen.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_watch_stream() {
        let not_found = GatewayError::Transport("NOT_FOUND".to_string());
        let coordinator =
            MutationCoordinator::new(seeded_cache(), replying(Calls::default(), Err(not_found)), CancelFriendRequest);
        let mut states = coordinator.watch();

        let _ = coordinator.run(7).await;

        assert_eq!(states.next().await.map(|s| s.status), Some(MutationStatus::Idle));
        assert_eq!(states.next().await.map(|s| s.status), Some(MutationStatus::Loading));
        let last = states.next().await.expect("error state");
        assert!(last.is_error());
        assert_eq!(last.error, Some(QueryError::Transport("NOT_FOUND".to_string())));
    }
}
