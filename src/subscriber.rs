//! Observer plumbing shared by the cache and the mutation coordinator.
//!
//! Listeners are plain callbacks. They are always invoked after the transition
//! they report has been committed and after every internal lock has been
//! released, so a listener may freely read from (or write to) the cache.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::mpsc;

pub(crate) type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Registered listeners, in registration order.
pub(crate) struct Listeners<T> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
}

impl<T> Listeners<T> {
    pub(crate) const fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, listener: Listener<T>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Listener<T>> {
        self.entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) fn notify<T>(listeners: &[Listener<T>], value: &T) {
    for listener in listeners {
        listener(value);
    }
}

/// Handle for an active subscription.
///
/// The listener stays registered until the handle is dropped or
/// [`unsubscribe`](Self::unsubscribe) is called.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(detach: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// Removes the listener.
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.detach.is_some())
            .finish()
    }
}

/// Turns a listener registration into a stream of every delivered value.
///
/// The registration lives as long as the stream.
pub(crate) fn stream_of<T>(
    subscribe: impl FnOnce(Listener<T>) -> Subscription,
) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = subscribe(Arc::new(move |value: &T| {
        // The receiver is gone only once the stream itself has been dropped.
        let _ = tx.send(value.clone());
    }));

    stream::unfold((rx, subscription), |(mut rx, subscription)| async move {
        rx.recv().await.map(|value| (value, (rx, subscription)))
    })
    .boxed()
}
