use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::QueryError;

/// Receives the error a mutation wants to surface to the user.
///
/// The coordinator clears the sink before each dispatch and reports to it when
/// a run fails.
pub trait ErrorSink: Send + Sync {
    /// Removes any error currently on display.
    fn clear(&self);

    /// Displays `error`.
    fn report(&self, error: &QueryError);
}

/// An [`ErrorSink`] that keeps the latest error message.
///
/// Clones share the same slot, so one clone can be handed to a coordinator while
/// another is read by the view.
#[derive(Debug, Clone, Default)]
pub struct ErrorSlot {
    message: Arc<Mutex<Option<String>>>,
}

impl ErrorSlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The message on display, if any.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        self.message.lock().clone()
    }
}

impl ErrorSink for ErrorSlot {
    fn clear(&self) {
        *self.message.lock() = None;
    }

    fn report(&self, error: &QueryError) {
        *self.message.lock() = Some(error.message());
    }
}
