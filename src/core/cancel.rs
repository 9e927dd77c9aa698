use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const ACTIVE: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared completion flag for a relayed response stream.
///
/// The producer marks the stream completed when it reaches a terminal state;
/// the body wrapper cancels it when dropped. Whichever happens first wins, so
/// a cancellation after normal completion is a no-op.
#[derive(Clone)]
pub struct StreamCancelHandle {
    state: Arc<AtomicU8>,
}

impl StreamCancelHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ACTIVE)),
        }
    }

    /// Mark the stream as finished by the producer (DONE or ERROR).
    pub fn mark_completed(&self) {
        let _ = self
            .state
            .compare_exchange(ACTIVE, COMPLETED, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == COMPLETED
    }

    /// Cancel an active stream. Returns `true` only for the call that actually
    /// moved the stream from active to cancelled.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(ACTIVE, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }
}

impl Default for StreamCancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
