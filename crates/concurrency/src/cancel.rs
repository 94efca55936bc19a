//! Cooperative cancellation
//!
//! A [`CancellationToken`] is the request-level interrupt signal. Waiters
//! check it while blocked on a per-transaction lock; cancelling never clears
//! itself, so the caller still observes the signal after the failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag
///
/// Clones share state: cancelling any clone cancels all of them.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once [`cancel`](Self::cancel) has been called on any clone
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Clear the signal so the token can be reused for a new request
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}
