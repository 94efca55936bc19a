//! Per-transaction lock
//!
//! [`TxnLock`] is a reentrant, FIFO-fair mutual exclusion lock whose
//! acquisition can be abandoned through a [`CancellationToken`].
//!
//! # Semantics
//!
//! - The owning thread may re-acquire the lock; each acquisition must be
//!   matched by dropping its guard.
//! - Waiters are granted the lock in arrival order.
//! - A cancelled token fails the acquisition with `PoolError::Interrupted`
//!   and leaves the token cancelled. A thread that already owns the lock is
//!   granted the reentrant acquisition regardless of the token.

use crate::cancel::CancellationToken;
use parking_lot::{Condvar, Mutex};
use poolgate_core::{PoolError, PoolResult};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use std::time::Duration;

/// How often a blocked waiter re-checks its cancellation token
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    holds: usize,
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

/// Reentrant fair lock with cancellable acquisition
#[derive(Debug, Default)]
pub struct TxnLock {
    state: Mutex<LockState>,
    released: Condvar,
}

/// RAII guard; the lock is released when the guard is dropped
///
/// Guards are tied to the acquiring thread and cannot be sent elsewhere.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct TxnLockGuard<'a> {
    lock: &'a TxnLock,
    _not_send: PhantomData<*const ()>,
}

impl TxnLock {
    /// Create an unlocked lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, waiting until it is free
    pub fn lock(&self) -> TxnLockGuard<'_> {
        let never = CancellationToken::new();
        match self.lock_cancellable(&never) {
            Ok(guard) => guard,
            // A token nobody else holds is never cancelled.
            Err(_) => unreachable!("uncancellable lock acquisition failed"),
        }
    }

    /// Acquire the lock unless `cancel` fires first
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Interrupted` if the token is cancelled before the
    /// lock is granted. The token stays cancelled.
    pub fn lock_cancellable(&self, cancel: &CancellationToken) -> PoolResult<TxnLockGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owner == Some(me) {
            state.holds += 1;
            return Ok(self.guard());
        }

        if cancel.is_cancelled() {
            return Err(PoolError::Interrupted);
        }

        if state.owner.is_none() && state.waiters.is_empty() {
            state.owner = Some(me);
            state.holds = 1;
            return Ok(self.guard());
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);

        loop {
            if cancel.is_cancelled() {
                state.waiters.retain(|t| *t != ticket);
                // The next waiter may now be at the head.
                self.released.notify_all();
                return Err(PoolError::Interrupted);
            }

            if state.owner.is_none() && state.waiters.front() == Some(&ticket) {
                state.waiters.pop_front();
                state.owner = Some(me);
                state.holds = 1;
                return Ok(self.guard());
            }

            self.released.wait_for(&mut state, CANCEL_POLL_INTERVAL);
        }
    }

    /// Acquire the lock only if it is free or already owned by this thread
    pub fn try_lock(&self) -> Option<TxnLockGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owner {
            Some(owner) if owner == me => {
                state.holds += 1;
                Some(self.guard())
            }
            None if state.waiters.is_empty() => {
                state.owner = Some(me);
                state.holds = 1;
                Some(self.guard())
            }
            _ => None,
        }
    }

    /// True if the calling thread owns the lock
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Number of outstanding acquisitions by the owner (0 when unlocked)
    pub fn hold_count(&self) -> usize {
        self.state.lock().holds
    }

    /// Number of threads waiting for the lock
    pub fn queue_length(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn guard(&self) -> TxnLockGuard<'_> {
        TxnLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(thread::current().id()));
        state.holds = state.holds.saturating_sub(1);
        if state.holds == 0 {
            state.owner = None;
            self.released.notify_all();
        }
    }
}

impl Drop for TxnLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
