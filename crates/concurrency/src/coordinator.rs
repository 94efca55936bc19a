//! Transaction registry and in-process coordinator
//!
//! The dispatcher reaches transaction-scoped storage only through the
//! [`TransactionRegistry`] trait. [`LocalTransactionCoordinator`] is the
//! in-process implementation: transactions are associated with threads, and
//! each active transaction owns one [`TransactionScope`].
//!
//! Scope creation uses DashMap's entry API, so two threads racing on a
//! brand-new transaction always end up sharing one scope and one lock.

use crate::scope::TransactionScope;
use dashmap::DashMap;
use poolgate_core::{PoolError, PoolResult, ResourceHandle, TransactionId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::debug;

/// Access to transaction-scoped storage
pub trait TransactionRegistry: Send + Sync {
    /// Transaction associated with the calling thread, if one is active
    fn current_transaction(&self) -> Option<TransactionId>;

    /// True if `id` has begun and not completed
    fn is_active(&self, id: TransactionId) -> bool;

    /// Scope of transaction `id`, regardless of thread association
    ///
    /// Created on first use; every later call for the same transaction
    /// returns the same instance. Returns `None` once the transaction is no
    /// longer active.
    fn scope_for(&self, id: TransactionId) -> Option<Arc<TransactionScope>>;

    /// Scope of the calling thread's active transaction
    fn scope(&self) -> Option<Arc<TransactionScope>> {
        self.scope_for(self.current_transaction()?)
    }
}

/// Transaction counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorMetrics {
    /// Transactions currently active
    pub active_count: u64,
    /// Transactions begun since creation
    pub total_started: u64,
    /// Transactions ended since creation
    pub total_ended: u64,
}

/// Thread-associated transactions with lazily created scopes
///
/// The metric counters use Relaxed ordering; they are observational only.
#[derive(Debug, Default)]
pub struct LocalTransactionCoordinator {
    active: DashMap<TransactionId, ()>,
    associations: DashMap<ThreadId, TransactionId>,
    scopes: DashMap<TransactionId, Arc<TransactionScope>>,
    total_started: AtomicU64,
    total_ended: AtomicU64,
}

impl LocalTransactionCoordinator {
    /// Create a coordinator with no transactions
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a transaction and associate it with the calling thread
    ///
    /// Any transaction previously associated with the thread is suspended,
    /// not ended.
    pub fn begin(&self) -> TransactionId {
        let id = TransactionId::new();
        self.active.insert(id, ());
        self.associations.insert(thread::current().id(), id);
        self.total_started.fetch_add(1, Ordering::Relaxed);
        debug!(target: "poolgate::txn", transaction = %id, "Transaction started");
        id
    }

    /// Associate an active transaction with the calling thread
    ///
    /// # Errors
    ///
    /// Fails with `InvalidContext` if the transaction is not active.
    pub fn resume(&self, id: TransactionId) -> PoolResult<()> {
        if !self.active.contains_key(&id) {
            return Err(PoolError::InvalidContext(format!(
                "transaction {} is not active",
                id
            )));
        }
        self.associations.insert(thread::current().id(), id);
        Ok(())
    }

    /// Detach the calling thread from its transaction
    pub fn suspend(&self) -> Option<TransactionId> {
        self.associations
            .remove(&thread::current().id())
            .map(|(_, id)| id)
    }

    /// Complete a transaction
    ///
    /// Closes its scope and returns the handles bound to it so the owner can
    /// release them. Every thread association with the transaction is
    /// dropped.
    pub fn end(&self, id: TransactionId) -> Vec<Arc<ResourceHandle>> {
        if self.active.remove(&id).is_none() {
            return Vec::new();
        }
        self.associations.retain(|_, txn| *txn != id);
        self.total_ended.fetch_add(1, Ordering::Relaxed);

        let handles = self
            .scopes
            .remove(&id)
            .map(|(_, scope)| scope.close())
            .unwrap_or_default();

        debug!(
            target: "poolgate::txn",
            transaction = %id,
            bound_handles = handles.len(),
            "Transaction ended"
        );
        handles
    }

    /// True if the transaction has begun and not ended
    pub fn is_active(&self, id: TransactionId) -> bool {
        self.active.contains_key(&id)
    }

    /// Snapshot of the transaction counters
    pub fn metrics(&self) -> CoordinatorMetrics {
        CoordinatorMetrics {
            active_count: self.active.len() as u64,
            total_started: self.total_started.load(Ordering::Relaxed),
            total_ended: self.total_ended.load(Ordering::Relaxed),
        }
    }

    /// Scope for `id` without going through the thread association
    pub fn scope_for(&self, id: TransactionId) -> Option<Arc<TransactionScope>> {
        if !self.active.contains_key(&id) {
            return None;
        }

        let scope = self
            .scopes
            .entry(id)
            .or_insert_with(|| Arc::new(TransactionScope::new(id)))
            .clone();

        // Lost a race with end(): don't leave an orphan behind.
        if !self.active.contains_key(&id) {
            self.scopes.remove(&id);
            scope.close();
            return None;
        }
        Some(scope)
    }
}

impl TransactionRegistry for LocalTransactionCoordinator {
    fn current_transaction(&self) -> Option<TransactionId> {
        let id = *self.associations.get(&thread::current().id())?;
        self.active.contains_key(&id).then_some(id)
    }

    fn is_active(&self, id: TransactionId) -> bool {
        LocalTransactionCoordinator::is_active(self, id)
    }

    fn scope_for(&self, id: TransactionId) -> Option<Arc<TransactionScope>> {
        LocalTransactionCoordinator::scope_for(self, id)
    }
}
