//! Transaction-scoped storage
//!
//! A [`TransactionScope`] lives exactly as long as its transaction. It holds
//! the per-transaction lock and the affinity cache mapping each sub-pool to
//! the one handle the transaction has bound to it.
//!
//! The scope is created together with its lock, so every participant of a
//! transaction sees the same lock instance. Cache reads and writes are
//! expected to happen under that lock.

use crate::lock::TxnLock;
use parking_lot::Mutex;
use poolgate_core::{PoolError, PoolResult, ResourceHandle, SubPoolId, TransactionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-transaction lock and affinity cache
#[derive(Debug)]
pub struct TransactionScope {
    transaction: TransactionId,
    lock: TxnLock,
    bindings: Mutex<HashMap<SubPoolId, Arc<ResourceHandle>>>,
    closed: AtomicBool,
}

impl TransactionScope {
    /// Create an empty scope for `transaction`
    pub fn new(transaction: TransactionId) -> Self {
        Self {
            transaction,
            lock: TxnLock::new(),
            bindings: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The owning transaction
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    /// The per-transaction lock
    pub fn lock(&self) -> &TxnLock {
        &self.lock
    }

    /// Handle bound to `pool`, if any
    ///
    /// # Errors
    ///
    /// Fails with `HandleLookupFailed` once the transaction has completed.
    pub fn get_resource(&self, pool: SubPoolId) -> PoolResult<Option<Arc<ResourceHandle>>> {
        self.ensure_open()?;
        Ok(self.bindings.lock().get(&pool).cloned())
    }

    /// Bind `handle` to `pool` for the rest of the transaction
    ///
    /// # Errors
    ///
    /// Fails with `HandleLookupFailed` once the transaction has completed.
    pub fn put_resource(&self, pool: SubPoolId, handle: Arc<ResourceHandle>) -> PoolResult<()> {
        self.ensure_open()?;
        self.bindings.lock().insert(pool, handle);
        Ok(())
    }

    /// Drop the binding for `pool`, returning the handle it held
    pub fn remove_resource(&self, pool: SubPoolId) -> Option<Arc<ResourceHandle>> {
        self.bindings.lock().remove(&pool)
    }

    /// Number of sub-pools with a bound handle
    pub fn binding_count(&self) -> usize {
        self.bindings.lock().len()
    }

    /// True once the transaction has completed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the scope and hand back every bound handle
    ///
    /// Called by the transaction coordinator on completion. The handles'
    /// tracked-by-transaction flags are left for the releasing owner to clear.
    pub fn close(&self) -> Vec<Arc<ResourceHandle>> {
        self.closed.store(true, Ordering::Release);
        self.bindings.lock().drain().map(|(_, h)| h).collect()
    }

    fn ensure_open(&self) -> PoolResult<()> {
        if self.is_closed() {
            return Err(PoolError::handle_lookup(format!(
                "transaction {} has completed",
                self.transaction
            )));
        }
        Ok(())
    }
}
