//! Transaction affinity
//!
//! Within one transaction, repeated requests for the same sub-pool must see
//! the same resource handle. The binding lives in the transaction's
//! [`TransactionScope`] and is read and written only under the scope's lock.
//!
//! ## Protocol
//!
//! ```text
//! lookup:  lock → read binding → unlock
//! create:  acquire from sub-pool (no lock held)
//!          → lazy enlistment? return handle unbound
//!          → lock → re-read binding
//!              winner present: return own handle (not killed), adopt winner
//!              otherwise:      mark tracked, store binding
//!          → unlock
//! ```
//!
//! Any handle acquired by a creation that then fails is killed before the
//! error is returned.
//!
//! A binding whose handle no longer records this transaction was released
//! behind the cache's back. It is dropped on the next read and never handed
//! out again.

use poolgate_concurrency::{CancellationToken, TransactionRegistry, TransactionScope};
use poolgate_core::{
    PoolError, PoolResult, RequestParams, ResourceHandle, SecurityContext, SubPool,
    TransactionId,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Affinity operations for one request
pub(crate) struct TransactionAffinity<'a> {
    registry: &'a dyn TransactionRegistry,
    cancel: &'a CancellationToken,
    transaction: TransactionId,
}

impl<'a> TransactionAffinity<'a> {
    pub(crate) fn new(
        registry: &'a dyn TransactionRegistry,
        cancel: &'a CancellationToken,
        transaction: TransactionId,
    ) -> Self {
        Self {
            registry,
            cancel,
            transaction,
        }
    }

    fn scope(&self) -> PoolResult<Arc<TransactionScope>> {
        self.registry.scope_for(self.transaction).ok_or_else(|| {
            PoolError::lock_unavailable(format!("transaction {} is not active", self.transaction))
        })
    }

    /// Binding for `pool`, dropping it if its handle was released meanwhile
    ///
    /// Must be called with the scope's lock held.
    fn live_binding(
        &self,
        scope: &TransactionScope,
        pool: &Arc<dyn SubPool>,
    ) -> PoolResult<Option<Arc<ResourceHandle>>> {
        match scope.get_resource(pool.id())? {
            Some(handle) if handle.bound_transaction() != Some(scope.transaction()) => {
                scope.remove_resource(pool.id());
                trace!(
                    target: "poolgate::affinity",
                    handle = %handle,
                    transaction = %self.transaction,
                    "Dropping stale binding"
                );
                Ok(None)
            }
            found => Ok(found),
        }
    }

    /// Handle already bound to `pool` by the current transaction
    pub(crate) fn cached_handle(
        &self,
        pool: &Arc<dyn SubPool>,
    ) -> PoolResult<Option<Arc<ResourceHandle>>> {
        let scope = self.scope()?;
        let _guard = scope.lock().lock_cancellable(self.cancel)?;

        let cached = self.live_binding(&scope, pool)?;
        if let Some(handle) = &cached {
            trace!(
                target: "poolgate::affinity",
                handle = %handle,
                transaction = %self.transaction,
                "Previous handle tracked by transaction"
            );
        }
        Ok(cached)
    }

    /// Acquire a handle from `pool` and bind it to the current transaction
    ///
    /// `release` returns a handle to its sub-pool; it is used to discard the
    /// loser of a race and to kill the handle on failure.
    pub(crate) fn bind_new_handle<R>(
        &self,
        pool: &Arc<dyn SubPool>,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
        lazy_enlistment: bool,
        release: R,
    ) -> PoolResult<Arc<ResourceHandle>>
    where
        R: Fn(&Arc<ResourceHandle>, bool),
    {
        // Outside the transaction lock: acquire can block for a long time.
        let handle = pool.acquire(security, params)?;
        trace!(
            target: "poolgate::affinity",
            handle = %handle,
            transaction = %self.transaction,
            "Got handle from sub-pool for transaction"
        );

        if lazy_enlistment && handle.supports_lazy_enlistment() {
            trace!(
                target: "poolgate::affinity",
                handle = %handle,
                "Lazy enlistment handle, not bound to transaction"
            );
            return Ok(handle);
        }

        let kill = |reason: &PoolError| {
            trace!(
                target: "poolgate::affinity",
                handle = %handle,
                error = %reason,
                "Killing handle tracked by transaction"
            );
            release(&handle, true);
        };

        let scope = match self.scope() {
            Ok(scope) => scope,
            Err(e) => {
                kill(&e);
                return Err(e);
            }
        };

        let _guard = match scope.lock().lock_cancellable(self.cancel) {
            Ok(guard) => guard,
            Err(e) => {
                kill(&e);
                return Err(e);
            }
        };

        match self.live_binding(&scope, pool) {
            Ok(Some(winner)) => {
                release(&handle, false);
                debug!(
                    target: "poolgate::affinity",
                    winner = %winner,
                    discarded = %handle,
                    "Another thread already bound a handle for this transaction"
                );
                Ok(winner)
            }
            Ok(None) => {
                handle.bind_to_transaction(scope.transaction());
                match scope.put_resource(pool.id(), Arc::clone(&handle)) {
                    Ok(()) => {
                        trace!(
                            target: "poolgate::affinity",
                            handle = %handle,
                            transaction = %self.transaction,
                            "Using handle tracked by transaction"
                        );
                        Ok(handle)
                    }
                    Err(e) => {
                        kill(&e);
                        Err(e)
                    }
                }
            }
            Err(e) => {
                kill(&e);
                Err(e)
            }
        }
    }

    /// True if the current transaction has a handle bound to `pool`
    ///
    /// Never fails; any problem is reported as `false`.
    pub(crate) fn has_binding(&self, pool: &Arc<dyn SubPool>) -> bool {
        let Ok(scope) = self.scope() else {
            return false;
        };
        let Ok(_guard) = scope.lock().lock_cancellable(self.cancel) else {
            return false;
        };
        match self.live_binding(&scope, pool) {
            Ok(found) => found.is_some(),
            Err(e) => {
                debug!(target: "poolgate::affinity", error = %e, "has_connection error");
                false
            }
        }
    }
}
