//! Pool dispatcher
//!
//! [`PoolDispatcher`] is the façade the connection manager talks to. It
//! routes each request to the sub-pool for the request's partition key,
//! pins handles to transactions, and runs the lifecycle and flush
//! operations across every sub-pool.
//!
//! ## Lifecycle
//!
//! ```text
//! ACTIVE ──shutdown()──────────▶ TERMINATED (table cleared)
//!   │                                 │
//!   └──prepare_shutdown()──▶ DRAINING │ (graceful flush, table kept)
//!                               │     │
//!   ◀────────cancel_shutdown()──┴─────┘
//! ```
//!
//! DRAINING and TERMINATED share one flag: both reject new requests.
//!
//! ## Maintenance
//!
//! `shutdown`, `flush_mode` and `empty_sub_pool` are serialized by a
//! reentrant lock, so a sub-pool may call back into `empty_sub_pool` from
//! inside a flush. Request paths never take it.

mod builder;

pub use builder::DispatcherBuilder;

use crate::affinity::TransactionAffinity;
use crate::config::{Capacity, PoolConfig};
use crate::key::KeyStrategy;
use crate::statistics::PoolStatistics;
use crate::table::PartitionTable;
use crate::traits::{ConnectionManager, SubPoolFactory};
use parking_lot::{ReentrantMutex, RwLock};
use poolgate_concurrency::CancellationToken;
use poolgate_core::{
    ConnectionId, FlushMode, PoolError, PoolOwner, PoolResult, RequestParams, ResourceFactory,
    ResourceHandle, ResourceId, SecurityContext, SubPool, TransactionId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Routes requests to keyed sub-pools
pub struct PoolDispatcher {
    config: PoolConfig,
    strategy: Arc<dyn KeyStrategy>,
    resources: Arc<dyn ResourceFactory>,
    factory: Arc<dyn SubPoolFactory>,
    manager: RwLock<Option<Arc<dyn ConnectionManager>>>,
    table: PartitionTable,
    shutdown: AtomicBool,
    interleaving: AtomicBool,
    capacity: RwLock<Capacity>,
    maintenance: ReentrantMutex<()>,
    self_ref: Weak<PoolDispatcher>,
}

impl PoolDispatcher {
    /// Start configuring a dispatcher
    pub fn builder(config: PoolConfig) -> DispatcherBuilder {
        DispatcherBuilder::new(config)
    }

    pub(crate) fn assemble(
        config: PoolConfig,
        strategy: Arc<dyn KeyStrategy>,
        resources: Arc<dyn ResourceFactory>,
        factory: Arc<dyn SubPoolFactory>,
        manager: Option<Arc<dyn ConnectionManager>>,
    ) -> Arc<Self> {
        debug!(target: "poolgate::pool", pool = %config.name, strategy = ?config.strategy, "Creating pool");
        Arc::new_cyclic(|self_ref| Self {
            interleaving: AtomicBool::new(config.interleaving),
            capacity: RwLock::new(config.capacity),
            config,
            strategy,
            resources,
            factory,
            manager: RwLock::new(manager),
            table: PartitionTable::new(),
            shutdown: AtomicBool::new(false),
            maintenance: ReentrantMutex::new(()),
            self_ref: self_ref.clone(),
        })
    }

    // ========================================================================
    // Routing
    // ========================================================================

    fn connection_manager(&self) -> Option<Arc<dyn ConnectionManager>> {
        self.manager.read().clone()
    }

    /// True when transactional traffic gets its own partitions
    fn separate_no_tx(&self, manager: Option<&Arc<dyn ConnectionManager>>) -> bool {
        self.config.no_tx_separate_pools && manager.map_or(false, |m| m.is_transactional())
    }

    fn terminated(&self) -> PoolError {
        PoolError::terminated(self.config.name.clone())
    }

    /// Sub-pool for a request, created on first use
    fn resolve(
        &self,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
    ) -> PoolResult<Arc<dyn SubPool>> {
        let manager = self.connection_manager();
        let key =
            self.strategy
                .derive_key(security, params, self.separate_no_tx(manager.as_ref()))?;

        let owner: Weak<dyn PoolOwner> = self.self_ref.clone();
        let resolved = self
            .table
            .resolve_or_create(key.clone(), || {
                self.factory.create(
                    Arc::clone(&self.resources),
                    manager.clone(),
                    security,
                    params,
                    &self.config,
                    owner,
                )
            })
            .map_err(PoolError::resolution)?;

        if resolved.created {
            debug!(
                target: "poolgate::pool",
                pool = %self.config.name,
                key = %key,
                sub_pool = %resolved.pool.id(),
                "Created sub-pool"
            );

            // Warm the transaction scope; failure is deferred to first real use.
            if let Some(registry) = manager.and_then(|m| m.transaction_registry()) {
                if registry.scope().is_none() {
                    trace!(target: "poolgate::pool", key = %key, "No transaction scope yet");
                }
            }

            if self.config.prefill {
                if let Err(e) = resolved.pool.prefill() {
                    warn!(
                        target: "poolgate::pool",
                        pool = %self.config.name,
                        sub_pool = %resolved.pool.id(),
                        error = %e,
                        "Prefill of new sub-pool failed"
                    );
                }
            }
        }

        Ok(resolved.pool)
    }

    /// Check out a resource handle
    ///
    /// With `transaction` naming an active transaction, repeated calls for
    /// the same partition return the same handle. The binding is made in
    /// that transaction's scope, whichever transaction the calling thread is
    /// associated with.
    ///
    /// # Errors
    ///
    /// - `PoolTerminated` after `shutdown` or `prepare_shutdown`
    /// - `SubPoolResolutionFailed` if the sub-pool could not be created
    /// - `LockUnavailable` / `HandleLookupFailed` from the affinity cache
    /// - whatever the sub-pool's acquire returns
    pub fn acquire(
        &self,
        transaction: Option<TransactionId>,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
    ) -> PoolResult<Arc<ResourceHandle>> {
        self.acquire_cancellable(transaction, security, params, &CancellationToken::new())
    }

    /// [`acquire`](Self::acquire) that gives up when `cancel` fires
    ///
    /// Cancellation is observed while waiting for the per-transaction lock.
    /// The call then fails with `Interrupted`, any handle it had already
    /// obtained is killed, and `cancel` is left cancelled.
    pub fn acquire_cancellable(
        &self,
        transaction: Option<TransactionId>,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
        cancel: &CancellationToken,
    ) -> PoolResult<Arc<ResourceHandle>> {
        if self.is_shutdown() {
            return Err(self.terminated());
        }

        let pool = self.resolve(security, params)?;

        let manager = self.connection_manager();
        let bound = transaction.zip(manager.as_ref().and_then(|m| m.transaction_registry()));
        let Some((transaction, registry)) = bound.filter(|(id, r)| r.is_active(*id)) else {
            return pool.acquire(security, params);
        };

        let affinity = TransactionAffinity::new(registry.as_ref(), cancel, transaction);
        if let Some(handle) = affinity.cached_handle(&pool)? {
            return Ok(handle);
        }

        let lazy = manager.map_or(false, |m| !m.is_enlistment_eager());
        affinity.bind_new_handle(&pool, security, params, lazy, |handle, kill| {
            self.release_quietly(handle, kill)
        })
    }

    /// Return a handle to the sub-pool that issued it
    ///
    /// Clears the tracked-by-transaction flag and drops the handle from its
    /// transaction's affinity cache, so a later acquire in that transaction
    /// gets a fresh handle. With `kill` the physical resource is destroyed.
    pub fn release(&self, handle: &Arc<ResourceHandle>, kill: bool) -> PoolResult<()> {
        if let Some(transaction) = handle.unbind_transaction() {
            self.forget_binding(transaction, handle);
        }
        handle.origin().release(handle, kill)
    }

    fn forget_binding(&self, transaction: TransactionId, handle: &Arc<ResourceHandle>) {
        let Some(scope) = self
            .connection_manager()
            .and_then(|m| m.transaction_registry())
            .and_then(|r| r.scope_for(transaction))
        else {
            return;
        };

        let pool = handle.origin().id();
        let _guard = scope.lock().lock();
        if let Ok(Some(bound)) = scope.get_resource(pool) {
            if Arc::ptr_eq(&bound, handle) {
                scope.remove_resource(pool);
                trace!(
                    target: "poolgate::pool",
                    handle = %handle,
                    transaction = %transaction,
                    "Released handle removed from transaction"
                );
            }
        }
    }

    fn release_quietly(&self, handle: &Arc<ResourceHandle>, kill: bool) {
        if let Err(e) = self.release(handle, kill) {
            trace!(
                target: "poolgate::pool",
                handle = %handle,
                kill,
                error = %e,
                "Ignoring release failure"
            );
        }
    }

    /// Whether one acquire/release cycle succeeds for the given partition
    ///
    /// Never fails and never touches transaction affinity. Returns `false`
    /// when the pool is shut down or the sub-pool is full.
    pub fn probe_availability(
        &self,
        params: Option<&RequestParams>,
        security: Option<&SecurityContext>,
    ) -> bool {
        debug!(
            target: "poolgate::pool",
            pool = %self.config.name,
            statistics = ?self.statistics(),
            "Probing availability"
        );
        if self.is_shutdown() {
            return false;
        }

        let pool = match self.resolve(security, params) {
            Ok(pool) => pool,
            Err(e) => {
                trace!(target: "poolgate::pool", error = %e, "Probe could not resolve sub-pool");
                return false;
            }
        };
        if pool.is_full() {
            return false;
        }

        match pool.acquire(security, params) {
            Ok(handle) => {
                self.release_quietly(&handle, false);
                true
            }
            Err(e) => {
                trace!(target: "poolgate::pool", error = %e, "Probe acquire failed");
                false
            }
        }
    }

    /// Probe the default partition
    pub fn test_connection(&self) -> bool {
        self.probe_availability(None, None)
    }

    /// Probe the partition for `params` and `security`
    pub fn test_connection_with(
        &self,
        params: Option<&RequestParams>,
        security: Option<&SecurityContext>,
    ) -> bool {
        self.probe_availability(params, security)
    }

    /// Whether the current transaction already holds a handle for this partition
    ///
    /// Best-effort: any failure, including the absence of a transaction,
    /// answers `false`.
    pub fn has_connection(
        &self,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
    ) -> bool {
        if self.is_shutdown() {
            return false;
        }
        let Some(registry) = self
            .connection_manager()
            .and_then(|m| m.transaction_registry())
        else {
            return false;
        };
        let Some(transaction) = registry.current_transaction() else {
            return false;
        };

        let pool = match self.resolve(security, params) {
            Ok(pool) => pool,
            Err(e) => {
                debug!(target: "poolgate::pool", error = %e, "has_connection error");
                return false;
            }
        };
        let cancel = CancellationToken::new();
        TransactionAffinity::new(registry.as_ref(), &cancel, transaction).has_binding(&pool)
    }

    /// Checked-out handle wrapping `resource`, searching every sub-pool
    pub fn find_handle(&self, resource: ResourceId) -> Option<Arc<ResourceHandle>> {
        self.find_handle_with(resource, None)
    }

    /// Like [`find_handle`](Self::find_handle), also requiring `connection`
    /// to be attached when given
    pub fn find_handle_with(
        &self,
        resource: ResourceId,
        connection: Option<ConnectionId>,
    ) -> Option<Arc<ResourceHandle>> {
        self.table
            .snapshot()
            .into_iter()
            .find_map(|pool| pool.find_handle(resource, connection))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Reject new requests and shut every sub-pool down
    ///
    /// Sub-pool failures are logged and do not stop the loop. The partition
    /// table is empty afterwards.
    pub fn shutdown(&self) {
        let _maintenance = self.maintenance.lock();
        debug!(target: "poolgate::pool", pool = %self.config.name, "shutdown");

        self.shutdown.store(true, Ordering::Release);
        for pool in self.table.drain() {
            if let Err(e) = pool.shutdown() {
                trace!(
                    target: "poolgate::pool",
                    sub_pool = %pool.id(),
                    error = %e,
                    "Sub-pool shutdown failed"
                );
            }
        }
    }

    /// Reject new requests and gracefully flush every sub-pool
    ///
    /// Handles already checked out can still be released.
    pub fn prepare_shutdown(&self) {
        debug!(target: "poolgate::pool", pool = %self.config.name, "prepare_shutdown");
        self.shutdown.store(true, Ordering::Release);
        self.flush_mode(FlushMode::Graceful);
    }

    /// Reopen the pool after `shutdown` or `prepare_shutdown`
    ///
    /// Returns `false` if the pool was not shut down. In prefill mode the
    /// remaining sub-pools are prefilled again.
    pub fn cancel_shutdown(&self) -> bool {
        if self
            .shutdown
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        debug!(target: "poolgate::pool", pool = %self.config.name, "cancel_shutdown");

        if self.is_prefill() {
            for pool in self.table.snapshot() {
                if let Err(e) = pool.prefill() {
                    trace!(
                        target: "poolgate::pool",
                        sub_pool = %pool.id(),
                        error = %e,
                        "Prefill failed"
                    );
                }
            }
        }
        true
    }

    /// Whether new requests are rejected
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// True if no sub-pool has a resource checked out
    pub fn is_idle(&self) -> bool {
        self.table.snapshot().iter().all(|pool| pool.is_idle())
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Reclaim idle resources
    pub fn flush(&self) {
        self.flush_mode(FlushMode::Idle);
    }

    /// Reclaim idle resources, or everything with `kill`
    pub fn flush_kill(&self, kill: bool) {
        self.flush_mode(if kill { FlushMode::All } else { FlushMode::Idle });
    }

    /// Flush every sub-pool and reclaim the ones left empty
    ///
    /// A sub-pool is reclaimed only outside prefill mode, when more than one
    /// sub-pool existed at the start of the flush, and if it is still empty
    /// at removal time. The last sub-pool is never removed.
    pub fn flush_mode(&self, mode: FlushMode) {
        let _maintenance = self.maintenance.lock();
        debug!(target: "poolgate::pool", pool = %self.config.name, mode = %mode, "flush");

        let pools = self.table.snapshot();
        let size = pools.len();
        let mut reclaim = Vec::new();

        for pool in pools {
            if let Err(e) = pool.flush(mode) {
                trace!(
                    target: "poolgate::pool",
                    sub_pool = %pool.id(),
                    error = %e,
                    "Sub-pool flush failed"
                );
            }
            if pool.is_empty() && !self.is_prefill() && size > 1 {
                reclaim.push(pool);
            }
        }

        for pool in reclaim {
            self.reclaim(&pool);
        }
    }

    fn reclaim(&self, pool: &Arc<dyn SubPool>) {
        if !self.table.remove_if_empty(pool) {
            return;
        }
        if let Err(e) = pool.shutdown() {
            trace!(
                target: "poolgate::pool",
                sub_pool = %pool.id(),
                error = %e,
                "Sub-pool shutdown failed"
            );
        }
        debug!(
            target: "poolgate::pool",
            pool = %self.config.name,
            sub_pool = %pool.id(),
            remaining = self.table.len(),
            "Removed empty sub-pool"
        );
    }

    // ========================================================================
    // Diagnostics & accessors
    // ========================================================================

    /// Names of threads waiting on any sub-pool
    pub fn dump_queued_threads(&self) -> Vec<String> {
        self.table
            .snapshot()
            .iter()
            .flat_map(|pool| pool.dump_queued_threads())
            .collect()
    }

    /// Counters summed over every sub-pool
    pub fn statistics(&self) -> PoolStatistics {
        let mut stats =
            PoolStatistics::new(&self.config.name, self.config.max_size, self.is_shutdown());
        for pool in self.table.snapshot() {
            stats.add(&pool.statistics());
        }
        stats
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Configuration the pool was built with
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether sub-pools are pre-populated
    pub fn is_prefill(&self) -> bool {
        self.config.prefill
    }

    /// Whether connections are sharable
    pub fn is_sharable(&self) -> bool {
        self.config.sharable
    }

    /// Whether interleaving is enabled
    pub fn is_interleaving(&self) -> bool {
        self.interleaving.load(Ordering::Acquire)
    }

    /// Enable or disable interleaving
    pub fn set_interleaving(&self, interleaving: bool) {
        self.interleaving.store(interleaving, Ordering::Release);
    }

    /// Current growth / shrink policy
    pub fn capacity(&self) -> Capacity {
        *self.capacity.read()
    }

    /// Replace the growth / shrink policy
    pub fn set_capacity(&self, capacity: Capacity) {
        *self.capacity.write() = capacity;
    }

    /// Replace the owning connection manager
    pub fn set_connection_manager(&self, manager: Option<Arc<dyn ConnectionManager>>) {
        *self.manager.write() = manager;
    }

    /// Number of live sub-pools
    pub fn sub_pool_count(&self) -> usize {
        self.table.len()
    }
}

impl PoolOwner for PoolDispatcher {
    fn empty_sub_pool(&self, pool: &Arc<dyn SubPool>) {
        let _maintenance = self.maintenance.lock();
        debug!(
            target: "poolgate::pool",
            pool = %self.config.name,
            sub_pool = %pool.id(),
            "empty_sub_pool"
        );
        self.reclaim(pool);
    }
}

impl Drop for PoolDispatcher {
    fn drop(&mut self) {
        if !self.table.is_empty() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CountingResources;
    use poolgate_core::PartitionKey;

    fn dispatcher(config: PoolConfig) -> (Arc<PoolDispatcher>, Arc<CountingResources>) {
        let resources = Arc::new(CountingResources::default());
        let pool = PoolDispatcher::builder(config)
            .resource_factory(resources.clone())
            .build()
            .unwrap();
        (pool, resources)
    }

    fn by_db() -> Arc<dyn KeyStrategy> {
        Arc::new(
            |_: Option<&SecurityContext>,
             params: Option<&RequestParams>,
             tx: bool|
             -> PoolResult<PartitionKey> {
                let db = params.and_then(|p| p.get("db")).unwrap_or("none");
                Ok(PartitionKey::custom(db, tx))
            },
        )
    }

    fn db(name: &str) -> RequestParams {
        RequestParams::new().with("db", name)
    }

    #[test]
    fn test_build_requires_resource_factory() {
        let err = PoolDispatcher::builder(PoolConfig::default())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let err = PoolDispatcher::builder(PoolConfig {
            max_size: 0,
            ..PoolConfig::default()
        })
        .resource_factory(Arc::new(CountingResources::default()))
        .build()
        .err()
        .unwrap();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[test]
    fn test_acquire_release_round_trip() {
        let (pool, resources) = dispatcher(PoolConfig::default());
        let handle = pool.acquire(None, None, None).unwrap();
        assert!(!pool.is_idle());
        assert_eq!(pool.sub_pool_count(), 1);

        pool.release(&handle, false).unwrap();
        assert!(pool.is_idle());
        assert_eq!(resources.created(), 1);
    }

    #[test]
    fn test_release_clears_tracked_flag() {
        let (pool, _) = dispatcher(PoolConfig::default());
        let handle = pool.acquire(None, None, None).unwrap();
        handle.bind_to_transaction(TransactionId::new());
        pool.release(&handle, false).unwrap();
        assert!(!handle.is_tracked_by_tx());
    }

    #[test]
    fn test_custom_strategy_partitions() {
        let resources = Arc::new(CountingResources::default());
        let pool = PoolDispatcher::builder(PoolConfig::default())
            .resource_factory(resources)
            .strategy(by_db())
            .build()
            .unwrap();

        let a = pool.acquire(None, None, Some(&db("a"))).unwrap();
        let b = pool.acquire(None, None, Some(&db("b"))).unwrap();
        assert_ne!(a.origin().id(), b.origin().id());
        assert_eq!(pool.sub_pool_count(), 2);
    }

    #[test]
    fn test_invalid_context_surfaces() {
        let (pool, _) = dispatcher(PoolConfig {
            strategy: crate::config::StrategyKind::BySecurityContext,
            ..PoolConfig::default()
        });
        let blank = SecurityContext::new("");
        assert!(matches!(
            pool.acquire(None, Some(&blank), None),
            Err(PoolError::InvalidContext(_))
        ));
        assert_eq!(pool.sub_pool_count(), 0);
    }

    #[test]
    fn test_prefill_runs_on_new_sub_pool() {
        let (pool, resources) = dispatcher(PoolConfig {
            min_size: 2,
            prefill: true,
            ..PoolConfig::default()
        });
        let handle = pool.acquire(None, None, None).unwrap();
        assert_eq!(resources.created(), 2);
        pool.release(&handle, false).unwrap();
        assert_eq!(pool.statistics().available, 2);
    }

    #[test]
    fn test_flush_kill_invalidates_in_use() {
        let (pool, resources) = dispatcher(PoolConfig::default());
        let handle = pool.acquire(None, None, None).unwrap();

        pool.flush_kill(false);
        assert_eq!(resources.destroyed(), 0);

        pool.flush_kill(true);
        assert_eq!(resources.destroyed(), 1);
        pool.release(&handle, false).unwrap();
        assert_eq!(resources.destroyed(), 1);
        // Sole sub-pool survives even though it is empty.
        assert_eq!(pool.sub_pool_count(), 1);
    }

    #[test]
    fn test_shutdown_is_terminal_until_cancelled() {
        let (pool, _) = dispatcher(PoolConfig::named("orders"));
        pool.acquire(None, None, None)
            .and_then(|h| pool.release(&h, false))
            .unwrap();

        pool.shutdown();
        assert!(pool.is_shutdown());
        assert_eq!(pool.sub_pool_count(), 0);
        let err = pool.acquire(None, None, None).unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(err.to_string(), "pool 'orders' is shut down");

        assert!(pool.cancel_shutdown());
        assert!(!pool.cancel_shutdown());
        assert!(pool.acquire(None, None, None).is_ok());
    }

    #[test]
    fn test_probe_fails_when_shut_down() {
        let (pool, _) = dispatcher(PoolConfig::default());
        assert!(pool.test_connection());
        pool.shutdown();
        assert!(!pool.test_connection());
    }

    #[test]
    fn test_probe_reports_full_sub_pool() {
        let (pool, _) = dispatcher(PoolConfig {
            max_size: 1,
            ..PoolConfig::default()
        });
        let held = pool.acquire(None, None, None).unwrap();
        assert!(!pool.test_connection_with(None, None));
        pool.release(&held, false).unwrap();
        assert!(pool.test_connection_with(None, None));
    }

    #[test]
    fn test_accessors() {
        let (pool, _) = dispatcher(PoolConfig {
            interleaving: true,
            sharable: false,
            ..PoolConfig::named("orders")
        });
        assert_eq!(pool.name(), "orders");
        assert!(!pool.is_sharable());
        assert!(pool.is_interleaving());
        pool.set_interleaving(false);
        assert!(!pool.is_interleaving());

        assert_eq!(pool.capacity(), Capacity::default());
        let wider = Capacity {
            increment: 4,
            decrement: 2,
        };
        pool.set_capacity(wider);
        assert_eq!(pool.capacity(), wider);
        assert!(!pool.is_prefill());
        assert_eq!(pool.config().name, "orders");
    }

    #[test]
    fn test_drop_shuts_sub_pools_down() {
        let (pool, resources) = dispatcher(PoolConfig::default());
        let handle = pool.acquire(None, None, None).unwrap();
        pool.release(&handle, false).unwrap();
        drop(handle);
        drop(pool);
        assert_eq!(resources.destroyed(), 1);
    }
}
