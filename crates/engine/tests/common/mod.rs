//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use poolgate_concurrency::LocalTransactionCoordinator;
use poolgate_core::{
    PartitionKey, PhysicalResource, PoolError, PoolOwner, PoolResult, RequestParams,
    ResourceFactory, SecurityContext, SubPool,
};
use poolgate_engine::{
    BasicConnectionManager, ConnectionManager, KeyStrategy, PoolConfig, PoolDispatcher,
    SimpleSubPool, SubPoolFactory,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Barrier, Weak};

/// Route test output through the test harness
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Resource factories
// ============================================================================

/// Counts creations and destructions; can block or fail on demand
#[derive(Default)]
pub struct CountingResources {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    failures: AtomicUsize,
    lazy: AtomicBool,
    rendezvous: Mutex<Option<(Arc<Barrier>, usize)>>,
    gate: Mutex<Option<Receiver<()>>>,
    gated: AtomicBool,
}

impl CountingResources {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handles created by this factory support lazy enlistment
    pub fn lazy() -> Arc<Self> {
        let resources = Self::default();
        resources.lazy.store(true, Ordering::SeqCst);
        Arc::new(resources)
    }

    /// The next `n` creations wait on `barrier` before returning
    pub fn rendezvous(&self, barrier: Arc<Barrier>, n: usize) {
        *self.rendezvous.lock() = Some((barrier, n));
    }

    /// The next creation blocks until `gate` receives a message
    pub fn gate(&self, gate: Receiver<()>) {
        *self.gate.lock() = Some(gate);
    }

    /// True once a creation is parked on the gate
    pub fn is_gated(&self) -> bool {
        self.gated.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl ResourceFactory for CountingResources {
    fn create(
        &self,
        security: Option<&SecurityContext>,
        _params: Option<&RequestParams>,
    ) -> PoolResult<PhysicalResource> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(PoolError::ResourceCreation("injected failure".to_string()));
        }

        let barrier = {
            let mut slot = self.rendezvous.lock();
            match slot.take() {
                Some((barrier, n)) => {
                    if n > 1 {
                        *slot = Some((Arc::clone(&barrier), n - 1));
                    }
                    Some(barrier)
                }
                None => None,
            }
        };
        if let Some(barrier) = barrier {
            barrier.wait();
        }

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            self.gated.store(true, Ordering::SeqCst);
            let _ = gate.recv();
        }

        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(PhysicalResource::new(
            security.map(|s| s.principal().to_string()),
        ))
    }

    fn destroy(&self, _resource: &PhysicalResource) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn supports_lazy_enlistment(&self) -> bool {
        self.lazy.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Sub-pool factories
// ============================================================================

/// Builds `SimpleSubPool`s and keeps every instance it created
#[derive(Default)]
pub struct RecordingFactory {
    pools: Mutex<Vec<Arc<SimpleSubPool>>>,
    fail: AtomicBool,
}

impl RecordingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of candidates built, winners and losers alike
    pub fn created(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn pools(&self) -> Vec<Arc<SimpleSubPool>> {
        self.pools.lock().clone()
    }
}

impl SubPoolFactory for RecordingFactory {
    fn create(
        &self,
        resources: Arc<dyn ResourceFactory>,
        _manager: Option<Arc<dyn ConnectionManager>>,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
        config: &PoolConfig,
        owner: Weak<dyn PoolOwner>,
    ) -> PoolResult<Arc<dyn SubPool>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PoolError::ResourceCreation("factory offline".to_string()));
        }
        let pool = SimpleSubPool::new(
            resources,
            security.cloned(),
            params.cloned(),
            config.clone(),
            owner,
        );
        self.pools.lock().push(Arc::clone(&pool));
        Ok(pool)
    }
}

// ============================================================================
// Dispatchers
// ============================================================================

/// Partition by the `db` request parameter
pub fn by_db() -> Arc<dyn KeyStrategy> {
    Arc::new(
        |_: Option<&SecurityContext>,
         params: Option<&RequestParams>,
         separate: bool|
         -> PoolResult<PartitionKey> {
            let db = params.and_then(|p| p.get("db")).unwrap_or("default");
            Ok(PartitionKey::custom(db, separate))
        },
    )
}

pub fn db(name: &str) -> RequestParams {
    RequestParams::new().with("db", name)
}

/// Non-transactional dispatcher partitioned by `db`
pub fn plain(config: PoolConfig) -> (Arc<PoolDispatcher>, Arc<CountingResources>) {
    let resources = CountingResources::new();
    let pool = PoolDispatcher::builder(config)
        .resource_factory(resources.clone())
        .strategy(by_db())
        .build()
        .unwrap();
    (pool, resources)
}

/// Everything a transactional test needs
pub struct TxFixture {
    pub pool: Arc<PoolDispatcher>,
    pub resources: Arc<CountingResources>,
    pub coordinator: Arc<LocalTransactionCoordinator>,
    pub manager: Arc<BasicConnectionManager>,
}

/// Transactional dispatcher partitioned by `db`
pub fn transactional(config: PoolConfig, resources: Arc<CountingResources>) -> TxFixture {
    let coordinator = Arc::new(LocalTransactionCoordinator::new());
    let manager = Arc::new(BasicConnectionManager::transactional(coordinator.clone()));
    let pool = PoolDispatcher::builder(config)
        .resource_factory(resources.clone())
        .strategy(by_db())
        .connection_manager(manager.clone())
        .build()
        .unwrap();
    TxFixture {
        pool,
        resources,
        coordinator,
        manager,
    }
}
