//! Collaborators supplied by the embedding connection manager

use crate::config::PoolConfig;
use poolgate_concurrency::TransactionRegistry;
use poolgate_core::{
    PoolOwner, PoolResult, RequestParams, ResourceFactory, SecurityContext, SubPool,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// The connection manager that owns a dispatcher
pub trait ConnectionManager: Send + Sync {
    /// Whether the current call runs inside a transactional context
    fn is_transactional(&self) -> bool;

    /// Whether handles are enlisted eagerly
    ///
    /// When `false`, handles that support lazy enlistment bypass the
    /// transaction affinity cache.
    fn is_enlistment_eager(&self) -> bool {
        true
    }

    /// Access to transaction-scoped storage
    fn transaction_registry(&self) -> Option<Arc<dyn TransactionRegistry>>;
}

/// Builds sub-pools for newly seen partition keys
///
/// A created sub-pool must not hold physical resources until it is first
/// used: a candidate that loses the insert race is simply dropped.
pub trait SubPoolFactory: Send + Sync {
    /// Create an empty sub-pool for one partition
    fn create(
        &self,
        resources: Arc<dyn ResourceFactory>,
        manager: Option<Arc<dyn ConnectionManager>>,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
        config: &PoolConfig,
        owner: Weak<dyn PoolOwner>,
    ) -> PoolResult<Arc<dyn SubPool>>;
}

/// Connection manager backed by plain flags and an optional registry
pub struct BasicConnectionManager {
    transactional: AtomicBool,
    eager_enlistment: AtomicBool,
    registry: Option<Arc<dyn TransactionRegistry>>,
}

impl BasicConnectionManager {
    /// Transactional manager using `registry` for transaction-scoped storage
    pub fn transactional(registry: Arc<dyn TransactionRegistry>) -> Self {
        Self {
            transactional: AtomicBool::new(true),
            eager_enlistment: AtomicBool::new(true),
            registry: Some(registry),
        }
    }

    /// Manager without transaction support
    pub fn non_transactional() -> Self {
        Self {
            transactional: AtomicBool::new(false),
            eager_enlistment: AtomicBool::new(true),
            registry: None,
        }
    }

    /// Toggle whether calls are reported as transactional
    pub fn set_transactional(&self, transactional: bool) {
        self.transactional.store(transactional, Ordering::Release);
    }

    /// Toggle eager enlistment
    pub fn set_eager_enlistment(&self, eager: bool) {
        self.eager_enlistment.store(eager, Ordering::Release);
    }
}

impl ConnectionManager for BasicConnectionManager {
    fn is_transactional(&self) -> bool {
        self.transactional.load(Ordering::Acquire)
    }

    fn is_enlistment_eager(&self) -> bool {
        self.eager_enlistment.load(Ordering::Acquire)
    }

    fn transaction_registry(&self) -> Option<Arc<dyn TransactionRegistry>> {
        self.registry.clone()
    }
}
