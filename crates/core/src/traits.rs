//! Collaborator traits consumed by the dispatcher
//!
//! - [`SubPool`]: owns the physical resources of one partition
//! - [`ResourceFactory`]: creates and destroys physical resources
//! - [`PoolOwner`]: callback surface a sub-pool uses to reach its dispatcher
//!
//! All traits require `Send + Sync`; implementations synchronize internally.

use crate::error::PoolResult;
use crate::handle::{PhysicalResource, ResourceHandle};
use crate::types::{ConnectionId, FlushMode, RequestParams, ResourceId, SecurityContext, SubPoolId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Counters reported by one sub-pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubPoolStatistics {
    /// Resources currently checked out
    pub in_use: usize,
    /// Resources idle in the free list
    pub available: usize,
    /// Resources created over the sub-pool's lifetime
    pub created: u64,
    /// Resources destroyed over the sub-pool's lifetime
    pub destroyed: u64,
    /// Threads blocked waiting for a resource
    pub waiting: usize,
    /// Configured maximum size
    pub max_size: usize,
}

/// The set of physical resources for one partition key
///
/// Acquire may block (e.g. while the sub-pool is full); the dispatcher never
/// calls it while holding a per-transaction lock.
pub trait SubPool: Send + Sync {
    /// Identity of this sub-pool instance
    fn id(&self) -> SubPoolId;

    /// Check out a resource handle
    fn acquire(
        &self,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
    ) -> PoolResult<Arc<ResourceHandle>>;

    /// Return a handle previously issued by this sub-pool
    ///
    /// With `kill` set the underlying resource is destroyed instead of
    /// being recycled.
    fn release(&self, handle: &Arc<ResourceHandle>, kill: bool) -> PoolResult<()>;

    /// True if the sub-pool holds no resources at all
    fn is_empty(&self) -> bool;

    /// True if the sub-pool is at its maximum size
    fn is_full(&self) -> bool;

    /// True if no resource is checked out
    fn is_idle(&self) -> bool;

    /// Destroy resources according to `mode`
    fn flush(&self, mode: FlushMode) -> PoolResult<()>;

    /// Destroy every resource and reject further requests
    fn shutdown(&self) -> PoolResult<()>;

    /// Populate the sub-pool up to its minimum size
    fn prefill(&self) -> PoolResult<()>;

    /// Describe the threads currently waiting on this sub-pool
    fn dump_queued_threads(&self) -> Vec<String>;

    /// Find the checked-out handle wrapping `resource`
    fn find_handle(
        &self,
        resource: ResourceId,
        connection: Option<ConnectionId>,
    ) -> Option<Arc<ResourceHandle>>;

    /// Snapshot of this sub-pool's counters
    fn statistics(&self) -> SubPoolStatistics;
}

/// Creates and destroys physical resources
pub trait ResourceFactory: Send + Sync {
    /// Create a resource for the given identity and parameters
    fn create(
        &self,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
    ) -> PoolResult<PhysicalResource>;

    /// Release whatever the resource holds
    fn destroy(&self, _resource: &PhysicalResource) {}

    /// Whether handles for these resources may enlist lazily
    fn supports_lazy_enlistment(&self) -> bool {
        false
    }
}

/// Dispatcher callbacks available to its sub-pools
pub trait PoolOwner: Send + Sync {
    /// Notify the owner that `pool` may have become empty
    ///
    /// The owner decides whether to reclaim it.
    fn empty_sub_pool(&self, pool: &Arc<dyn SubPool>);
}
