//! Resource handles
//!
//! A [`ResourceHandle`] wraps one physical resource issued by a sub-pool. It
//! records the transaction it is bound to and a back-reference to the
//! sub-pool that issued it, so a release always returns it to its origin.

use crate::traits::SubPool;
use crate::types::{ConnectionId, HandleId, ResourceId, TransactionId};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// The underlying reusable asset, as produced by a resource factory
#[derive(Clone)]
pub struct PhysicalResource {
    id: ResourceId,
    inner: Arc<dyn Any + Send + Sync>,
}

impl PhysicalResource {
    /// Wrap a factory-produced value under a fresh id
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            id: ResourceId::next(),
            inner: Arc::new(value),
        }
    }

    /// Identity of this resource
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Borrow the wrapped value as its concrete type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for PhysicalResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalResource")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Wrapper around one physical resource checked out of a sub-pool
pub struct ResourceHandle {
    id: HandleId,
    resource: PhysicalResource,
    origin: Arc<dyn SubPool>,
    transaction: Mutex<Option<TransactionId>>,
    lazy_enlistment: bool,
    connections: Mutex<Vec<ConnectionId>>,
}

impl ResourceHandle {
    /// Create a handle for `resource`, owned by `origin`
    pub fn new(resource: PhysicalResource, origin: Arc<dyn SubPool>) -> Self {
        Self {
            id: HandleId::next(),
            resource,
            origin,
            transaction: Mutex::new(None),
            lazy_enlistment: false,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Mark this handle as able to enlist lazily in a transaction
    ///
    /// Lazily enlisted handles are never pinned in the affinity cache.
    pub fn with_lazy_enlistment(mut self, supported: bool) -> Self {
        self.lazy_enlistment = supported;
        self
    }

    /// Handle identity
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// The wrapped physical resource
    pub fn resource(&self) -> &PhysicalResource {
        &self.resource
    }

    /// The sub-pool that issued this handle
    pub fn origin(&self) -> &Arc<dyn SubPool> {
        &self.origin
    }

    /// Whether the handle is bound to a transaction's affinity cache
    pub fn is_tracked_by_tx(&self) -> bool {
        self.transaction.lock().is_some()
    }

    /// Transaction whose affinity cache holds this handle
    pub fn bound_transaction(&self) -> Option<TransactionId> {
        *self.transaction.lock()
    }

    /// Mark the handle as bound to `transaction`
    pub fn bind_to_transaction(&self, transaction: TransactionId) {
        *self.transaction.lock() = Some(transaction);
    }

    /// Clear the binding, returning the transaction it pointed at
    pub fn unbind_transaction(&self) -> Option<TransactionId> {
        self.transaction.lock().take()
    }

    /// Whether the handle supports lazy enlistment
    pub fn supports_lazy_enlistment(&self) -> bool {
        self.lazy_enlistment
    }

    /// Record an application connection served by this handle
    pub fn attach_connection(&self, connection: ConnectionId) {
        let mut connections = self.connections.lock();
        if !connections.contains(&connection) {
            connections.push(connection);
        }
    }

    /// Forget an application connection
    pub fn detach_connection(&self, connection: ConnectionId) {
        self.connections.lock().retain(|c| *c != connection);
    }

    /// True if `connection` is attached to this handle
    pub fn has_connection(&self, connection: ConnectionId) -> bool {
        self.connections.lock().contains(&connection)
    }

    /// True if this handle wraps `resource` and, when given, serves `connection`
    pub fn matches(&self, resource: ResourceId, connection: Option<ConnectionId>) -> bool {
        self.resource.id() == resource && connection.map_or(true, |c| self.has_connection(c))
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.id)
            .field("resource", &self.resource.id())
            .field("sub_pool", &self.origin.id())
            .field("transaction", &self.bound_transaction())
            .finish()
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.origin.id())
    }
}
