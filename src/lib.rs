//! Poolgate - Partitioned resource pool dispatcher
//!
//! Poolgate routes resource requests to per-partition sub-pools, keyed by
//! security context and request parameters, and pins each transaction to
//! one resource handle per sub-pool.
//!
//! # Quick Start
//!
//! ```ignore
//! use poolgate::{PoolConfig, PoolDispatcher};
//!
//! let pool = PoolDispatcher::builder(PoolConfig::from_file("poolgate.toml".as_ref())?)
//!     .resource_factory(Arc::new(MyConnections::new()))
//!     .build()?;
//!
//! let handle = pool.acquire(None, None, None)?;
//! pool.release(&handle, false)?;
//! ```
//!
//! # Architecture
//!
//! - `poolgate-core`: errors, identifiers, resource handles, collaborator traits
//! - `poolgate-concurrency`: per-transaction lock, scope and coordinator
//! - `poolgate-engine`: dispatcher, partition table, config, reference sub-pool
//!
//! Their public types are re-exported here.

pub use poolgate_concurrency::{
    CancellationToken, CoordinatorMetrics, LocalTransactionCoordinator, TransactionRegistry,
    TransactionScope, TxnLock, TxnLockGuard,
};
pub use poolgate_core::{
    ConnectionId, FlushMode, HandleId, PartitionKey, PhysicalResource, PoolError, PoolOwner,
    PoolResult, RequestParams, ResourceFactory, ResourceHandle, ResourceId, SecurityContext,
    SubPool, SubPoolId, SubPoolStatistics, TransactionId,
};
pub use poolgate_engine::{
    BasicConnectionManager, Capacity, ConnectionManager, DispatcherBuilder, KeyStrategy,
    PartitionStrategy, PartitionTable, PoolConfig, PoolDispatcher, PoolStatistics,
    SimpleSubPool, SimpleSubPoolFactory, StrategyKind, SubPoolFactory, CONFIG_FILE_NAME,
};
