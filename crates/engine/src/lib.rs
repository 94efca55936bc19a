//! Pool dispatcher engine for poolgate
//!
//! This crate orchestrates the lower layers:
//! - PoolDispatcher: routing, transaction affinity, lifecycle, flush
//! - PartitionTable: key → sub-pool map with insert-if-absent creation
//! - KeyStrategy: how requests are grouped into partitions
//! - PoolConfig: `poolgate.toml` configuration
//! - SimpleSubPool: bounded reference sub-pool
//!
//! The engine is the only component that knows about:
//! - Partition keys and sub-pool reclamation
//! - The connection manager and its transaction registry

#![warn(missing_docs)]
#![warn(clippy::all)]

mod affinity;
pub mod config;
pub mod dispatcher;
pub mod key;
pub mod statistics;
pub mod subpool;
pub mod table;
pub mod traits;

pub use config::{Capacity, PoolConfig, StrategyKind, CONFIG_FILE_NAME};
pub use dispatcher::{DispatcherBuilder, PoolDispatcher};
pub use key::{KeyStrategy, PartitionStrategy};
pub use statistics::PoolStatistics;
pub use subpool::{SimpleSubPool, SimpleSubPoolFactory};
pub use table::{PartitionTable, Resolved};
pub use traits::{BasicConnectionManager, ConnectionManager, SubPoolFactory};
