//! Pool-wide statistics

use poolgate_core::SubPoolStatistics;
use serde::{Deserialize, Serialize};

/// Snapshot of every sub-pool's counters, summed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatistics {
    /// Pool name
    pub name: String,
    /// Number of live sub-pools
    pub sub_pools: usize,
    /// Resources checked out
    pub in_use: usize,
    /// Idle resources
    pub available: usize,
    /// Resources created
    pub created: u64,
    /// Resources destroyed
    pub destroyed: u64,
    /// Threads waiting for a resource
    pub waiting: usize,
    /// Configured maximum size of each sub-pool
    pub max_size: usize,
    /// Whether the pool rejects new requests
    pub shutdown: bool,
}

impl PoolStatistics {
    pub(crate) fn new(name: &str, max_size: usize, shutdown: bool) -> Self {
        Self {
            name: name.to_string(),
            max_size,
            shutdown,
            ..Self::default()
        }
    }

    pub(crate) fn add(&mut self, sub_pool: &SubPoolStatistics) {
        self.sub_pools += 1;
        self.in_use += sub_pool.in_use;
        self.available += sub_pool.available;
        self.created += sub_pool.created;
        self.destroyed += sub_pool.destroyed;
        self.waiting += sub_pool.waiting;
    }

    /// Resources currently alive (in use + available)
    pub fn active(&self) -> usize {
        self.in_use + self.available
    }
}
