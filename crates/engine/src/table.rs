//! Partition table
//!
//! Concurrent map from partition key to sub-pool. At most one sub-pool is
//! ever committed per key:
//!
//! 1. Look the key up; on a hit, return the live sub-pool.
//! 2. On a miss, build a candidate outside any lock.
//! 3. Insert-if-absent. If another thread won the race, drop the candidate
//!    (it holds no resources yet) and return the winner.
//!
//! Creation for different keys never contends beyond DashMap's sharding.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use poolgate_core::{PartitionKey, PoolResult, SubPool, SubPoolId};
use std::sync::Arc;

/// Outcome of [`PartitionTable::resolve_or_create`]
pub struct Resolved {
    /// The live sub-pool for the key
    pub pool: Arc<dyn SubPool>,
    /// True if this call committed a new sub-pool
    pub created: bool,
}

/// Key → sub-pool mapping owned by one dispatcher
#[derive(Default)]
pub struct PartitionTable {
    pools: DashMap<PartitionKey, Arc<dyn SubPool>>,
}

impl PartitionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Live sub-pool for `key`, if any
    pub fn get(&self, key: &PartitionKey) -> Option<Arc<dyn SubPool>> {
        self.pools.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Return the sub-pool for `key`, creating it with `create` on a miss
    ///
    /// `create` runs without any table lock held.
    pub fn resolve_or_create<F>(&self, key: PartitionKey, create: F) -> PoolResult<Resolved>
    where
        F: FnOnce() -> PoolResult<Arc<dyn SubPool>>,
    {
        if let Some(pool) = self.get(&key) {
            return Ok(Resolved {
                pool,
                created: false,
            });
        }

        let candidate = create()?;

        match self.pools.entry(key) {
            Entry::Occupied(winner) => Ok(Resolved {
                pool: Arc::clone(winner.get()),
                created: false,
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&candidate));
                Ok(Resolved {
                    pool: candidate,
                    created: true,
                })
            }
        }
    }

    /// Remove `pool` if it is empty and is not the only sub-pool
    ///
    /// Emptiness is re-checked while the entry is locked. Returns true if
    /// the sub-pool was removed; the caller shuts it down.
    pub fn remove_if_empty(&self, pool: &Arc<dyn SubPool>) -> bool {
        if self.pools.len() <= 1 {
            return false;
        }

        let id = pool.id();
        let Some(key) = self.key_of(id) else {
            return false;
        };

        self.pools
            .remove_if(&key, |_, candidate| candidate.id() == id && candidate.is_empty())
            .is_some()
    }

    /// Remove every sub-pool, returning them
    pub fn drain(&self) -> Vec<Arc<dyn SubPool>> {
        let mut drained = Vec::with_capacity(self.pools.len());
        self.pools.retain(|_, pool| {
            drained.push(Arc::clone(pool));
            false
        });
        drained
    }

    /// Point-in-time copy of the sub-pools
    pub fn snapshot(&self) -> Vec<Arc<dyn SubPool>> {
        self.pools.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// True if `pool` is currently registered
    pub fn contains(&self, pool: &Arc<dyn SubPool>) -> bool {
        self.key_of(pool.id()).is_some()
    }

    /// Number of sub-pools
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// True if no sub-pool exists
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    fn key_of(&self, id: SubPoolId) -> Option<PartitionKey> {
        self.pools
            .iter()
            .find(|entry| entry.value().id() == id)
            .map(|entry| entry.key().clone())
    }
}
