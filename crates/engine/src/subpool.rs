//! Reference sub-pool
//!
//! [`SimpleSubPool`] keeps a LIFO free list and a checked-out set behind one
//! `parking_lot` mutex. Acquire blocks on a condvar while the sub-pool is at
//! `max_size`, up to the configured blocking timeout.
//!
//! Physical resources are created and destroyed through the
//! [`ResourceFactory`] with the mutex released; a slot being created is
//! counted as `pending` so `max_size` holds across the unlocked window.
//!
//! Flush modes:
//!
//! | Mode | Free resources | Checked-out resources |
//! |------|----------------|-----------------------|
//! | `Idle` | destroyed | untouched |
//! | `All` | destroyed | destroyed now; a later release is a no-op |
//! | `Graceful` | destroyed | destroyed when returned |

use crate::config::PoolConfig;
use crate::traits::{ConnectionManager, SubPoolFactory};
use parking_lot::{Condvar, Mutex, MutexGuard};
use poolgate_core::{
    ConnectionId, FlushMode, HandleId, PhysicalResource, PoolError, PoolOwner, PoolResult,
    RequestParams, ResourceFactory, ResourceHandle, ResourceId, SecurityContext, SubPool,
    SubPoolId, SubPoolStatistics,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

struct IdleEntry {
    handle: Arc<ResourceHandle>,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    free: VecDeque<IdleEntry>,
    checked_out: HashMap<HandleId, Arc<ResourceHandle>>,
    draining: HashSet<HandleId>,
    pending: usize,
    waiters: Vec<(u64, String)>,
    next_waiter: u64,
    shutdown: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.free.len() + self.checked_out.len() + self.pending
    }
}

/// Bounded sub-pool for one partition
pub struct SimpleSubPool {
    id: SubPoolId,
    config: PoolConfig,
    resources: Arc<dyn ResourceFactory>,
    security: Option<SecurityContext>,
    params: Option<RequestParams>,
    owner: Weak<dyn PoolOwner>,
    self_ref: Weak<SimpleSubPool>,
    state: Mutex<PoolState>,
    available: Condvar,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl SimpleSubPool {
    /// Create an empty sub-pool
    ///
    /// `security` and `params` are the partition's identity; they are used
    /// for resource creation when an acquire does not supply its own.
    pub fn new(
        resources: Arc<dyn ResourceFactory>,
        security: Option<SecurityContext>,
        params: Option<RequestParams>,
        config: PoolConfig,
        owner: Weak<dyn PoolOwner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: SubPoolId::next(),
            config,
            resources,
            security,
            params,
            owner,
            self_ref: self_ref.clone(),
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        })
    }

    fn as_dyn(&self) -> PoolResult<Arc<dyn SubPool>> {
        match self.self_ref.upgrade() {
            Some(pool) => Ok(pool),
            None => Err(PoolError::SubPoolShutdown(self.id.as_u64())),
        }
    }

    /// Create one resource with the mutex released
    ///
    /// The caller has already counted the slot in `pending`.
    fn create_unlocked(
        &self,
        state: &mut MutexGuard<'_, PoolState>,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
    ) -> PoolResult<Arc<ResourceHandle>> {
        let origin = self.as_dyn();
        let created = MutexGuard::unlocked(state, || -> PoolResult<Arc<ResourceHandle>> {
            let origin = origin?;
            let resource = self.resources.create(
                security.or(self.security.as_ref()),
                params.or(self.params.as_ref()),
            )?;
            Ok(Arc::new(
                ResourceHandle::new(resource, origin)
                    .with_lazy_enlistment(self.resources.supports_lazy_enlistment()),
            ))
        });
        state.pending -= 1;

        match created {
            Ok(handle) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                trace!(
                    target: "poolgate::subpool",
                    sub_pool = %self.id,
                    handle = %handle,
                    "Created resource"
                );
                Ok(handle)
            }
            Err(e) => {
                // The reserved slot is free again; let a waiter try.
                self.available.notify_one();
                Err(e)
            }
        }
    }

    fn destroy_all(&self, victims: Vec<PhysicalResource>) {
        for resource in victims {
            self.resources.destroy(&resource);
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            trace!(
                target: "poolgate::subpool",
                sub_pool = %self.id,
                resource = %resource.id(),
                "Destroyed resource"
            );
        }
    }

    /// Evict free resources idle for longer than the configured idle timeout
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_older_than(self.config.idle_timeout())
    }

    /// Evict free resources idle for at least `age`
    ///
    /// In prefill mode the sub-pool is not shrunk below `min_size`. If the
    /// sub-pool ends up empty, the owning dispatcher is notified. Returns
    /// the number of resources evicted.
    pub fn evict_idle_older_than(&self, age: Duration) -> usize {
        let (victims, now_empty) = {
            let mut state = self.state.lock();
            let floor = if self.config.prefill {
                self.config.min_size
            } else {
                0
            };
            let mut victims = Vec::new();
            let mut kept = VecDeque::with_capacity(state.free.len());
            while let Some(entry) = state.free.pop_front() {
                // Resources left if this entry is evicted.
                let total = state.total() + kept.len();
                if entry.since.elapsed() >= age && total >= floor {
                    victims.push(entry.handle.resource().clone());
                } else {
                    kept.push_back(entry);
                }
            }
            state.free = kept;
            let now_empty = !victims.is_empty() && state.total() == 0;
            (victims, now_empty)
        };

        let evicted = victims.len();
        self.destroy_all(victims);

        if evicted > 0 {
            debug!(
                target: "poolgate::subpool",
                sub_pool = %self.id,
                evicted,
                "Evicted idle resources"
            );
        }

        // Owner callback runs without the sub-pool mutex held.
        if now_empty {
            if let (Some(owner), Ok(me)) = (self.owner.upgrade(), self.as_dyn()) {
                owner.empty_sub_pool(&me);
            }
        }
        evicted
    }

    /// Configuration this sub-pool was built with
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl SubPool for SimpleSubPool {
    fn id(&self) -> SubPoolId {
        self.id
    }

    fn acquire(
        &self,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
    ) -> PoolResult<Arc<ResourceHandle>> {
        let deadline = Instant::now() + self.config.blocking_timeout();
        let mut state = self.state.lock();
        let mut ticket = None;

        let result = loop {
            if state.shutdown {
                break Err(PoolError::SubPoolShutdown(self.id.as_u64()));
            }

            if let Some(entry) = state.free.pop_back() {
                let handle = entry.handle;
                state.checked_out.insert(handle.id(), Arc::clone(&handle));
                break Ok(handle);
            }

            if state.total() < self.config.max_size {
                state.pending += 1;
                // Leave the wait queue before the mutex is released.
                if let Some(t) = ticket.take() {
                    state.waiters.retain(|(w, _)| *w != t);
                }
                let handle = match self.create_unlocked(&mut state, security, params) {
                    Ok(handle) => handle,
                    Err(e) => break Err(e),
                };
                if state.shutdown {
                    drop(state);
                    self.destroy_all(vec![handle.resource().clone()]);
                    return Err(PoolError::SubPoolShutdown(self.id.as_u64()));
                }
                state.checked_out.insert(handle.id(), Arc::clone(&handle));
                break Ok(handle);
            }

            if ticket.is_none() {
                let t = state.next_waiter;
                state.next_waiter += 1;
                let name = thread::current()
                    .name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{:?}", thread::current().id()));
                state.waiters.push((t, name));
                ticket = Some(t);
            }

            if self.available.wait_until(&mut state, deadline).timed_out()
                && state.free.is_empty()
                && state.total() >= self.config.max_size
            {
                break Err(PoolError::Exhausted {
                    timeout_ms: self.config.blocking_timeout_ms,
                    max_size: self.config.max_size,
                });
            }
        };

        if let Some(t) = ticket {
            state.waiters.retain(|(w, _)| *w != t);
        }
        result
    }

    fn release(&self, handle: &Arc<ResourceHandle>, kill: bool) -> PoolResult<()> {
        if handle.origin().id() != self.id {
            return Err(PoolError::UnknownHandle(handle.id().as_u64()));
        }

        let victim = {
            let mut state = self.state.lock();
            // Already destroyed by flush(All) or shutdown.
            if state.checked_out.remove(&handle.id()).is_none() {
                trace!(
                    target: "poolgate::subpool",
                    sub_pool = %self.id,
                    handle = %handle,
                    "Release of handle that is no longer tracked"
                );
                return Ok(());
            }
            let draining = state.draining.remove(&handle.id());
            if kill || draining || state.shutdown {
                Some(handle.resource().clone())
            } else {
                state.free.push_back(IdleEntry {
                    handle: Arc::clone(handle),
                    since: Instant::now(),
                });
                None
            }
        };
        self.available.notify_one();

        if let Some(resource) = victim {
            self.destroy_all(vec![resource]);
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.state.lock().total() == 0
    }

    fn is_full(&self) -> bool {
        self.state.lock().total() >= self.config.max_size
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.checked_out.is_empty() && state.pending == 0
    }

    fn flush(&self, mode: FlushMode) -> PoolResult<()> {
        let victims = {
            let mut state = self.state.lock();
            let mut victims: Vec<PhysicalResource> = state
                .free
                .drain(..)
                .map(|entry| entry.handle.resource().clone())
                .collect();
            match mode {
                FlushMode::Idle => {}
                FlushMode::All => {
                    victims.extend(
                        state
                            .checked_out
                            .drain()
                            .map(|(_, handle)| handle.resource().clone()),
                    );
                    state.draining.clear();
                }
                FlushMode::Graceful => {
                    let ids: Vec<HandleId> = state.checked_out.keys().copied().collect();
                    state.draining.extend(ids);
                }
            }
            victims
        };
        self.available.notify_all();

        debug!(
            target: "poolgate::subpool",
            sub_pool = %self.id,
            mode = %mode,
            destroyed = victims.len(),
            "Flushed sub-pool"
        );
        self.destroy_all(victims);
        Ok(())
    }

    fn shutdown(&self) -> PoolResult<()> {
        let victims = {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.draining.clear();
            let mut victims: Vec<PhysicalResource> = state
                .free
                .drain(..)
                .map(|entry| entry.handle.resource().clone())
                .collect();
            victims.extend(
                state
                    .checked_out
                    .drain()
                    .map(|(_, handle)| handle.resource().clone()),
            );
            victims
        };
        self.available.notify_all();

        debug!(
            target: "poolgate::subpool",
            sub_pool = %self.id,
            destroyed = victims.len(),
            "Sub-pool shut down"
        );
        self.destroy_all(victims);
        Ok(())
    }

    fn prefill(&self) -> PoolResult<()> {
        if !self.config.prefill {
            return Ok(());
        }
        let target = self.config.prefill_target();
        let mut state = self.state.lock();
        let mut filled = 0usize;

        while !state.shutdown && state.total() < target {
            state.pending += 1;
            let handle = self.create_unlocked(&mut state, None, None)?;
            if state.shutdown {
                drop(state);
                self.destroy_all(vec![handle.resource().clone()]);
                return Ok(());
            }
            state.free.push_back(IdleEntry {
                handle,
                since: Instant::now(),
            });
            filled += 1;
        }
        drop(state);
        self.available.notify_all();

        if filled > 0 {
            debug!(
                target: "poolgate::subpool",
                sub_pool = %self.id,
                filled,
                target,
                "Prefilled sub-pool"
            );
        }
        Ok(())
    }

    fn dump_queued_threads(&self) -> Vec<String> {
        self.state
            .lock()
            .waiters
            .iter()
            .map(|(_, name)| name.clone())
            .collect()
    }

    fn find_handle(
        &self,
        resource: ResourceId,
        connection: Option<ConnectionId>,
    ) -> Option<Arc<ResourceHandle>> {
        self.state
            .lock()
            .checked_out
            .values()
            .find(|handle| handle.matches(resource, connection))
            .cloned()
    }

    fn statistics(&self) -> SubPoolStatistics {
        let state = self.state.lock();
        SubPoolStatistics {
            in_use: state.checked_out.len(),
            available: state.free.len(),
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            waiting: state.waiters.len(),
            max_size: self.config.max_size,
        }
    }
}

/// Builds a [`SimpleSubPool`] per partition
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleSubPoolFactory;

impl SubPoolFactory for SimpleSubPoolFactory {
    fn create(
        &self,
        resources: Arc<dyn ResourceFactory>,
        _manager: Option<Arc<dyn ConnectionManager>>,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
        config: &PoolConfig,
        owner: Weak<dyn PoolOwner>,
    ) -> PoolResult<Arc<dyn SubPool>> {
        let pool = SimpleSubPool::new(
            resources,
            security.cloned(),
            params.cloned(),
            config.clone(),
            owner,
        );
        trace!(
            target: "poolgate::subpool",
            sub_pool = %pool.id(),
            pool = %config.name,
            "Created sub-pool"
        );
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CountingResources;
    use std::sync::Barrier;

    struct NoOwner;

    impl PoolOwner for NoOwner {
        fn empty_sub_pool(&self, _pool: &Arc<dyn SubPool>) {}
    }

    fn detached() -> Weak<dyn PoolOwner> {
        Weak::<NoOwner>::new()
    }

    fn pool_with(config: PoolConfig) -> (Arc<SimpleSubPool>, Arc<CountingResources>) {
        let resources = Arc::new(CountingResources::default());
        let pool = SimpleSubPool::new(resources.clone(), None, None, config, detached());
        (pool, resources)
    }

    fn small(max: usize) -> PoolConfig {
        PoolConfig {
            max_size: max,
            blocking_timeout_ms: 50,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_new_pool_holds_nothing() {
        let (pool, resources) = pool_with(small(2));
        assert!(pool.is_empty());
        assert!(pool.is_idle());
        assert!(!pool.is_full());
        assert_eq!(resources.created(), 0);
    }

    #[test]
    fn test_release_recycles_resource() {
        let (pool, resources) = pool_with(small(2));
        let first = pool.acquire(None, None).unwrap();
        assert!(!pool.is_idle());
        pool.release(&first, false).unwrap();

        let second = pool.acquire(None, None).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(resources.created(), 1);
    }

    #[test]
    fn test_kill_destroys_resource() {
        let (pool, resources) = pool_with(small(2));
        let handle = pool.acquire(None, None).unwrap();
        pool.release(&handle, true).unwrap();
        assert!(pool.is_empty());
        assert_eq!(resources.destroyed(), 1);
    }

    #[test]
    fn test_full_pool_times_out() {
        let (pool, _) = pool_with(small(1));
        let _held = pool.acquire(None, None).unwrap();
        assert!(pool.is_full());

        let err = pool.acquire(None, None).unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { max_size: 1, .. }));
        assert!(pool.dump_queued_threads().is_empty());
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let (pool, _) = pool_with(PoolConfig {
            max_size: 1,
            blocking_timeout_ms: 5_000,
            ..PoolConfig::default()
        });
        let held = pool.acquire(None, None).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let waiter = {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            thread::Builder::new()
                .name("subpool-waiter".to_string())
                .spawn(move || {
                    barrier.wait();
                    pool.acquire(None, None).map(|h| h.id())
                })
                .unwrap()
        };

        barrier.wait();
        while pool.dump_queued_threads().is_empty() {
            thread::yield_now();
        }
        assert_eq!(pool.dump_queued_threads(), vec!["subpool-waiter".to_string()]);
        assert_eq!(pool.statistics().waiting, 1);

        pool.release(&held, false).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), held.id());
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let (a, _) = pool_with(small(1));
        let (b, _) = pool_with(small(1));
        let handle = a.acquire(None, None).unwrap();
        assert!(matches!(
            b.release(&handle, false),
            Err(PoolError::UnknownHandle(_))
        ));
    }

    #[test]
    fn test_flush_idle_keeps_checked_out() {
        let (pool, resources) = pool_with(small(3));
        let held = pool.acquire(None, None).unwrap();
        let idle = pool.acquire(None, None).unwrap();
        pool.release(&idle, false).unwrap();

        pool.flush(FlushMode::Idle).unwrap();
        assert_eq!(resources.destroyed(), 1);
        assert!(!pool.is_empty());

        pool.release(&held, false).unwrap();
        assert_eq!(pool.statistics().available, 1);
    }

    #[test]
    fn test_flush_all_invalidates_checked_out() {
        let (pool, resources) = pool_with(small(3));
        let held = pool.acquire(None, None).unwrap();

        pool.flush(FlushMode::All).unwrap();
        assert!(pool.is_empty());
        assert_eq!(resources.destroyed(), 1);

        // Late release is accepted and does not destroy twice.
        pool.release(&held, false).unwrap();
        assert_eq!(resources.destroyed(), 1);
    }

    #[test]
    fn test_flush_graceful_destroys_on_return() {
        let (pool, resources) = pool_with(small(3));
        let held = pool.acquire(None, None).unwrap();
        let idle = pool.acquire(None, None).unwrap();
        pool.release(&idle, false).unwrap();

        pool.flush(FlushMode::Graceful).unwrap();
        assert_eq!(resources.destroyed(), 1);
        assert!(!pool.is_empty());

        pool.release(&held, false).unwrap();
        assert_eq!(resources.destroyed(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_shutdown_rejects_acquire() {
        let (pool, resources) = pool_with(small(2));
        let _held = pool.acquire(None, None).unwrap();
        pool.shutdown().unwrap();

        assert!(pool.is_empty());
        assert_eq!(resources.destroyed(), 1);
        assert!(matches!(
            pool.acquire(None, None),
            Err(PoolError::SubPoolShutdown(_))
        ));
    }

    #[test]
    fn test_prefill_reaches_target() {
        let (pool, resources) = pool_with(PoolConfig {
            min_size: 2,
            initial_size: Some(3),
            max_size: 5,
            prefill: true,
            ..PoolConfig::default()
        });
        pool.prefill().unwrap();
        assert_eq!(pool.statistics().available, 3);
        assert_eq!(resources.created(), 3);

        pool.prefill().unwrap();
        assert_eq!(resources.created(), 3);
    }

    #[test]
    fn test_prefill_disabled_is_noop() {
        let (pool, resources) = pool_with(PoolConfig {
            min_size: 2,
            ..PoolConfig::default()
        });
        pool.prefill().unwrap();
        assert_eq!(resources.created(), 0);
    }

    #[test]
    fn test_evict_idle_respects_min_size_in_prefill_mode() {
        let (pool, _) = pool_with(PoolConfig {
            min_size: 1,
            initial_size: Some(3),
            max_size: 5,
            prefill: true,
            ..PoolConfig::default()
        });
        pool.prefill().unwrap();

        assert_eq!(pool.evict_idle_older_than(Duration::ZERO), 2);
        assert_eq!(pool.statistics().available, 1);
    }

    #[test]
    fn test_evict_idle_skips_fresh_resources() {
        let (pool, _) = pool_with(small(2));
        let handle = pool.acquire(None, None).unwrap();
        pool.release(&handle, false).unwrap();

        assert_eq!(pool.evict_idle_older_than(Duration::from_secs(3600)), 0);
        assert_eq!(pool.evict_idle_older_than(Duration::ZERO), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_creation_failure_frees_slot() {
        let (pool, resources) = pool_with(small(1));
        resources.fail_next(1);
        assert!(matches!(
            pool.acquire(None, None),
            Err(PoolError::ResourceCreation(_))
        ));
        assert!(pool.is_empty());
        assert!(pool.acquire(None, None).is_ok());
    }

    #[test]
    fn test_find_handle_only_checked_out() {
        let (pool, _) = pool_with(small(2));
        let handle = pool.acquire(None, None).unwrap();
        let resource = handle.resource().id();
        let connection = ConnectionId::next();
        handle.attach_connection(connection);

        assert!(pool.find_handle(resource, None).is_some());
        assert!(pool.find_handle(resource, Some(connection)).is_some());
        assert!(pool
            .find_handle(resource, Some(ConnectionId::next()))
            .is_none());

        pool.release(&handle, false).unwrap();
        assert!(pool.find_handle(resource, None).is_none());
    }

    #[test]
    fn test_lazy_enlistment_follows_factory() {
        let resources = Arc::new(CountingResources::lazy());
        let pool = SimpleSubPool::new(resources, None, None, small(1), detached());
        assert!(pool.acquire(None, None).unwrap().supports_lazy_enlistment());
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_max() {
        let (pool, resources) = pool_with(PoolConfig {
            max_size: 3,
            blocking_timeout_ms: 5_000,
            ..PoolConfig::default()
        });
        let barrier = Arc::new(Barrier::new(8));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        let handle = pool.acquire(None, None).unwrap();
                        assert!(pool.statistics().in_use <= 3);
                        pool.release(&handle, false).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert!(resources.created() <= 3);
        assert!(pool.is_idle());
    }
}
