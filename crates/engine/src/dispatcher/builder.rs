//! Builder for [`PoolDispatcher`]

use super::PoolDispatcher;
use crate::config::PoolConfig;
use crate::key::{KeyStrategy, PartitionStrategy};
use crate::subpool::SimpleSubPoolFactory;
use crate::traits::{ConnectionManager, SubPoolFactory};
use poolgate_core::{PoolError, PoolResult, ResourceFactory};
use std::sync::Arc;

/// Fluent configuration for a [`PoolDispatcher`]
///
/// ```ignore
/// let pool = PoolDispatcher::builder(PoolConfig::named("orders"))
///     .resource_factory(Arc::new(MyConnections::new()))
///     .connection_manager(manager)
///     .build()?;
/// ```
///
/// Only the resource factory is required. The key strategy defaults to the
/// one named in the configuration and sub-pools default to
/// [`SimpleSubPool`](crate::subpool::SimpleSubPool).
pub struct DispatcherBuilder {
    config: PoolConfig,
    strategy: Option<Arc<dyn KeyStrategy>>,
    resources: Option<Arc<dyn ResourceFactory>>,
    factory: Option<Arc<dyn SubPoolFactory>>,
    manager: Option<Arc<dyn ConnectionManager>>,
}

impl DispatcherBuilder {
    pub(crate) fn new(config: PoolConfig) -> Self {
        Self {
            config,
            strategy: None,
            resources: None,
            factory: None,
            manager: None,
        }
    }

    /// Use a custom key strategy instead of the configured one
    pub fn strategy(mut self, strategy: Arc<dyn KeyStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Source of physical resources (required)
    pub fn resource_factory(mut self, resources: Arc<dyn ResourceFactory>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Use a custom sub-pool implementation
    pub fn sub_pool_factory(mut self, factory: Arc<dyn SubPoolFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Owning connection manager
    ///
    /// Without one, every request takes the non-transactional path.
    pub fn connection_manager(mut self, manager: Arc<dyn ConnectionManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Validate the configuration and build the dispatcher
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` if the configuration is invalid or no
    /// resource factory was supplied.
    pub fn build(self) -> PoolResult<Arc<PoolDispatcher>> {
        self.config.validate()?;
        let resources = self.resources.ok_or_else(|| {
            PoolError::config(format!(
                "pool '{}' requires a resource factory",
                self.config.name
            ))
        })?;
        let strategy = self
            .strategy
            .unwrap_or_else(|| Arc::new(PartitionStrategy::from(self.config.strategy)));
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(SimpleSubPoolFactory));

        Ok(PoolDispatcher::assemble(
            self.config,
            strategy,
            resources,
            factory,
            self.manager,
        ))
    }
}
