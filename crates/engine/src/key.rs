//! Partition key derivation
//!
//! A [`KeyStrategy`] decides which requests share a sub-pool. It is a pure
//! function of the security context, the request parameters and the
//! separate-no-transaction flag the dispatcher computed.

use crate::config::StrategyKind;
use poolgate_core::{PartitionKey, PoolError, PoolResult, RequestParams, SecurityContext};

/// Derives a partition key for a request
pub trait KeyStrategy: Send + Sync {
    /// Build the key
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidContext` if the inputs cannot identify a
    /// partition.
    fn derive_key(
        &self,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
        separate_no_tx: bool,
    ) -> PoolResult<PartitionKey>;
}

/// Built-in strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionStrategy {
    /// Everything in one partition
    Single,
    /// Partition by security context
    BySecurityContext,
    /// Partition by request parameters
    ByRequestParams,
    /// Partition by security context and request parameters
    BySecurityContextAndParams,
}

impl From<StrategyKind> for PartitionStrategy {
    fn from(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::Single => PartitionStrategy::Single,
            StrategyKind::BySecurityContext => PartitionStrategy::BySecurityContext,
            StrategyKind::ByRequestParams => PartitionStrategy::ByRequestParams,
            StrategyKind::BySecurityContextAndParams => {
                PartitionStrategy::BySecurityContextAndParams
            }
        }
    }
}

fn checked_security(security: Option<&SecurityContext>) -> PoolResult<Option<SecurityContext>> {
    match security {
        Some(ctx) if ctx.principal().trim().is_empty() => Err(PoolError::InvalidContext(
            "security context has an empty principal".to_string(),
        )),
        other => Ok(other.cloned()),
    }
}

impl KeyStrategy for PartitionStrategy {
    fn derive_key(
        &self,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
        separate_no_tx: bool,
    ) -> PoolResult<PartitionKey> {
        let key = match self {
            PartitionStrategy::Single => PartitionKey::single(separate_no_tx),
            PartitionStrategy::BySecurityContext => {
                PartitionKey::for_security(checked_security(security)?, separate_no_tx)
            }
            PartitionStrategy::ByRequestParams => {
                PartitionKey::for_params(params.cloned(), separate_no_tx)
            }
            PartitionStrategy::BySecurityContextAndParams => PartitionKey::for_security_and_params(
                checked_security(security)?,
                params.cloned(),
                separate_no_tx,
            ),
        };
        Ok(key)
    }
}

impl<F> KeyStrategy for F
where
    F: Fn(Option<&SecurityContext>, Option<&RequestParams>, bool) -> PoolResult<PartitionKey>
        + Send
        + Sync,
{
    fn derive_key(
        &self,
        security: Option<&SecurityContext>,
        params: Option<&RequestParams>,
        separate_no_tx: bool,
    ) -> PoolResult<PartitionKey> {
        self(security, params, separate_no_tx)
    }
}
