//! Core types and traits for poolgate
//!
//! This crate defines the foundational types used throughout the system:
//! - PoolError: Error taxonomy shared by every layer
//! - Identifiers: TransactionId, SubPoolId, ResourceId, ConnectionId, HandleId
//! - SecurityContext / RequestParams: what a request carries
//! - PartitionKey: opaque routing key for a sub-pool
//! - ResourceHandle: a checked-out physical resource
//! - Traits: collaborator interfaces (SubPool, ResourceFactory, PoolOwner)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod handle;
pub mod traits;
pub mod types;

pub use error::{PoolError, PoolResult};
pub use handle::{PhysicalResource, ResourceHandle};
pub use traits::{PoolOwner, ResourceFactory, SubPool, SubPoolStatistics};
pub use types::{
    ConnectionId, FlushMode, HandleId, PartitionKey, RequestParams, ResourceId, SecurityContext,
    SubPoolId, TransactionId,
};
