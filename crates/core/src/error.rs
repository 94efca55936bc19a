//! Error types for the pool dispatcher
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! # Categories
//!
//! | Category | Variants | Description |
//! |----------|----------|-------------|
//! | Lifecycle | `PoolTerminated`, `SubPoolShutdown` | Pool no longer accepts requests |
//! | Affinity | `LockUnavailable`, `Interrupted`, `HandleLookupFailed` | Transaction affinity failures |
//! | Routing | `SubPoolResolutionFailed`, `InvalidContext` | Partition resolution failures |
//! | Sub-pool | `Exhausted`, `ResourceCreation`, `UnknownHandle` | Collaborator failures |
//! | System | `Config`, `Io` | Infrastructure errors |

use std::io;
use thiserror::Error;

/// Result type alias for pool operations
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Error types for the pool dispatcher
#[derive(Debug, Error)]
pub enum PoolError {
    /// Acquisition attempted after the terminal flag was set
    #[error("pool '{pool}' is shut down")]
    PoolTerminated {
        /// Name of the pool that rejected the request
        pool: String,
    },

    /// The per-transaction lock could not be obtained
    #[error("unable to obtain transaction lock: {reason}")]
    LockUnavailable {
        /// Why the lock was unavailable
        reason: String,
    },

    /// Cancelled while waiting for the per-transaction lock
    #[error("interrupted while waiting for transaction lock")]
    Interrupted,

    /// Reading or writing the transaction affinity cache failed
    #[error("unable to get resource handle: {reason}")]
    HandleLookupFailed {
        /// Failure detail
        reason: String,
    },

    /// Sub-pool lookup or creation failed
    #[error("unable to get sub-pool: {source}")]
    SubPoolResolutionFailed {
        /// Underlying failure
        #[source]
        source: Box<PoolError>,
    },

    /// Key derivation rejected the security context or request parameters
    #[error("invalid request context: {0}")]
    InvalidContext(String),

    /// Sub-pool was full for the whole blocking timeout
    #[error("no resource available within {timeout_ms}ms (max size {max_size})")]
    Exhausted {
        /// Blocking timeout that elapsed
        timeout_ms: u64,
        /// Maximum size of the sub-pool
        max_size: usize,
    },

    /// Sub-pool has been shut down
    #[error("sub-pool {0} is shut down")]
    SubPoolShutdown(u64),

    /// Physical resource creation failed
    #[error("resource creation failed: {0}")]
    ResourceCreation(String),

    /// Handle was not issued by the sub-pool it was returned to
    #[error("handle {0} is not checked out from this sub-pool")]
    UnknownHandle(u64),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error (configuration files)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PoolError {
    /// Create a `PoolTerminated` error for the named pool
    pub fn terminated(pool: impl Into<String>) -> Self {
        PoolError::PoolTerminated { pool: pool.into() }
    }

    /// Create a `LockUnavailable` error
    pub fn lock_unavailable(reason: impl Into<String>) -> Self {
        PoolError::LockUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a `HandleLookupFailed` error
    pub fn handle_lookup(reason: impl Into<String>) -> Self {
        PoolError::HandleLookupFailed {
            reason: reason.into(),
        }
    }

    /// Wrap a failure from sub-pool creation
    pub fn resolution(source: PoolError) -> Self {
        PoolError::SubPoolResolutionFailed {
            source: Box::new(source),
        }
    }

    /// Create a `Config` error
    pub fn config(msg: impl Into<String>) -> Self {
        PoolError::Config(msg.into())
    }

    /// Transient failures the caller may retry
    ///
    /// The dispatcher never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::LockUnavailable { .. } | PoolError::Interrupted | PoolError::Exhausted { .. }
        )
    }

    /// True if the pool rejected the request because it is shut down
    pub fn is_terminal(&self) -> bool {
        matches!(self, PoolError::PoolTerminated { .. })
    }
}
