//! Concurrency layer for poolgate
//!
//! This crate implements the transaction-scoped coordination the dispatcher
//! relies on:
//! - CancellationToken: request-level interrupt signal
//! - TxnLock: reentrant, fair, cancellable per-transaction lock
//! - TransactionScope: per-transaction lock + affinity cache
//! - TransactionRegistry: access to the current transaction's scope
//! - LocalTransactionCoordinator: in-process registry implementation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod coordinator;
pub mod lock;
pub mod scope;

pub use cancel::CancellationToken;
pub use coordinator::{CoordinatorMetrics, LocalTransactionCoordinator, TransactionRegistry};
pub use lock::{TxnLock, TxnLockGuard};
pub use scope::TransactionScope;
