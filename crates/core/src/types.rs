//! Core types for the pool dispatcher
//!
//! This module defines the foundational types:
//! - TransactionId: Unique identifier for a unit of work
//! - SubPoolId / ResourceId / ConnectionId / HandleId: numeric identities
//! - SecurityContext: Identity a request runs as
//! - RequestParams: Per-request connection parameters
//! - PartitionKey: Opaque routing key for a sub-pool
//! - FlushMode: How a flush treats idle and in-use resources

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Unique identifier for a transaction
///
/// A TransactionId is a wrapper around a UUID v4. It identifies the unit of
/// work whose transaction-scoped storage holds the affinity cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Create a new random TransactionId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a TransactionId from a string representation
    ///
    /// Returns None if the string is not a valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $name {
            /// Allocate the next process-unique id
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Wrap a raw value
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw numeric value
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

numeric_id!(
    /// Identity of one sub-pool instance
    ///
    /// Used as the affinity cache key inside transaction-scoped storage.
    SubPoolId,
    NEXT_SUB_POOL_ID,
    "subpool"
);

numeric_id!(
    /// Identity of one physical resource
    ResourceId,
    NEXT_RESOURCE_ID,
    "resource"
);

numeric_id!(
    /// Identity of an application-level connection attached to a resource handle
    ConnectionId,
    NEXT_CONNECTION_ID,
    "conn"
);

numeric_id!(
    /// Identity of one resource handle
    HandleId,
    NEXT_HANDLE_ID,
    "handle"
);

/// Identity a request runs as
///
/// Two contexts are equal when both principal and credentials match, so
/// resources created for one identity are never handed to another.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecurityContext {
    principal: String,
    credentials: Option<String>,
}

impl SecurityContext {
    /// Context for a principal without credentials
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            credentials: None,
        }
    }

    /// Context for a principal with credentials
    pub fn with_credentials(principal: impl Into<String>, credentials: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            credentials: Some(credentials.into()),
        }
    }

    /// The principal name
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// The credentials, if any
    pub fn credentials(&self) -> Option<&str> {
        self.credentials.as_deref()
    }
}

// Credentials never reach logs.
impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("principal", &self.principal)
            .field("credentials", &self.credentials.as_ref().map(|_| "***"))
            .finish()
    }
}

impl fmt::Display for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.principal)
    }
}

/// Per-request connection parameters
///
/// Ordered so that equal parameter sets hash identically regardless of
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestParams(BTreeMap<String, String>);

impl RequestParams {
    /// Empty parameter set
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Insert or replace a parameter
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Look up a parameter
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no parameters are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RequestParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        write!(f, "}}")
    }
}

/// Opaque routing key for a sub-pool
///
/// Built by a key strategy; the dispatcher only compares and hashes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    security: Option<SecurityContext>,
    params: Option<RequestParams>,
    label: Option<String>,
    separate_no_tx: bool,
}

impl PartitionKey {
    /// Key shared by every request
    pub fn single(separate_no_tx: bool) -> Self {
        Self {
            security: None,
            params: None,
            label: None,
            separate_no_tx,
        }
    }

    /// Key built from the security context
    pub fn for_security(security: Option<SecurityContext>, separate_no_tx: bool) -> Self {
        Self {
            security,
            ..Self::single(separate_no_tx)
        }
    }

    /// Key built from the request parameters
    pub fn for_params(params: Option<RequestParams>, separate_no_tx: bool) -> Self {
        Self {
            params,
            ..Self::single(separate_no_tx)
        }
    }

    /// Key built from both the security context and request parameters
    pub fn for_security_and_params(
        security: Option<SecurityContext>,
        params: Option<RequestParams>,
        separate_no_tx: bool,
    ) -> Self {
        Self {
            security,
            params,
            ..Self::single(separate_no_tx)
        }
    }

    /// Key built from a strategy-defined label
    pub fn custom(label: impl Into<String>, separate_no_tx: bool) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::single(separate_no_tx)
        }
    }

    /// Whether transactional traffic was split off into its own partition
    pub fn separate_no_tx(&self) -> bool {
        self.separate_no_tx
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        if let Some(security) = &self.security {
            write!(f, "security={} ", security)?;
        }
        if let Some(params) = &self.params {
            write!(f, "params={} ", params)?;
        }
        if let Some(label) = &self.label {
            write!(f, "label={} ", label)?;
        }
        write!(f, "tx={}]", self.separate_no_tx)
    }
}

/// How a flush treats idle and in-use resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Destroy idle resources only
    Idle,
    /// Destroy every resource, including those checked out
    All,
    /// Destroy idle resources; in-use resources are destroyed when returned
    Graceful,
}

impl Default for FlushMode {
    fn default() -> Self {
        FlushMode::Idle
    }
}

impl fmt::Display for FlushMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlushMode::Idle => "idle",
            FlushMode::All => "all",
            FlushMode::Graceful => "graceful",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_transaction_id_unique() {
        let a = TransactionId::new();
        let b = TransactionId::new();
        assert_ne!(a, b);
        assert_eq!(TransactionId::from_string(&a.to_string()), Some(a));
        assert_eq!(TransactionId::from_string("not-a-uuid"), None);
    }

    #[test]
    fn test_numeric_ids_monotonic() {
        let a = SubPoolId::next();
        let b = SubPoolId::next();
        assert!(b > a);
        assert_eq!(SubPoolId::from_raw(7).as_u64(), 7);
        assert_eq!(ResourceId::from_raw(3).to_string(), "resource-3");
    }

    #[test]
    fn test_security_context_debug_hides_credentials() {
        let ctx = SecurityContext::with_credentials("alice", "hunter2");
        let debug = format!("{:?}", ctx);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
        assert_eq!(ctx.credentials(), Some("hunter2"));
    }

    #[test]
    fn test_security_context_equality_includes_credentials() {
        let a = SecurityContext::with_credentials("alice", "one");
        let b = SecurityContext::with_credentials("alice", "two");
        assert_ne!(a, b);
        assert_eq!(a, SecurityContext::with_credentials("alice", "one"));
    }

    #[test]
    fn test_request_params_order_independent() {
        let a = RequestParams::new().with("db", "orders").with("schema", "v2");
        let b = RequestParams::new().with("schema", "v2").with("db", "orders");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "{db=orders,schema=v2}");
        assert_eq!(a.get("db"), Some("orders"));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_partition_key_separate_flag_splits() {
        let mut keys = HashSet::new();
        keys.insert(PartitionKey::single(false));
        keys.insert(PartitionKey::single(true));
        keys.insert(PartitionKey::single(false));
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_partition_key_variants_distinct() {
        let ctx = SecurityContext::new("alice");
        let params = RequestParams::new().with("db", "orders");
        let a = PartitionKey::for_security(Some(ctx.clone()), false);
        let b = PartitionKey::for_params(Some(params.clone()), false);
        let c = PartitionKey::for_security_and_params(Some(ctx), Some(params), false);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        assert_ne!(PartitionKey::custom("x", false), PartitionKey::single(false));
    }

    #[test]
    fn test_flush_mode_serde() {
        let json = serde_json::to_string(&FlushMode::Graceful).unwrap();
        assert_eq!(json, "\"graceful\"");
        let mode: FlushMode = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(mode, FlushMode::All);
        assert_eq!(FlushMode::default(), FlushMode::Idle);
    }

    mod params_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_insertion_order_does_not_change_key(
                pairs in prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,6}", 0..8)
            ) {
                let forward = pairs
                    .iter()
                    .fold(RequestParams::new(), |p, (k, v)| p.with(k.as_str(), v.as_str()));
                let backward = pairs
                    .iter()
                    .rev()
                    .fold(RequestParams::new(), |p, (k, v)| p.with(k.as_str(), v.as_str()));

                prop_assert_eq!(
                    PartitionKey::for_params(Some(forward.clone()), false),
                    PartitionKey::for_params(Some(backward), false)
                );
                prop_assert_eq!(forward.len(), pairs.len());
            }
        }
    }
}
