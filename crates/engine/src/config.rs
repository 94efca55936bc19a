//! Pool configuration via `poolgate.toml`
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Validation runs eagerly on load.

use poolgate_core::{PoolError, PoolResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Conventional config file name
pub const CONFIG_FILE_NAME: &str = "poolgate.toml";

/// Which built-in key strategy partitions the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// One partition for every request
    Single,
    /// One partition per security context
    BySecurityContext,
    /// One partition per request parameter set
    ByRequestParams,
    /// One partition per (security context, request parameters) pair
    BySecurityContextAndParams,
}

impl Default for StrategyKind {
    fn default() -> Self {
        StrategyKind::Single
    }
}

/// Sizing increments applied when the pool grows or shrinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Resources created per growth step
    #[serde(default = "default_step")]
    pub increment: usize,
    /// Resources destroyed per shrink step
    #[serde(default = "default_step")]
    pub decrement: usize,
}

fn default_step() -> usize {
    1
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            increment: default_step(),
            decrement: default_step(),
        }
    }
}

/// Pool configuration loaded from `poolgate.toml`.
///
/// # Example
///
/// ```toml
/// name = "orders"
/// min_size = 2
/// max_size = 16
/// prefill = true
/// strategy = "by-security-context"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name used in logs and errors
    #[serde(default = "default_name")]
    pub name: String,
    /// Minimum resources per sub-pool (prefill target)
    #[serde(default)]
    pub min_size: usize,
    /// Maximum resources per sub-pool
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Initial prefill size, clamped to `[min_size, max_size]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_size: Option<usize>,
    /// Pre-populate sub-pools
    #[serde(default)]
    pub prefill: bool,
    /// How long a sub-pool acquire waits when the sub-pool is full
    #[serde(default = "default_blocking_timeout_ms")]
    pub blocking_timeout_ms: u64,
    /// Idle age after which free resources are evicted
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Keep transactional and non-transactional traffic in separate sub-pools
    #[serde(default)]
    pub no_tx_separate_pools: bool,
    /// Whether connections are sharable
    #[serde(default = "default_true")]
    pub sharable: bool,
    /// Whether interleaving is enabled
    #[serde(default)]
    pub interleaving: bool,
    /// Built-in key strategy
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Growth / shrink policy
    #[serde(default)]
    pub capacity: Capacity,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_max_size() -> usize {
    20
}

fn default_blocking_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    600_000
}

fn default_true() -> bool {
    true
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            min_size: 0,
            max_size: default_max_size(),
            initial_size: None,
            prefill: false,
            blocking_timeout_ms: default_blocking_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            no_tx_separate_pools: false,
            sharable: true,
            interleaving: false,
            strategy: StrategyKind::default(),
            capacity: Capacity::default(),
        }
    }
}

impl PoolConfig {
    /// Default configuration under a different name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Check sizing constraints
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` if `max_size` is zero, `min_size` exceeds
    /// `max_size`, or a capacity step is zero.
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_size == 0 {
            return Err(PoolError::config("max_size must be greater than 0"));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::config(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.capacity.increment == 0 || self.capacity.decrement == 0 {
            return Err(PoolError::config("capacity steps must be greater than 0"));
        }
        Ok(())
    }

    /// Number of resources a prefill should reach
    pub fn prefill_target(&self) -> usize {
        self.initial_size
            .unwrap_or(self.min_size)
            .clamp(self.min_size, self.max_size)
    }

    /// Blocking timeout as a `Duration`
    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }

    /// Idle timeout as a `Duration`
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> PoolResult<Self> {
        let config: PoolConfig = toml::from_str(content)
            .map_err(|e| PoolError::config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: &Path) -> PoolResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| match e {
            PoolError::Config(msg) => {
                PoolError::Config(format!("{} ({})", msg, path.display()))
            }
            other => other,
        })
    }

    /// Serialize this config to TOML and write it to `path`
    pub fn write_to_file(&self, path: &Path) -> PoolResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PoolError::config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Pool dispatcher configuration
name = "default"

# Sub-pool sizing
min_size = 0
max_size = 20
# initial_size = 5

# Pre-populate sub-pools up to min_size / initial_size
prefill = false

# Milliseconds an acquire waits on a full sub-pool
blocking_timeout_ms = 30000

# Milliseconds before an idle resource is evicted
idle_timeout_ms = 600000

# Separate sub-pools for transactional and non-transactional traffic
no_tx_separate_pools = false

sharable = true
interleaving = false

# "single", "by-security-context", "by-request-params",
# or "by-security-context-and-params"
strategy = "single"
"#
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> PoolResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }
}
