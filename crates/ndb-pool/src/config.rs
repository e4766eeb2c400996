//! Connection pool properties.
//!
//! Parsed from TOML; every key is optional and falls back to the defaults
//! below.
//!
//! ```toml
//! connect_string = "mgmd.internal:1186"
//! database = "inventory"
//! session_pool_min = 2
//! session_pool_max = 32
//! use_async_context = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolProperties {
    /// Management server connect string. Pools with the same string share
    /// one cluster connection.
    pub connect_string: String,
    /// Default database for sessions and dictionary lookups.
    pub database: String,
    /// Native connect retries (default: 4).
    pub connect_retries: u32,
    /// Delay between connect retries in seconds (default: 5).
    pub connect_delay: u32,
    /// Verbose native connect logging.
    pub connect_verbose: bool,
    /// Seconds to wait for the first data node (default: 1).
    pub ready_timeout_first: u32,
    /// Seconds to wait for the remaining data nodes after the first (default: 1).
    pub ready_timeout_after: u32,
    /// Sessions to keep prefetched on the free list (default: 4).
    pub session_pool_min: usize,
    /// Free-list capacity; released sessions beyond it are destroyed (default: 100).
    pub session_pool_max: usize,
    /// Start the asynchronous completion context on connect.
    pub use_async_context: bool,
}

impl Default for PoolProperties {
    fn default() -> Self {
        Self {
            connect_string: "localhost:1186".to_string(),
            database: "test".to_string(),
            connect_retries: 4,
            connect_delay: 5,
            connect_verbose: false,
            ready_timeout_first: 1,
            ready_timeout_after: 1,
            session_pool_min: 4,
            session_pool_max: 100,
            use_async_context: false,
        }
    }
}

impl PoolProperties {
    pub fn from_file(path: &Path) -> PoolResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PoolError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> PoolResult<Self> {
        let properties: PoolProperties =
            toml::from_str(content).map_err(|e| PoolError::Config(e.to_string()))?;
        properties.validate()?;
        Ok(properties)
    }

    pub fn to_toml_string(&self) -> PoolResult<String> {
        toml::to_string_pretty(self).map_err(|e| PoolError::Config(e.to_string()))
    }

    /// Reject property sets the pool cannot operate with.
    pub fn validate(&self) -> PoolResult<()> {
        if self.connect_string.trim().is_empty() {
            return Err(PoolError::Config("connect_string must not be empty".to_string()));
        }
        if self.database.trim().is_empty() {
            return Err(PoolError::Config("database must not be empty".to_string()));
        }
        if self.session_pool_min > self.session_pool_max {
            return Err(PoolError::Config(format!(
                "session_pool_min ({}) exceeds session_pool_max ({})",
                self.session_pool_min, self.session_pool_max
            )));
        }
        Ok(())
    }
}
