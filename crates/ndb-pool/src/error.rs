//! Error types for the connection pool.

use thiserror::Error;

use crate::driver::DriverError;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by connection, session and dictionary operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("NDB connect failed with code {code}")]
    ConnectFailed { code: i32 },

    #[error("timeout waiting for cluster to become ready")]
    ReadinessTimeout,

    #[error("already disconnecting")]
    AlreadyDisconnecting,

    #[error("connection pool is not connected")]
    NotConnected,

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("session {0} does not belong to this pool")]
    ForeignSession(u64),

    #[error("dictionary calls require a running tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Dictionary(#[from] DictionaryError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid table mapping: {0}")]
    Mapping(String),
}

/// Outcome of a failed dictionary call.
///
/// One value is cloned to every waiter of a pending group, so it must be
/// `Clone`.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum DictionaryError {
    #[error("dictionary call failed: {0}")]
    Native(DriverError),

    #[error("column {column} has an undecodable default value: {reason}")]
    InvalidDefault { column: String, reason: String },

    #[error("connection pool is closing")]
    PoolClosing,

    #[error("dictionary call was abandoned before completion")]
    Abandoned,
}

impl PoolError {
    /// True for the dictionary error every waiter receives when its pool closes.
    pub fn is_pool_closing(&self) -> bool {
        matches!(self, PoolError::Dictionary(DictionaryError::PoolClosing))
    }
}
