//! ndb-pool: connection pooling and dictionary coordination for NDB clusters.
//!
//! Sits between application code and a native NDB client driver:
//!
//! - [`connection`]: one reference-counted cluster connection per connect
//!   string, shared across pools through a [`ConnectionRegistry`].
//! - [`session`]: pooled native sessions with background prefetching.
//! - [`dictionary`]: single-flight dictionary lookups keyed by table, and
//!   FIFO serialization of distinct lookups per session.
//! - [`pool`]: the [`ConnectionPool`] facade composing the above.
//!
//! The driver itself is abstracted by [`NativeDriver`]; [`memory::MemoryDriver`]
//! is an in-process implementation for tests and tooling.

pub mod config;
pub mod connection;
pub mod dictionary;
pub mod driver;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod pool;
pub mod session;
pub mod stats;
pub mod table_handler;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::PoolProperties;
pub use connection::{ClusterConnection, ConnectionRegistry};
pub use dictionary::DictionaryReply;
pub use driver::{AsyncContextHandle, ClusterHandle, DriverError, NativeDriver, SessionHandle};
pub use error::{DictionaryError, PoolError, PoolResult};
pub use metadata::{Column, ColumnType, DefaultValue, RawColumn, RawTable, TableMetadata, TypedValue};
pub use pool::ConnectionPool;
pub use session::{DictionaryLock, Session};
pub use table_handler::{TableHandler, TableMapping};

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
