//! Native engine driver interface.
//!
//! The pool never talks to the cluster itself. Every call that reaches the
//! engine goes through a [`NativeDriver`]: cluster connect/disconnect,
//! session create/destroy, and the two dictionary lookups. Native objects are
//! exposed as opaque `Copy` handles so the coordination layer can pass them
//! between tasks without owning the underlying resources.
//!
//! Long-running calls (connect, readiness wait, session create, dictionary
//! calls) are asynchronous. Connect, readiness and session creation also have
//! blocking variants used by [`ConnectionPool::connect_blocking`].
//!
//! [`ConnectionPool::connect_blocking`]: crate::pool::ConnectionPool::connect_blocking

use std::fmt;
use std::future::Future;

use thiserror::Error;

use crate::metadata::RawTable;

/// Opaque handle to a native cluster connection object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClusterHandle(pub u64);

/// Opaque handle to a native session (an `Ndb` object).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// Opaque handle to the asynchronous completion context of a cluster connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AsyncContextHandle(pub u64);

impl fmt::Display for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster#{}", self.0)
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Error reported by the native engine, carried verbatim to callers.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("NDB error {code}: {message}")]
pub struct DriverError {
    /// Native error code.
    pub code: i32,
    /// Native error message.
    pub message: String,
}

impl DriverError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Capability interface over the native NDB client API.
///
/// Implementations must be cheap to share (`Arc<D>`) and safe to call from
/// any task. The coordination layer guarantees that at most one dictionary
/// call (`list_tables` / `get_table`) is outstanding per [`SessionHandle`].
pub trait NativeDriver: Send + Sync + 'static {
    /// Process-wide one-time initialization. Called once per registry.
    fn init(&self);

    /// Create a native cluster connection object for `connect_string`.
    /// Does not perform any I/O.
    fn create_cluster_connection(
        &self,
        connect_string: &str,
        name: &str,
    ) -> Result<ClusterHandle, DriverError>;

    /// Connect to the management server. Returns the native return code
    /// (0 on success).
    fn connect(
        &self,
        cluster: ClusterHandle,
        retries: u32,
        delay_secs: u32,
        verbose: bool,
    ) -> impl Future<Output = Result<i32, DriverError>> + Send;

    /// Blocking variant of [`NativeDriver::connect`].
    fn connect_blocking(
        &self,
        cluster: ClusterHandle,
        retries: u32,
        delay_secs: u32,
        verbose: bool,
    ) -> Result<i32, DriverError>;

    /// Wait for data nodes to become ready. Returns 0 when all nodes are
    /// ready, a positive count of nodes still not ready, or a negative value
    /// on timeout.
    fn wait_until_ready(
        &self,
        cluster: ClusterHandle,
        timeout_first_alive_secs: u32,
        timeout_after_first_alive_secs: u32,
    ) -> impl Future<Output = Result<i32, DriverError>> + Send;

    /// Blocking variant of [`NativeDriver::wait_until_ready`].
    fn wait_until_ready_blocking(
        &self,
        cluster: ClusterHandle,
        timeout_first_alive_secs: u32,
        timeout_after_first_alive_secs: u32,
    ) -> Result<i32, DriverError>;

    /// Node id assigned to this API node by the cluster.
    fn node_id(&self, cluster: ClusterHandle) -> u32;

    /// Free the native cluster connection object.
    fn destroy_cluster_connection(&self, cluster: ClusterHandle);

    /// Start the asynchronous completion listener for `cluster`.
    fn create_async_context(&self, cluster: ClusterHandle) -> Result<AsyncContextHandle, DriverError>;

    /// Stop the listener thread; the context must still be destroyed.
    fn shutdown_async_context(&self, context: AsyncContextHandle);

    /// Free the asynchronous completion context.
    fn destroy_async_context(&self, context: AsyncContextHandle);

    /// Create a session bound to `database`.
    fn create_session(
        &self,
        cluster: ClusterHandle,
        database: &str,
    ) -> impl Future<Output = Result<SessionHandle, DriverError>> + Send;

    /// Blocking variant of [`NativeDriver::create_session`].
    fn create_session_blocking(
        &self,
        cluster: ClusterHandle,
        database: &str,
    ) -> Result<SessionHandle, DriverError>;

    /// Free a native session.
    fn destroy_session(&self, session: SessionHandle);

    /// List the tables of `database` through the session's dictionary.
    fn list_tables(
        &self,
        session: SessionHandle,
        database: &str,
    ) -> impl Future<Output = Result<Vec<String>, DriverError>> + Send;

    /// Fetch the dictionary definition of `database.table`.
    fn get_table(
        &self,
        session: SessionHandle,
        database: &str,
        table: &str,
    ) -> impl Future<Output = Result<RawTable, DriverError>> + Send;
}
