//! Shared, reference-counted cluster connections.
//!
//! Only one native cluster connection exists per distinct connect string.
//! Every [`ConnectionPool`] using that string shares it through the
//! [`ConnectionRegistry`]; the connection is actually closed when its last
//! user releases it.
//!
//! ```text
//! pool A: registry.acquire("mgmd:1186")  → new ClusterConnection, refcount 1
//! pool B: registry.acquire("mgmd:1186")  → same connection,       refcount 2
//! pool A: registry.release("mgmd:1186")  → refcount 1, nothing happens
//! pool B: registry.release("mgmd:1186")  → refcount 0, close() + grace delay
//! ```
//!
//! [`ConnectionPool`]: crate::pool::ConnectionPool

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::PoolProperties;
use crate::driver::{AsyncContextHandle, ClusterHandle, NativeDriver};
use crate::error::{PoolError, PoolResult};
use crate::lock;
use crate::stats::{incr, ConnectionStats, ConnectionStatsSnapshot};

/// Delay between the start of a close and freeing the native handle.
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Name the cluster sees for connections made through this crate.
pub const DEFAULT_CONNECTION_NAME: &str = "ndb-pool";

#[derive(Debug, Default)]
struct ConnectionState {
    handle: Option<ClusterHandle>,
    reference_count: usize,
    connected: bool,
    disconnecting: bool,
    async_context: Option<AsyncContextHandle>,
}

/// One native cluster connection, shared by every pool using its connect string.
pub struct ClusterConnection<D: NativeDriver> {
    connect_string: String,
    name: String,
    disconnect_grace: Duration,
    driver: Arc<D>,
    state: Mutex<ConnectionState>,
    stats: ConnectionStats,
}

impl<D: NativeDriver> ClusterConnection<D> {
    fn new(
        driver: Arc<D>,
        connect_string: &str,
        name: &str,
        disconnect_grace: Duration,
    ) -> PoolResult<Self> {
        let handle = driver.create_cluster_connection(connect_string, name)?;
        Ok(Self {
            connect_string: connect_string.to_string(),
            name: name.to_string(),
            disconnect_grace,
            driver,
            state: Mutex::new(ConnectionState {
                handle: Some(handle),
                reference_count: 1,
                ..ConnectionState::default()
            }),
            stats: ConnectionStats::default(),
        })
    }

    pub fn connect_string(&self) -> &str {
        &self.connect_string
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn is_disconnecting(&self) -> bool {
        lock(&self.state).disconnecting
    }

    /// Connected and not on its way down; new sessions may be created.
    pub fn is_usable(&self) -> bool {
        let state = lock(&self.state);
        state.connected && !state.disconnecting
    }

    pub fn reference_count(&self) -> usize {
        lock(&self.state).reference_count
    }

    /// Native handle, `None` once the connection has been torn down.
    pub fn handle(&self) -> Option<ClusterHandle> {
        lock(&self.state).handle
    }

    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.stats.snapshot(&self.connect_string, self.reference_count())
    }

    /// Connect to the cluster and wait for data nodes.
    ///
    /// Succeeds immediately when already connected. A non-zero native return
    /// code is [`PoolError::ConnectFailed`]; a negative readiness result is
    /// [`PoolError::ReadinessTimeout`]. Either way the connection stays valid
    /// and `connect` may be retried.
    pub async fn connect(&self, properties: &PoolProperties) -> PoolResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        incr(&self.stats.connect_async);

        let cluster = self.ensure_handle()?;
        let code = match self
            .driver
            .connect(
                cluster,
                properties.connect_retries,
                properties.connect_delay,
                properties.connect_verbose,
            )
            .await
        {
            Ok(code) => code,
            Err(e) => {
                incr(&self.stats.connections_failed);
                return Err(e.into());
            }
        };
        debug!(connect_string = %self.connect_string, code, "native connect returned");
        if code != 0 {
            incr(&self.stats.connections_failed);
            warn!(connect_string = %self.connect_string, code, "NDB connect failed");
            return Err(PoolError::ConnectFailed { code });
        }
        incr(&self.stats.connections_successful);

        let nodes = self
            .driver
            .wait_until_ready(
                cluster,
                properties.ready_timeout_first,
                properties.ready_timeout_after,
            )
            .await?;
        self.on_ready(cluster, nodes)
    }

    /// Blocking connect for simple startup paths. Returns whether the
    /// connection is connected afterwards.
    pub fn connect_blocking(&self, properties: &PoolProperties) -> bool {
        if self.is_connected() {
            return true;
        }
        incr(&self.stats.connect_sync);

        let cluster = match self.ensure_handle() {
            Ok(cluster) => cluster,
            Err(e) => {
                warn!(connect_string = %self.connect_string, error = %e, "cannot create cluster connection");
                return false;
            }
        };
        match self.driver.connect_blocking(
            cluster,
            properties.connect_retries,
            properties.connect_delay,
            properties.connect_verbose,
        ) {
            Ok(0) => incr(&self.stats.connections_successful),
            Ok(code) => {
                incr(&self.stats.connections_failed);
                warn!(connect_string = %self.connect_string, code, "NDB connect failed");
                return false;
            }
            Err(e) => {
                incr(&self.stats.connections_failed);
                warn!(connect_string = %self.connect_string, error = %e, "NDB connect failed");
                return false;
            }
        }

        match self.driver.wait_until_ready_blocking(
            cluster,
            properties.ready_timeout_first,
            properties.ready_timeout_after,
        ) {
            Ok(nodes) => self.on_ready(cluster, nodes).is_ok(),
            Err(e) => {
                warn!(connect_string = %self.connect_string, error = %e, "readiness wait failed");
                false
            }
        }
    }

    fn on_ready(&self, cluster: ClusterHandle, nodes: i32) -> PoolResult<()> {
        if nodes < 0 {
            incr(&self.stats.readiness_timeouts);
            warn!(connect_string = %self.connect_string, "timeout waiting for cluster to become ready");
            return Err(PoolError::ReadinessTimeout);
        }
        let node_id = self.driver.node_id(cluster);
        if nodes > 0 {
            warn!(not_ready = nodes, "only part of the data nodes are running");
        }
        info!(connect_string = %self.connect_string, node_id, "connected to cluster");
        self.stats.record_node_id(node_id);
        lock(&self.state).connected = true;
        Ok(())
    }

    /// A connection torn down by a previous close gets a fresh native handle.
    fn ensure_handle(&self) -> PoolResult<ClusterHandle> {
        let mut state = lock(&self.state);
        if let Some(handle) = state.handle {
            return Ok(handle);
        }
        let handle = self
            .driver
            .create_cluster_connection(&self.connect_string, &self.name)?;
        debug!(connect_string = %self.connect_string, %handle, "recreated native cluster connection");
        state.handle = Some(handle);
        Ok(handle)
    }

    /// The asynchronous completion context, created on first use.
    pub fn async_context(&self) -> PoolResult<AsyncContextHandle> {
        let mut state = lock(&self.state);
        if let Some(context) = state.async_context {
            return Ok(context);
        }
        let cluster = state.handle.ok_or(PoolError::NotConnected)?;
        let context = self.driver.create_async_context(cluster)?;
        state.async_context = Some(context);
        Ok(context)
    }

    /// Close the connection.
    ///
    /// A never-connected connection frees its resources at once. A close
    /// arriving while another is in progress fails with
    /// [`PoolError::AlreadyDisconnecting`] and changes nothing. Otherwise the
    /// async listener is shut down and the native handle is freed after the
    /// grace delay, leaving in-flight asynchronous work time to drain.
    pub async fn close(&self) -> PoolResult<()> {
        let listener = {
            let mut state = lock(&self.state);
            if !state.connected {
                drop(state);
                self.teardown();
                return Ok(());
            }
            if state.disconnecting {
                incr(&self.stats.simultaneous_disconnects);
                return Err(PoolError::AlreadyDisconnecting);
            }
            state.disconnecting = true;
            state.async_context
        };

        if let Some(context) = listener {
            self.driver.shutdown_async_context(context);
        }
        debug!(
            connect_string = %self.connect_string,
            grace = ?self.disconnect_grace,
            "cluster disconnect scheduled"
        );
        tokio::time::sleep(self.disconnect_grace).await;
        self.teardown();
        Ok(())
    }

    fn teardown(&self) {
        let (context, handle) = {
            let mut state = lock(&self.state);
            state.connected = false;
            state.disconnecting = false;
            (state.async_context.take(), state.handle.take())
        };
        if let Some(context) = context {
            self.driver.destroy_async_context(context);
        }
        if let Some(handle) = handle {
            self.driver.destroy_cluster_connection(handle);
            info!(connect_string = %self.connect_string, "disconnected from cluster");
        }
    }

    fn retain(&self) -> usize {
        let mut state = lock(&self.state);
        state.reference_count += 1;
        state.reference_count
    }

    /// Drop one reference. Underflow is a caller bug and panics.
    fn release_reference(&self) -> usize {
        let remaining = {
            let mut state = lock(&self.state);
            let remaining = state.reference_count.checked_sub(1);
            if let Some(count) = remaining {
                state.reference_count = count;
            }
            remaining
        };
        match remaining {
            Some(count) => count,
            None => panic!(
                "cluster connection {} released more times than acquired",
                self.connect_string
            ),
        }
    }
}

impl<D: NativeDriver> std::fmt::Debug for ClusterConnection<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("connect_string", &self.connect_string)
            .field("state", &*lock(&self.state))
            .finish_non_exhaustive()
    }
}

/// Process-wide table of shared cluster connections keyed by connect string.
///
/// Constructed explicitly and handed to every pool that should share
/// connections. The driver's `init()` runs on the first `acquire`. Entries
/// are created on first acquire and removed once their reference count
/// returns to zero and the close completes.
pub struct ConnectionRegistry<D: NativeDriver> {
    driver: Arc<D>,
    name: String,
    disconnect_grace: Duration,
    init: Once,
    connections: Mutex<HashMap<String, Arc<ClusterConnection<D>>>>,
}

impl<D: NativeDriver> ConnectionRegistry<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self {
            driver,
            name: DEFAULT_CONNECTION_NAME.to_string(),
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            init: Once::new(),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Builder method: set the name the cluster sees for new connections.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Builder method: set the grace delay applied by `close`.
    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Get the shared connection for `connect_string`, creating it with a
    /// reference count of 1 or bumping the count of the existing one.
    ///
    /// An entry whose last reference is already gone is on its way down and
    /// is replaced by a fresh connection; its close finishes on its own.
    pub fn acquire(&self, connect_string: &str) -> PoolResult<Arc<ClusterConnection<D>>> {
        self.init.call_once(|| {
            self.driver.init();
            debug!("native driver initialized");
        });

        let mut connections = lock(&self.connections);
        if let Some(existing) = connections.get(connect_string) {
            if existing.reference_count() > 0 {
                let reference_count = existing.retain();
                debug!(connect_string, reference_count, "sharing cluster connection");
                return Ok(Arc::clone(existing));
            }
            debug!(connect_string, "replacing cluster connection that is closing");
        }

        let connection = Arc::new(ClusterConnection::new(
            Arc::clone(&self.driver),
            connect_string,
            &self.name,
            self.disconnect_grace,
        )?);
        connections.insert(connect_string.to_string(), Arc::clone(&connection));
        debug!(connect_string, "created cluster connection");
        Ok(connection)
    }

    /// Release one reference to the connection for `connect_string`.
    ///
    /// Closes the connection when the count reaches zero. Releasing more
    /// often than acquiring panics.
    pub async fn release(&self, connect_string: &str) -> PoolResult<()> {
        // Decrement under the registry lock so `acquire` never revives a
        // connection whose close has been decided.
        let (connection, remaining) = {
            let connections = lock(&self.connections);
            let Some(connection) = connections.get(connect_string).cloned() else {
                drop(connections);
                panic!("cluster connection {connect_string} released more times than acquired");
            };
            let remaining = connection.release_reference();
            (connection, remaining)
        };
        if remaining > 0 {
            debug!(connect_string, reference_count = remaining, "cluster connection still in use");
            return Ok(());
        }

        let result = connection.close().await;

        // A re-acquire during the grace delay installed a new entry; keep it.
        let mut connections = lock(&self.connections);
        let unused = connections
            .get(connect_string)
            .is_some_and(|current| Arc::ptr_eq(current, &connection) && current.reference_count() == 0);
        if unused {
            connections.remove(connect_string);
        }
        result
    }

    /// Current reference count for `connect_string`, 0 when absent.
    pub fn reference_count(&self, connect_string: &str) -> usize {
        lock(&self.connections)
            .get(connect_string)
            .map(|c| c.reference_count())
            .unwrap_or(0)
    }

    pub fn contains(&self, connect_string: &str) -> bool {
        lock(&self.connections).contains_key(connect_string)
    }

    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D: NativeDriver> std::fmt::Debug for ConnectionRegistry<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("name", &self.name)
            .field("connections", &self.len())
            .finish_non_exhaustive()
    }
}
