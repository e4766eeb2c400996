//! The connection pool facade.
//!
//! A [`ConnectionPool`] owns one database's worth of sessions on a shared
//! cluster connection:
//!
//! ```text
//! connect()
//!   → registry.acquire(connect_string)      shared ClusterConnection
//!   → connection.connect()                  native connect + readiness
//!   → create dictionary session             default session for lookups
//!   → spawn prefetch                        fill free list to session_pool_min
//!
//! close()
//!   → fail pending dictionary groups        PoolClosing to every waiter
//!   → drop queued calls, await in-flight    then destroy dictionary session
//!   → destroy free list
//!   → registry.release(connect_string)      closes the connection at refcount 0
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PoolProperties;
use crate::connection::{ClusterConnection, ConnectionRegistry};
use crate::dictionary::{DictionaryCoordinator, DictionaryReply};
use crate::driver::NativeDriver;
use crate::error::{DictionaryError, PoolError, PoolResult};
use crate::lock;
use crate::metadata::TableMetadata;
use crate::session::{Session, SessionPool};
use crate::stats::{incr, ConnectionStatsSnapshot, PoolStats, PoolStatsSnapshot};
use crate::table_handler::{TableHandler, TableMapping};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

pub struct ConnectionPool<D: NativeDriver> {
    id: u64,
    properties: PoolProperties,
    registry: Arc<ConnectionRegistry<D>>,
    connection: Mutex<Option<Arc<ClusterConnection<D>>>>,
    dictionary_session: Mutex<Option<Session>>,
    sessions: Arc<SessionPool<D>>,
    dictionary: DictionaryCoordinator<D>,
    prefetch: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    stats: Arc<PoolStats>,
}

impl<D: NativeDriver> ConnectionPool<D> {
    /// Create an unconnected pool. Fails if `properties` do not validate.
    pub fn new(properties: PoolProperties, registry: Arc<ConnectionRegistry<D>>) -> PoolResult<Self> {
        properties.validate()?;
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let driver = Arc::clone(registry.driver());
        let stats = Arc::new(PoolStats::default());
        Ok(Self {
            id,
            sessions: Arc::new(SessionPool::new(
                id,
                Arc::clone(&driver),
                &properties,
                Arc::clone(&stats),
            )),
            dictionary: DictionaryCoordinator::new(id, driver, Arc::clone(&stats)),
            properties,
            registry,
            connection: Mutex::new(None),
            dictionary_session: Mutex::new(None),
            prefetch: Mutex::new(None),
            closed: AtomicBool::new(false),
            stats,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn properties(&self) -> &PoolProperties {
        &self.properties
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<D>> {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Connected, holding a dictionary session, and not closed.
    pub fn is_connected(&self) -> bool {
        !self.is_closed()
            && lock(&self.dictionary_session).is_some()
            && self.connection().is_some_and(|c| c.is_connected())
    }

    /// The shared cluster connection, once acquired.
    pub fn connection(&self) -> Option<Arc<ClusterConnection<D>>> {
        lock(&self.connection).clone()
    }

    /// Take the pool's reference to the shared connection, at most once.
    fn acquire(&self) -> PoolResult<Arc<ClusterConnection<D>>> {
        let mut slot = lock(&self.connection);
        if let Some(connection) = slot.as_ref() {
            return Ok(Arc::clone(connection));
        }
        let connection = self.registry.acquire(&self.properties.connect_string)?;
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    fn ensure_open(&self) -> PoolResult<()> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        Ok(())
    }

    /// Connect the pool.
    ///
    /// Errors from the cluster connect ([`PoolError::ConnectFailed`],
    /// [`PoolError::ReadinessTimeout`]) leave the pool unconnected; calling
    /// `connect` again retries.
    pub async fn connect(&self) -> PoolResult<()> {
        self.ensure_open()?;
        if self.is_connected() {
            return Ok(());
        }
        incr(&self.stats.connect_async);

        let connection = self.acquire()?;
        connection.connect(&self.properties).await?;
        if lock(&self.dictionary_session).is_none() {
            let session = self.sessions.create(&connection).await?;
            self.install_dictionary_session(session);
        }
        self.on_connected(connection)
    }

    /// Blocking connect for startup paths. Returns whether the pool is
    /// connected afterwards; failures are logged.
    pub fn connect_blocking(&self) -> bool {
        if self.is_closed() {
            warn!(pool = self.id, "connect on closed pool");
            return false;
        }
        if self.is_connected() {
            return true;
        }
        incr(&self.stats.connect_sync);

        let connection = match self.acquire() {
            Ok(connection) => connection,
            Err(e) => {
                warn!(pool = self.id, error = %e, "cannot acquire cluster connection");
                return false;
            }
        };
        if !connection.connect_blocking(&self.properties) {
            return false;
        }
        if lock(&self.dictionary_session).is_none() {
            match self.sessions.create_blocking(&connection) {
                Ok(session) => self.install_dictionary_session(session),
                Err(e) => {
                    warn!(pool = self.id, error = %e, "cannot create dictionary session");
                    return false;
                }
            }
        }
        match self.on_connected(connection) {
            Ok(()) => true,
            Err(e) => {
                warn!(pool = self.id, error = %e, "connection pool setup failed");
                false
            }
        }
    }

    fn install_dictionary_session(&self, session: Session) {
        let rejected = {
            let mut slot = lock(&self.dictionary_session);
            match slot.as_ref() {
                Some(_) => Some(session),
                None => {
                    debug!(pool = self.id, session = session.id(), "dictionary session created");
                    *slot = Some(session);
                    None
                }
            }
        };
        // A concurrent connect got there first.
        if let Some(session) = rejected {
            self.sessions.destroy_detached(&session);
        }
    }

    fn on_connected(&self, connection: Arc<ClusterConnection<D>>) -> PoolResult<()> {
        if self.properties.use_async_context {
            connection.async_context()?;
        }
        info!(
            pool = self.id,
            connect_string = %self.properties.connect_string,
            database = %self.properties.database,
            "connection pool connected"
        );
        // One prefetch task at a time; a concurrent connect reuses the running one.
        let mut prefetch = lock(&self.prefetch);
        if prefetch.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!(pool = self.id, "session prefetch already running");
            return Ok(());
        }
        *prefetch = self.sessions.prefetch(connection);
        Ok(())
    }

    /// Wait for the background prefetch started by `connect` to finish.
    pub async fn prefetch_complete(&self) {
        let handle = lock(&self.prefetch).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(pool = self.id, error = %e, "session prefetch task failed");
            }
        }
    }

    fn live_connection(&self) -> PoolResult<Arc<ClusterConnection<D>>> {
        self.ensure_open()?;
        self.connection()
            .filter(|c| c.is_connected())
            .ok_or(PoolError::NotConnected)
    }

    /// Get a session from the free list, or a new one.
    pub async fn get_session(&self) -> PoolResult<Session> {
        let connection = self.live_connection()?;
        self.sessions.get_session(&connection).await
    }

    /// Return a session obtained from [`get_session`](Self::get_session).
    pub fn release_session(&self, session: Session) -> PoolResult<()> {
        if session.pool_id() != self.id {
            return Err(PoolError::ForeignSession(session.id()));
        }
        let disconnecting = self.connection().is_none_or(|c| !c.is_usable());
        self.sessions.release_session(session, disconnecting);
        Ok(())
    }

    fn dictionary_target(&self, session: Option<&Session>) -> PoolResult<Session> {
        if self.is_closed() {
            return Err(DictionaryError::PoolClosing.into());
        }
        match session {
            Some(session) if session.pool_id() != self.id => Err(PoolError::ForeignSession(session.id())),
            Some(session) => Ok(session.clone()),
            None => lock(&self.dictionary_session)
                .clone()
                .ok_or(PoolError::NotConnected),
        }
    }

    /// List the tables of `database`.
    ///
    /// Uses `session` for the native call, or the pool's dictionary session
    /// when `None`. Concurrent requests for the same database share one call.
    pub fn list_tables(&self, database: &str, session: Option<&Session>) -> DictionaryReply<Vec<String>> {
        match self.dictionary_target(session) {
            Ok(session) => self.dictionary.list_tables(&session, database),
            Err(e) => DictionaryReply::failed(e),
        }
    }

    /// Fetch the metadata of `database.table`, with column defaults decoded.
    pub fn get_table_metadata(
        &self,
        database: &str,
        table: &str,
        session: Option<&Session>,
    ) -> DictionaryReply<TableMetadata> {
        match self.dictionary_target(session) {
            Ok(session) => self.dictionary.get_table_metadata(&session, database, table),
            Err(e) => DictionaryReply::failed(e),
        }
    }

    /// Bind application fields to the columns of `table`. `None` maps every
    /// column to a field of the same name.
    pub fn create_table_handler(
        &self,
        table: Arc<TableMetadata>,
        mapping: Option<&TableMapping>,
    ) -> PoolResult<TableHandler> {
        let default_mapping = TableMapping::default();
        let handler = TableHandler::new(table, mapping.unwrap_or(&default_mapping))?;
        debug!(pool = self.id, table = %handler.table().qualified_name(), "table handler created");
        Ok(handler)
    }

    /// Close the pool and release its reference to the shared connection.
    ///
    /// Every pending dictionary request fails with
    /// [`DictionaryError::PoolClosing`]. A dictionary call already running on
    /// the dictionary session is allowed to finish before the session is
    /// destroyed. Closing twice is a no-op.
    pub async fn close(&self) -> PoolResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.sessions.mark_closing();
        let failed_waiters = self.dictionary.close();

        self.prefetch_complete().await;

        let dictionary_session = lock(&self.dictionary_session).take();
        if let Some(session) = dictionary_session {
            for call in session.drain_queue() {
                debug!(pool = self.id, key = call.key(), "dropped queued dictionary call");
            }
            session.dictionary_idle().await;
            self.sessions.destroy_detached(&session);
        }
        let destroyed = self.sessions.destroy_all();

        let connection = lock(&self.connection).take();
        let released = match connection {
            Some(connection) => self.registry.release(connection.connect_string()).await,
            None => Ok(()),
        };

        info!(
            pool = self.id,
            failed_waiters,
            destroyed_sessions = destroyed,
            "connection pool closed"
        );
        self.stats.snapshot().log(self.id);
        released
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn connection_stats(&self) -> Option<ConnectionStatsSnapshot> {
        self.connection().map(|c| c.stats())
    }

    /// Sessions on the free list.
    pub fn free_sessions(&self) -> usize {
        self.sessions.free_count()
    }

    pub fn dictionary_session(&self) -> Option<Session> {
        lock(&self.dictionary_session).clone()
    }

    /// Waiters in the pending `list_tables` group for `database`.
    pub fn pending_list_tables(&self, database: &str) -> usize {
        self.dictionary.pending_list_tables(database)
    }

    /// Waiters in the pending `get_table_metadata` group for `database.table`.
    pub fn pending_table_metadata(&self, database: &str, table: &str) -> usize {
        self.dictionary.pending_table_metadata(database, table)
    }

    /// Pending dictionary groups across both lookup kinds.
    pub fn pending_groups(&self) -> usize {
        self.dictionary.pending_groups()
    }
}

impl<D: NativeDriver> std::fmt::Debug for ConnectionPool<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.id)
            .field("connect_string", &self.properties.connect_string)
            .field("database", &self.properties.database)
            .field("closed", &self.is_closed())
            .field("free_sessions", &self.free_sessions())
            .finish_non_exhaustive()
    }
}
