//! In-process [`NativeDriver`] backed by a static table catalog.
//!
//! Used by the test suite and by the `ndbpool` CLI. Every call is recorded
//! so tests can assert on exactly which native operations a pool issued,
//! and failures can be injected for connect, readiness and session creation.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::{AsyncContextHandle, ClusterHandle, DriverError, NativeDriver, SessionHandle};
use crate::error::{PoolError, PoolResult};
use crate::lock;
use crate::metadata::RawTable;

/// Node id every [`MemoryDriver`] cluster connection reports.
pub const MEMORY_NODE_ID: u32 = 49;

/// Native error code for a table missing from the dictionary.
pub const NO_SUCH_TABLE: i32 = 723;

/// Tables served by a [`MemoryDriver`].
///
/// ```toml
/// [[tables]]
/// database = "inventory"
/// name = "items"
///
/// [[tables.columns]]
/// name = "id"
/// column_type = "int"
/// primary_key = true
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub tables: Vec<RawTable>,
}

impl Catalog {
    pub fn from_file(path: &Path) -> PoolResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PoolError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> PoolResult<Self> {
        toml::from_str(content).map_err(|e| PoolError::Config(e.to_string()))
    }

    /// Builder method: add a table.
    pub fn with_table(mut self, table: RawTable) -> Self {
        self.tables.push(table);
        self
    }

    fn table_names(&self, database: &str) -> Vec<String> {
        self.tables
            .iter()
            .filter(|t| t.database == database)
            .map(|t| t.name.clone())
            .collect()
    }

    fn find(&self, database: &str, table: &str) -> Option<&RawTable> {
        self.tables
            .iter()
            .find(|t| t.database == database && t.name == table)
    }
}

/// One recorded native call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverCall {
    Init,
    CreateCluster { connect_string: String },
    Connect { cluster: ClusterHandle },
    WaitUntilReady { cluster: ClusterHandle },
    DestroyCluster { cluster: ClusterHandle },
    CreateAsyncContext { cluster: ClusterHandle },
    ShutdownAsyncContext { context: AsyncContextHandle },
    DestroyAsyncContext { context: AsyncContextHandle },
    CreateSession { database: String },
    DestroySession { session: SessionHandle },
    ListTables { session: SessionHandle, database: String },
    GetTable { session: SessionHandle, database: String, table: String },
}

#[derive(Debug)]
struct DriverState {
    catalog: Catalog,
    calls: Vec<DriverCall>,
    next_handle: u64,
    clusters: HashSet<ClusterHandle>,
    sessions: HashSet<SessionHandle>,
    contexts: HashSet<AsyncContextHandle>,
    connect_code: i32,
    ready_result: i32,
    failing_sessions: usize,
    in_flight: HashMap<SessionHandle, usize>,
    max_overlap: usize,
}

impl DriverState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// In-memory driver. Handles are unique across all object kinds.
#[derive(Debug)]
pub struct MemoryDriver {
    state: Mutex<DriverState>,
    latency: Duration,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new(Catalog::default())
    }
}

impl MemoryDriver {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            state: Mutex::new(DriverState {
                catalog,
                calls: Vec::new(),
                next_handle: 0,
                clusters: HashSet::new(),
                sessions: HashSet::new(),
                contexts: HashSet::new(),
                connect_code: 0,
                ready_result: 0,
                failing_sessions: 0,
                in_flight: HashMap::new(),
                max_overlap: 0,
            }),
            latency: Duration::ZERO,
        }
    }

    /// Builder method: delay every asynchronous call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Return code for subsequent connects (0 = success).
    pub fn set_connect_code(&self, code: i32) {
        lock(&self.state).connect_code = code;
    }

    /// Result for subsequent readiness waits (negative = timeout).
    pub fn set_ready_result(&self, result: i32) {
        lock(&self.state).ready_result = result;
    }

    /// Make the next `count` session creations fail.
    pub fn fail_next_sessions(&self, count: usize) {
        lock(&self.state).failing_sessions = count;
    }

    pub fn add_table(&self, table: RawTable) {
        lock(&self.state).catalog.tables.push(table);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        lock(&self.state).calls.clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&DriverCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn live_clusters(&self) -> usize {
        lock(&self.state).clusters.len()
    }

    pub fn live_sessions(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    pub fn live_async_contexts(&self) -> usize {
        lock(&self.state).contexts.len()
    }

    /// Highest number of dictionary calls ever in flight on one session.
    pub fn max_dictionary_overlap(&self) -> usize {
        lock(&self.state).max_overlap
    }

    fn record(&self, call: DriverCall) {
        lock(&self.state).calls.push(call);
    }

    async fn pause(&self) {
        if self.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn begin_dictionary(&self, session: SessionHandle, call: DriverCall) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if !state.sessions.contains(&session) {
            return Err(DriverError::new(4000, format!("invalid {session}")));
        }
        let overlap = {
            let count = state.in_flight.entry(session).or_insert(0);
            *count += 1;
            *count
        };
        state.max_overlap = state.max_overlap.max(overlap);
        Ok(())
    }

    fn end_dictionary(&self, session: SessionHandle) {
        let mut state = lock(&self.state);
        if let Some(count) = state.in_flight.get_mut(&session) {
            *count = count.saturating_sub(1);
        }
    }

    fn connect_now(&self, cluster: ClusterHandle) -> Result<i32, DriverError> {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::Connect { cluster });
        if !state.clusters.contains(&cluster) {
            return Err(DriverError::new(4009, format!("invalid {cluster}")));
        }
        Ok(state.connect_code)
    }

    fn ready_now(&self, cluster: ClusterHandle) -> i32 {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::WaitUntilReady { cluster });
        state.ready_result
    }

    fn session_now(&self, cluster: ClusterHandle, database: &str) -> Result<SessionHandle, DriverError> {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::CreateSession {
            database: database.to_string(),
        });
        if !state.clusters.contains(&cluster) {
            return Err(DriverError::new(4009, format!("invalid {cluster}")));
        }
        if state.failing_sessions > 0 {
            state.failing_sessions -= 1;
            return Err(DriverError::new(4000, "session creation failed"));
        }
        let session = SessionHandle(state.next_handle());
        state.sessions.insert(session);
        Ok(session)
    }
}

impl NativeDriver for MemoryDriver {
    fn init(&self) {
        self.record(DriverCall::Init);
    }

    fn create_cluster_connection(
        &self,
        connect_string: &str,
        _name: &str,
    ) -> Result<ClusterHandle, DriverError> {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::CreateCluster {
            connect_string: connect_string.to_string(),
        });
        let cluster = ClusterHandle(state.next_handle());
        state.clusters.insert(cluster);
        Ok(cluster)
    }

    async fn connect(
        &self,
        cluster: ClusterHandle,
        _retries: u32,
        _delay_secs: u32,
        _verbose: bool,
    ) -> Result<i32, DriverError> {
        self.pause().await;
        self.connect_now(cluster)
    }

    fn connect_blocking(
        &self,
        cluster: ClusterHandle,
        _retries: u32,
        _delay_secs: u32,
        _verbose: bool,
    ) -> Result<i32, DriverError> {
        self.connect_now(cluster)
    }

    async fn wait_until_ready(
        &self,
        cluster: ClusterHandle,
        _timeout_first_alive_secs: u32,
        _timeout_after_first_alive_secs: u32,
    ) -> Result<i32, DriverError> {
        self.pause().await;
        Ok(self.ready_now(cluster))
    }

    fn wait_until_ready_blocking(
        &self,
        cluster: ClusterHandle,
        _timeout_first_alive_secs: u32,
        _timeout_after_first_alive_secs: u32,
    ) -> Result<i32, DriverError> {
        Ok(self.ready_now(cluster))
    }

    fn node_id(&self, _cluster: ClusterHandle) -> u32 {
        MEMORY_NODE_ID
    }

    fn destroy_cluster_connection(&self, cluster: ClusterHandle) {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::DestroyCluster { cluster });
        state.clusters.remove(&cluster);
    }

    fn create_async_context(&self, cluster: ClusterHandle) -> Result<AsyncContextHandle, DriverError> {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::CreateAsyncContext { cluster });
        if !state.clusters.contains(&cluster) {
            return Err(DriverError::new(4009, format!("invalid {cluster}")));
        }
        let context = AsyncContextHandle(state.next_handle());
        state.contexts.insert(context);
        Ok(context)
    }

    fn shutdown_async_context(&self, context: AsyncContextHandle) {
        self.record(DriverCall::ShutdownAsyncContext { context });
    }

    fn destroy_async_context(&self, context: AsyncContextHandle) {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::DestroyAsyncContext { context });
        state.contexts.remove(&context);
    }

    async fn create_session(
        &self,
        cluster: ClusterHandle,
        database: &str,
    ) -> Result<SessionHandle, DriverError> {
        self.pause().await;
        self.session_now(cluster, database)
    }

    fn create_session_blocking(
        &self,
        cluster: ClusterHandle,
        database: &str,
    ) -> Result<SessionHandle, DriverError> {
        self.session_now(cluster, database)
    }

    fn destroy_session(&self, session: SessionHandle) {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::DestroySession { session });
        state.sessions.remove(&session);
        state.in_flight.remove(&session);
    }

    async fn list_tables(
        &self,
        session: SessionHandle,
        database: &str,
    ) -> Result<Vec<String>, DriverError> {
        self.begin_dictionary(
            session,
            DriverCall::ListTables {
                session,
                database: database.to_string(),
            },
        )?;
        self.pause().await;
        let names = lock(&self.state).catalog.table_names(database);
        self.end_dictionary(session);
        Ok(names)
    }

    async fn get_table(
        &self,
        session: SessionHandle,
        database: &str,
        table: &str,
    ) -> Result<RawTable, DriverError> {
        self.begin_dictionary(
            session,
            DriverCall::GetTable {
                session,
                database: database.to_string(),
                table: table.to_string(),
            },
        )?;
        self.pause().await;
        let found = lock(&self.state).catalog.find(database, table).cloned();
        self.end_dictionary(session);
        found.ok_or_else(|| DriverError::new(NO_SUCH_TABLE, "No such table existed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ColumnType, RawColumn};

    fn items() -> RawTable {
        RawTable {
            database: "inventory".to_string(),
            name: "items".to_string(),
            columns: vec![RawColumn {
                name: "id".to_string(),
                column_type: ColumnType::Int,
                nullable: false,
                primary_key: true,
                length: 0,
                raw_default: None,
            }],
        }
    }

    async fn session(driver: &MemoryDriver) -> SessionHandle {
        let cluster = driver.create_cluster_connection("C1", "test").unwrap();
        driver.create_session(cluster, "inventory").await.unwrap()
    }

    #[test]
    fn catalog_from_toml() {
        let catalog = Catalog::from_toml(
            r#"
            [[tables]]
            database = "inventory"
            name = "items"

            [[tables.columns]]
            name = "id"
            column_type = "int"
            primary_key = true
            "#,
        )
        .unwrap();
        assert_eq!(catalog, Catalog::default().with_table(items()));
    }

    #[tokio::test]
    async fn list_tables_filters_by_database() {
        let mut other = items();
        other.database = "billing".to_string();
        other.name = "invoices".to_string();
        let driver = MemoryDriver::new(Catalog::default().with_table(items()).with_table(other));
        let s = session(&driver).await;

        assert_eq!(driver.list_tables(s, "inventory").await.unwrap(), vec!["items"]);
        assert!(driver.list_tables(s, "nowhere").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_missing_table_reports_723() {
        let driver = MemoryDriver::new(Catalog::default().with_table(items()));
        let s = session(&driver).await;

        assert_eq!(driver.get_table(s, "inventory", "items").await.unwrap(), items());
        let err = driver.get_table(s, "inventory", "gone").await.unwrap_err();
        assert_eq!(err.code, NO_SUCH_TABLE);
    }

    #[tokio::test]
    async fn dictionary_call_on_destroyed_session_fails() {
        let driver = MemoryDriver::default();
        let s = session(&driver).await;
        driver.destroy_session(s);
        assert!(driver.list_tables(s, "inventory").await.is_err());
    }

    #[tokio::test]
    async fn overlap_is_tracked_per_session() {
        let driver = std::sync::Arc::new(MemoryDriver::default().with_latency(Duration::from_millis(5)));
        let s = session(&driver).await;

        let a = tokio::spawn({
            let driver = std::sync::Arc::clone(&driver);
            async move { driver.list_tables(s, "x").await }
        });
        let b = tokio::spawn({
            let driver = std::sync::Arc::clone(&driver);
            async move { driver.list_tables(s, "y").await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(driver.max_dictionary_overlap(), 2);
    }

    #[tokio::test]
    async fn injected_session_failures_are_consumed() {
        let driver = MemoryDriver::default();
        let cluster = driver.create_cluster_connection("C1", "test").unwrap();
        driver.fail_next_sessions(1);

        assert!(driver.create_session(cluster, "db").await.is_err());
        assert!(driver.create_session(cluster, "db").await.is_ok());
        assert_eq!(driver.live_sessions(), 1);
    }
}
