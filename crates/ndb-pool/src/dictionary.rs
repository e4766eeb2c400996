//! Dictionary lookup coordination.
//!
//! Two rules keep the native dictionary from being hammered or misused:
//!
//! 1. **Single flight per key.** Concurrent requests for the same key
//!    (`db` for table lists, `db.table` for metadata) join one pending
//!    group. Only the first request schedules a native call; when it
//!    completes every member of the group receives the same `Arc`'d result.
//! 2. **One call per session.** Distinct keys scheduled on the same session
//!    are serialized through the session's dictionary lock and run in FIFO
//!    order.
//!
//! Results travel to waiters over tokio oneshot channels, so a request is a
//! [`DictionaryReply`] future that resolves when its group completes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::debug;

use crate::driver::NativeDriver;
use crate::error::{DictionaryError, PoolError, PoolResult};
use crate::lock;
use crate::metadata::{decode_table, TableMetadata};
use crate::session::Session;
use crate::stats::{incr, PoolStats};

/// A deferred dictionary call waiting for its session's lock.
pub(crate) struct DictionaryCall {
    key: String,
    task: Box<dyn FnOnce() + Send>,
}

impl DictionaryCall {
    pub(crate) fn new(key: String, task: impl FnOnce() + Send + 'static) -> Self {
        Self {
            key,
            task: Box::new(task),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn run(self) {
        (self.task)()
    }
}

impl std::fmt::Debug for DictionaryCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictionaryCall")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

type Outcome<T> = Result<Arc<T>, DictionaryError>;
type Waiter<T> = oneshot::Sender<Outcome<T>>;

enum Join {
    /// First member; the caller must schedule the native call.
    Leader,
    /// A call for this key is already scheduled.
    Follower,
    /// The pool is closing; nothing was joined.
    Closed,
}

struct GroupsState<T> {
    groups: HashMap<String, Vec<Waiter<T>>>,
    closed: bool,
}

/// Pending groups for one kind of dictionary lookup.
struct PendingGroups<T> {
    state: Mutex<GroupsState<T>>,
}

impl<T> PendingGroups<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(GroupsState {
                groups: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn join(&self, key: &str, waiter: Waiter<T>) -> Join {
        let mut state = lock(&self.state);
        if state.closed {
            return Join::Closed;
        }
        match state.groups.get_mut(key) {
            Some(waiters) => {
                waiters.push(waiter);
                Join::Follower
            }
            None => {
                state.groups.insert(key.to_string(), vec![waiter]);
                Join::Leader
            }
        }
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn waiting(&self, key: &str) -> usize {
        lock(&self.state).groups.get(key).map_or(0, Vec::len)
    }

    fn group_count(&self) -> usize {
        lock(&self.state).groups.len()
    }

    /// Remove the group for `key` and deliver `outcome` to every member.
    fn complete(&self, key: &str, outcome: Outcome<T>) -> usize {
        let waiters = lock(&self.state).groups.remove(key).unwrap_or_default();
        let delivered = waiters.len();
        for waiter in waiters {
            // A dropped receiver just means that caller stopped waiting.
            let _ = waiter.send(outcome.clone());
        }
        delivered
    }

    /// Refuse new members and fail every pending group with `error`.
    fn close(&self, error: DictionaryError) -> usize {
        let groups = {
            let mut state = lock(&self.state);
            state.closed = true;
            std::mem::take(&mut state.groups)
        };
        let mut failed = 0;
        for waiter in groups.into_values().flatten() {
            let _ = waiter.send(Err(error.clone()));
            failed += 1;
        }
        failed
    }
}

/// Future returned by the dictionary lookups of a
/// [`ConnectionPool`](crate::pool::ConnectionPool).
///
/// Resolves to the result shared by every member of the request's pending
/// group. Dropping it leaves the group and the native call unaffected.
#[must_use = "a dictionary reply does nothing unless awaited"]
pub struct DictionaryReply<T> {
    state: ReplyState<T>,
}

enum ReplyState<T> {
    Waiting(oneshot::Receiver<Outcome<T>>),
    Failed(Option<PoolError>),
}

impl<T> DictionaryReply<T> {
    fn waiting(receiver: oneshot::Receiver<Outcome<T>>) -> Self {
        Self {
            state: ReplyState::Waiting(receiver),
        }
    }

    pub(crate) fn failed(error: impl Into<PoolError>) -> Self {
        Self {
            state: ReplyState::Failed(Some(error.into())),
        }
    }
}

impl<T> Unpin for DictionaryReply<T> {}

impl<T> Future for DictionaryReply<T> {
    type Output = PoolResult<Arc<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            ReplyState::Waiting(receiver) => Pin::new(receiver).poll(cx).map(|received| match received {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(DictionaryError::Abandoned.into()),
            }),
            ReplyState::Failed(error) => Poll::Ready(Err(error
                .take()
                .unwrap_or(PoolError::Dictionary(DictionaryError::Abandoned)))),
        }
    }
}

impl<T> std::fmt::Debug for DictionaryReply<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            ReplyState::Waiting(_) => "waiting",
            ReplyState::Failed(_) => "failed",
        };
        f.debug_struct("DictionaryReply").field("state", &state).finish()
    }
}

/// Release the session's dictionary lock and start whatever queued behind it.
fn run_next(session: &Session) {
    if let Some(next) = session.finish_call() {
        next.run();
    }
}

/// Pending groups and scheduling for one pool's dictionary lookups.
pub(crate) struct DictionaryCoordinator<D: NativeDriver> {
    pool_id: u64,
    driver: Arc<D>,
    tables: Arc<PendingGroups<Vec<String>>>,
    metadata: Arc<PendingGroups<TableMetadata>>,
    stats: Arc<PoolStats>,
}

impl<D: NativeDriver> DictionaryCoordinator<D> {
    pub(crate) fn new(pool_id: u64, driver: Arc<D>, stats: Arc<PoolStats>) -> Self {
        Self {
            pool_id,
            driver,
            tables: Arc::new(PendingGroups::new()),
            metadata: Arc::new(PendingGroups::new()),
            stats,
        }
    }

    /// List the tables of `database` using `session` for the native call.
    pub(crate) fn list_tables(&self, session: &Session, database: &str) -> DictionaryReply<Vec<String>> {
        incr(&self.stats.list_tables);
        let driver = Arc::clone(&self.driver);
        let handle = session.handle();
        let db = database.to_string();
        self.request(&self.tables, session, database.to_string(), move || async move {
            driver
                .list_tables(handle, &db)
                .await
                .map_err(DictionaryError::Native)
        })
    }

    /// Fetch and decode the metadata of `database.table`.
    pub(crate) fn get_table_metadata(
        &self,
        session: &Session,
        database: &str,
        table: &str,
    ) -> DictionaryReply<TableMetadata> {
        incr(&self.stats.get_table_metadata);
        let driver = Arc::clone(&self.driver);
        let handle = session.handle();
        let (db, name) = (database.to_string(), table.to_string());
        self.request(&self.metadata, session, format!("{database}.{table}"), move || async move {
            let raw = driver
                .get_table(handle, &db, &name)
                .await
                .map_err(DictionaryError::Native)?;
            decode_table(raw)
        })
    }

    fn request<T, F, Fut>(
        &self,
        groups: &Arc<PendingGroups<T>>,
        session: &Session,
        key: String,
        fetch: F,
    ) -> DictionaryReply<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, DictionaryError>> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            return DictionaryReply::failed(PoolError::NoRuntime);
        };

        let (sender, receiver) = oneshot::channel();
        match groups.join(&key, sender) {
            Join::Closed => return DictionaryReply::failed(DictionaryError::PoolClosing),
            Join::Follower => {
                debug!(pool = self.pool_id, key = %key, waiting = groups.waiting(&key), "joined pending dictionary call");
            }
            Join::Leader => {
                incr(&self.stats.group_callbacks);
                let call = self.deferred(groups, session, key, runtime, fetch);
                match session.lock_or_enqueue(call) {
                    Some(call) => call.run(),
                    None => debug!(
                        pool = self.pool_id,
                        session = session.id(),
                        queued = session.queued_calls(),
                        "dictionary call queued behind session lock"
                    ),
                }
            }
        }
        DictionaryReply::waiting(receiver)
    }

    fn deferred<T, F, Fut>(
        &self,
        groups: &Arc<PendingGroups<T>>,
        session: &Session,
        key: String,
        runtime: Handle,
        fetch: F,
    ) -> DictionaryCall
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, DictionaryError>> + Send + 'static,
    {
        let groups = Arc::clone(groups);
        let session = session.clone();
        let pool = self.pool_id;
        DictionaryCall::new(key.clone(), move || {
            if groups.is_closed() {
                debug!(pool, key = %key, "pool closing; dictionary call skipped");
                run_next(&session);
                return;
            }
            runtime.spawn(async move {
                let outcome = fetch().await.map(Arc::new);
                let failed = outcome.is_err();
                let delivered = groups.complete(&key, outcome);
                debug!(pool, key = %key, delivered, failed, "dictionary call completed");
                run_next(&session);
            });
        })
    }

    /// Fail every pending group with [`DictionaryError::PoolClosing`] and
    /// refuse new requests. Returns the number of waiters failed.
    pub(crate) fn close(&self) -> usize {
        self.tables.close(DictionaryError::PoolClosing) + self.metadata.close(DictionaryError::PoolClosing)
    }

    pub(crate) fn pending_list_tables(&self, database: &str) -> usize {
        self.tables.waiting(database)
    }

    pub(crate) fn pending_table_metadata(&self, database: &str, table: &str) -> usize {
        self.metadata.waiting(&format!("{database}.{table}"))
    }

    pub(crate) fn pending_groups(&self) -> usize {
        self.tables.group_count() + self.metadata.group_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::driver::SessionHandle;
    use crate::memory::{Catalog, DriverCall, MemoryDriver};
    use crate::metadata::{ColumnType, RawColumn, RawTable};
    use crate::session::DictionaryLock;

    fn table(database: &str, name: &str) -> RawTable {
        RawTable {
            database: database.to_string(),
            name: name.to_string(),
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

    struct Fixture {
        driver: Arc<MemoryDriver>,
        coordinator: DictionaryCoordinator<MemoryDriver>,
        session: Session,
        stats: Arc<PoolStats>,
    }

    async fn fixture(latency: Duration) -> Fixture {
        let catalog = Catalog::default()
            .with_table(table("db1", "t1"))
            .with_table(table("db1", "t2"))
            .with_table(table("db1", "t3"));
        let driver = Arc::new(MemoryDriver::new(catalog).with_latency(latency));
        let cluster = driver.create_cluster_connection("C1", "test").unwrap();
        let handle: SessionHandle = driver.create_session(cluster, "db1").await.unwrap();
        let stats = Arc::new(PoolStats::default());
        let coordinator = DictionaryCoordinator::new(1, Arc::clone(&driver), Arc::clone(&stats));
        Fixture {
            driver,
            coordinator,
            session: Session::new(1, handle, 1),
            stats,
        }
    }

    fn get_table_calls(driver: &MemoryDriver) -> usize {
        driver.count_calls(|c| matches!(c, DriverCall::GetTable { .. }))
    }

    // ── Single flight ───────────────────────────────────────────────

    #[tokio::test]
    async fn same_key_shares_one_native_call() {
        let f = fixture(Duration::from_millis(5)).await;
        let replies: Vec<_> = (0..5)
            .map(|_| f.coordinator.get_table_metadata(&f.session, "db1", "t1"))
            .collect();
        assert_eq!(f.coordinator.pending_table_metadata("db1", "t1"), 5);

        let mut results = Vec::new();
        for reply in replies {
            results.push(reply.await.unwrap());
        }
        assert_eq!(get_table_calls(&f.driver), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
        assert_eq!(results[0].qualified_name(), "db1.t1");
        assert_eq!(f.coordinator.pending_groups(), 0);
        assert_eq!(f.stats.snapshot().group_callbacks, 1);
        assert_eq!(f.stats.snapshot().get_table_metadata, 5);
    }

    #[tokio::test]
    async fn list_tables_groups_by_database() {
        let f = fixture(Duration::from_millis(5)).await;
        let a = f.coordinator.list_tables(&f.session, "db1");
        let b = f.coordinator.list_tables(&f.session, "db1");
        let c = f.coordinator.list_tables(&f.session, "db1");
        assert_eq!(f.coordinator.pending_list_tables("db1"), 3);

        let (a, b, c) = (a.await.unwrap(), b.await.unwrap(), c.await.unwrap());
        assert_eq!(*a, vec!["t1", "t2", "t3"]);
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
        assert_eq!(f.driver.count_calls(|c| matches!(c, DriverCall::ListTables { .. })), 1);
    }

    #[tokio::test]
    async fn completed_group_is_not_reused() {
        let f = fixture(Duration::ZERO).await;
        f.coordinator.get_table_metadata(&f.session, "db1", "t1").await.unwrap();
        f.coordinator.get_table_metadata(&f.session, "db1", "t1").await.unwrap();
        assert_eq!(get_table_calls(&f.driver), 2);
    }

    #[tokio::test]
    async fn failure_is_delivered_to_every_waiter() {
        let f = fixture(Duration::ZERO).await;
        let a = f.coordinator.get_table_metadata(&f.session, "db1", "missing");
        let b = f.coordinator.get_table_metadata(&f.session, "db1", "missing");

        for reply in [a, b] {
            match reply.await.unwrap_err() {
                PoolError::Dictionary(DictionaryError::Native(e)) => assert_eq!(e.code, 723),
                other => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(get_table_calls(&f.driver), 1);
        assert_eq!(f.session.dictionary_lock(), DictionaryLock::Unlocked);
    }

    // ── Per-session serialization ───────────────────────────────────

    #[tokio::test]
    async fn distinct_keys_run_fifo_without_overlap() {
        let f = fixture(Duration::from_millis(5)).await;
        let replies: Vec<_> = ["t1", "t2", "t3"]
            .into_iter()
            .map(|t| f.coordinator.get_table_metadata(&f.session, "db1", t))
            .collect();
        assert_eq!(f.session.dictionary_lock(), DictionaryLock::Locked);
        assert_eq!(f.session.queued_calls(), 2);

        for reply in replies {
            reply.await.unwrap();
        }
        assert_eq!(f.driver.max_dictionary_overlap(), 1);
        let order: Vec<String> = f
            .driver
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::GetTable { table, .. } => Some(table),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["t1", "t2", "t3"]);
        assert_eq!(f.session.dictionary_lock(), DictionaryLock::Unlocked);
    }

    #[tokio::test]
    async fn dropped_reply_does_not_stall_queue() {
        let f = fixture(Duration::from_millis(1)).await;
        drop(f.coordinator.get_table_metadata(&f.session, "db1", "t1"));
        let second = f.coordinator.get_table_metadata(&f.session, "db1", "t2");
        assert_eq!(second.await.unwrap().name, "t2");
    }

    // ── Close ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn close_fails_waiters_and_refuses_new_requests() {
        let f = fixture(Duration::from_millis(5)).await;
        let inflight = f.coordinator.get_table_metadata(&f.session, "db1", "t1");
        let queued = f.coordinator.get_table_metadata(&f.session, "db1", "t2");

        assert_eq!(f.coordinator.close(), 2);
        assert!(inflight.await.unwrap_err().is_pool_closing());
        assert!(queued.await.unwrap_err().is_pool_closing());

        let late = f.coordinator.list_tables(&f.session, "db1");
        assert!(late.await.unwrap_err().is_pool_closing());

        f.session.dictionary_idle().await;
        // The queued call was skipped once its turn came.
        assert_eq!(get_table_calls(&f.driver), 1);
    }

    #[test]
    fn request_outside_runtime_fails() {
        let driver = Arc::new(MemoryDriver::default());
        let coordinator = DictionaryCoordinator::new(1, driver, Arc::new(PoolStats::default()));
        let session = Session::new(1, SessionHandle(1), 1);

        let reply = coordinator.list_tables(&session, "db1");
        let err = block_on(reply).unwrap_err();
        assert!(matches!(err, PoolError::NoRuntime));
        assert_eq!(session.dictionary_lock(), DictionaryLock::Unlocked);
    }

    fn block_on<F: Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }
}
