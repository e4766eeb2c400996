//! End-to-end pool behavior over the in-memory driver.

use std::sync::Arc;
use std::time::Duration;

use ndb_pool::memory::{Catalog, DriverCall, MemoryDriver};
use ndb_pool::{
    ColumnType, ConnectionPool, ConnectionRegistry, DefaultValue, DictionaryLock, PoolError,
    PoolProperties, RawColumn, RawTable, TypedValue,
};

fn column(name: &str, column_type: ColumnType, raw_default: Option<Vec<u8>>) -> RawColumn {
    RawColumn {
        name: name.to_string(),
        column_type,
        nullable: false,
        primary_key: name == "id",
        length: 0,
        raw_default,
    }
}

fn catalog() -> Catalog {
    let mut catalog = Catalog::default();
    for name in ["t1", "t2", "t3", "t4"] {
        catalog = catalog.with_table(RawTable {
            database: "db1".to_string(),
            name: name.to_string(),
            columns: vec![
                column("id", ColumnType::Int, None),
                column("qty", ColumnType::Smallint, Some(7i16.to_le_bytes().to_vec())),
            ],
        });
    }
    catalog
}

fn properties(connect_string: &str) -> PoolProperties {
    PoolProperties {
        connect_string: connect_string.to_string(),
        database: "db1".to_string(),
        session_pool_min: 1,
        session_pool_max: 3,
        ..PoolProperties::default()
    }
}

struct Harness {
    driver: Arc<MemoryDriver>,
    registry: Arc<ConnectionRegistry<MemoryDriver>>,
}

impl Harness {
    fn new(latency: Duration) -> Self {
        let driver = Arc::new(MemoryDriver::new(catalog()).with_latency(latency));
        let registry = Arc::new(
            ConnectionRegistry::new(Arc::clone(&driver)).with_disconnect_grace(Duration::from_millis(50)),
        );
        Self { driver, registry }
    }

    async fn pool(&self, connect_string: &str) -> ConnectionPool<MemoryDriver> {
        let pool = ConnectionPool::new(properties(connect_string), Arc::clone(&self.registry)).unwrap();
        pool.connect().await.unwrap();
        pool.prefetch_complete().await;
        pool
    }

    fn count(&self, predicate: impl Fn(&DriverCall) -> bool) -> usize {
        self.driver.count_calls(predicate)
    }
}

fn is_get_table(call: &DriverCall) -> bool {
    matches!(call, DriverCall::GetTable { .. })
}

// ── Single-flight dictionary lookups ─────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrent_metadata_requests_share_one_native_call() {
    let h = Harness::new(Duration::from_millis(20));
    let pool = h.pool("C1").await;

    let replies: Vec<_> = (0..8).map(|_| pool.get_table_metadata("db1", "t1", None)).collect();
    assert_eq!(pool.pending_table_metadata("db1", "t1"), 8);

    let mut tables = Vec::new();
    for reply in replies {
        tables.push(reply.await.unwrap());
    }

    assert_eq!(h.count(is_get_table), 1);
    assert!(tables.iter().all(|t| Arc::ptr_eq(t, &tables[0])));
    assert_eq!(
        tables[0].column("qty").unwrap().default,
        DefaultValue::Value(TypedValue::Int(7))
    );
    assert_eq!(tables[0].column("id").unwrap().default, DefaultValue::Undefined);
    assert_eq!(pool.pending_groups(), 0);
}

#[tokio::test(start_paused = true)]
async fn three_list_tables_requests_make_one_call() {
    let h = Harness::new(Duration::from_millis(20));
    let pool = h.pool("C1").await;

    let a = pool.list_tables("db1", None);
    let b = pool.list_tables("db1", None);
    let c = pool.list_tables("db1", None);
    assert_eq!(pool.pending_list_tables("db1"), 3);

    let (a, b, c) = (a.await.unwrap(), b.await.unwrap(), c.await.unwrap());
    assert_eq!(*a, vec!["t1", "t2", "t3", "t4"]);
    assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&a, &c));
    assert_eq!(h.count(|c| matches!(c, DriverCall::ListTables { .. })), 1);
    assert_eq!(pool.stats().group_callbacks, 1);
}

#[tokio::test(start_paused = true)]
async fn missing_table_error_reaches_every_waiter() {
    let h = Harness::new(Duration::from_millis(5));
    let pool = h.pool("C1").await;

    let replies: Vec<_> = (0..3).map(|_| pool.get_table_metadata("db1", "nope", None)).collect();
    for reply in replies {
        let err = reply.await.unwrap_err();
        assert!(err.to_string().contains("No such table existed"), "{err}");
    }
    assert_eq!(h.count(is_get_table), 1);

    // The session keeps serving lookups after a failure.
    pool.get_table_metadata("db1", "t1", None).await.unwrap();
    let session = pool.dictionary_session().unwrap();
    assert_eq!(session.dictionary_lock(), DictionaryLock::Unlocked);
}

// ── Per-session ordering ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn distinct_lookups_reach_engine_in_order_without_overlap() {
    let h = Harness::new(Duration::from_millis(10));
    let pool = h.pool("C1").await;

    let replies: Vec<_> = ["t1", "t2", "t3", "t4"]
        .into_iter()
        .map(|t| pool.get_table_metadata("db1", t, None))
        .collect();
    let session = pool.dictionary_session().unwrap();
    assert_eq!(session.queued_calls(), 3);

    for reply in replies {
        reply.await.unwrap();
    }
    let order: Vec<String> = h
        .driver
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            DriverCall::GetTable { table, .. } => Some(table),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec!["t1", "t2", "t3", "t4"]);
    assert_eq!(h.driver.max_dictionary_overlap(), 1);
}

#[tokio::test(start_paused = true)]
async fn separate_sessions_run_in_parallel() {
    let h = Harness::new(Duration::from_millis(10));
    let pool = h.pool("C1").await;
    let session = pool.get_session().await.unwrap();

    let a = pool.get_table_metadata("db1", "t1", None);
    let b = pool.get_table_metadata("db1", "t2", Some(&session));
    assert_eq!(session.dictionary_lock(), DictionaryLock::Locked);
    assert_eq!(session.queued_calls(), 0);

    a.await.unwrap();
    b.await.unwrap();
    assert_eq!(h.count(is_get_table), 2);
    pool.release_session(session).unwrap();
}

// ── Session pool ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn free_list_never_exceeds_max() {
    let h = Harness::new(Duration::ZERO);
    let pool = h.pool("C1").await;
    assert_eq!(pool.free_sessions(), 1);

    let mut held = Vec::new();
    for _ in 0..6 {
        held.push(pool.get_session().await.unwrap());
    }
    for session in held {
        pool.release_session(session).unwrap();
        assert!(pool.free_sessions() <= 3);
    }
    assert_eq!(pool.free_sessions(), 3);

    let stats = pool.stats();
    assert_eq!(stats.session_hits, 1);
    assert_eq!(stats.session_misses, 5);
    assert_eq!(stats.sessions_destroyed, 3);
}

#[tokio::test(start_paused = true)]
async fn prefetch_racing_releases_stays_within_max() {
    let h = Harness::new(Duration::from_millis(20));
    let pool = ConnectionPool::new(
        PoolProperties {
            session_pool_min: 2,
            session_pool_max: 2,
            ..properties("C1")
        },
        Arc::clone(&h.registry),
    )
    .unwrap();
    pool.connect().await.unwrap();

    let (a, b) = tokio::join!(pool.get_session(), pool.get_session());
    pool.release_session(a.unwrap()).unwrap();
    pool.release_session(b.unwrap()).unwrap();
    pool.prefetch_complete().await;

    assert!(pool.free_sessions() <= 2, "free list {} over max", pool.free_sessions());
    // Dictionary session plus whatever the free list holds.
    assert_eq!(h.driver.live_sessions(), 1 + pool.free_sessions());
}

// ── Close ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn close_fails_queued_dictionary_calls() {
    let h = Harness::new(Duration::from_millis(10));
    let pool = h.pool("C1").await;

    let replies: Vec<_> = ["t1", "t2", "t3"]
        .into_iter()
        .map(|t| pool.get_table_metadata("db1", t, None))
        .collect();
    let late_joiner = pool.get_table_metadata("db1", "t3", None);

    pool.close().await.unwrap();
    for reply in replies {
        assert!(reply.await.unwrap_err().is_pool_closing());
    }
    assert!(late_joiner.await.unwrap_err().is_pool_closing());

    // Only the call already in flight reached the engine.
    assert_eq!(h.count(is_get_table), 1);
    assert_eq!(h.driver.live_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn requests_after_close_fail() {
    let h = Harness::new(Duration::ZERO);
    let pool = h.pool("C1").await;
    pool.close().await.unwrap();

    assert!(pool.list_tables("db1", None).await.unwrap_err().is_pool_closing());
    assert!(matches!(pool.get_session().await, Err(PoolError::PoolClosed)));
}

// ── Shared cluster connections ───────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn pools_share_one_cluster_connection() {
    let h = Harness::new(Duration::ZERO);
    let first = h.pool("C1").await;
    let second = h.pool("C1").await;

    assert_eq!(h.registry.reference_count("C1"), 2);
    assert_eq!(h.count(|c| matches!(c, DriverCall::Connect { .. })), 1);
    assert_eq!(h.count(|c| matches!(c, DriverCall::CreateCluster { .. })), 1);
    assert!(Arc::ptr_eq(&first.connection().unwrap(), &second.connection().unwrap()));

    first.close().await.unwrap();
    assert_eq!(h.registry.reference_count("C1"), 1);
    assert!(second.is_connected());
    assert_eq!(h.driver.live_clusters(), 1);
    second.list_tables("db1", None).await.unwrap();

    second.close().await.unwrap();
    assert!(!h.registry.contains("C1"));
    assert_eq!(h.driver.live_clusters(), 0);
    assert_eq!(h.count(|c| matches!(c, DriverCall::DestroyCluster { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn pool_connecting_during_grace_keeps_its_connection() {
    let h = Harness::new(Duration::ZERO);
    let first = Arc::new(h.pool("C1").await);
    let old = first.connection().unwrap();

    let closing = {
        let first = Arc::clone(&first);
        tokio::spawn(async move { first.close().await })
    };
    tokio::task::yield_now().await;
    assert!(old.is_disconnecting());

    let second = h.pool("C1").await;
    assert!(!Arc::ptr_eq(&old, &second.connection().unwrap()));
    closing.await.unwrap().unwrap();

    assert!(second.is_connected());
    assert_eq!(h.driver.live_clusters(), 1);
    assert_eq!(h.registry.reference_count("C1"), 1);
    assert_eq!(*second.list_tables("db1", None).await.unwrap(), vec!["t1", "t2", "t3", "t4"]);

    second.close().await.unwrap();
    assert!(!h.registry.contains("C1"));
    assert_eq!(h.driver.live_clusters(), 0);
    assert_eq!(h.driver.live_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn different_connect_strings_get_separate_connections() {
    let h = Harness::new(Duration::ZERO);
    let a = h.pool("C1").await;
    let b = h.pool("C2").await;

    assert_eq!(h.registry.len(), 2);
    assert_eq!(h.driver.live_clusters(), 2);
    a.close().await.unwrap();
    assert!(b.is_connected());
    b.close().await.unwrap();
    assert!(h.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn reacquire_after_full_release_reconnects() {
    let h = Harness::new(Duration::ZERO);
    let first = h.pool("C1").await;
    first.close().await.unwrap();

    let again = h.pool("C1").await;
    assert!(again.is_connected());
    assert_eq!(h.count(|c| matches!(c, DriverCall::CreateCluster { .. })), 2);
    again.close().await.unwrap();
}

#[tokio::test]
#[should_panic(expected = "released more times than acquired")]
async fn over_release_is_fatal() {
    let h = Harness::new(Duration::ZERO);
    h.registry.acquire("C1").unwrap();
    h.registry.release("C1").await.unwrap();
    h.registry.release("C1").await.unwrap();
}
