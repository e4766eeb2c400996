//! Pool and cluster-connection counters.
//!
//! Lock-free atomics bumped on the hot paths; [`PoolStats::snapshot`] and
//! [`ConnectionStats::snapshot`] copy them into plain serializable structs.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Counters for one connection pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub(crate) connect_async: AtomicU64,
    pub(crate) connect_sync: AtomicU64,
    pub(crate) session_hits: AtomicU64,
    pub(crate) session_misses: AtomicU64,
    pub(crate) sessions_destroyed: AtomicU64,
    pub(crate) prefetch_attempts: AtomicU64,
    pub(crate) prefetch_successes: AtomicU64,
    pub(crate) prefetch_errors: AtomicU64,
    pub(crate) group_callbacks: AtomicU64,
    pub(crate) list_tables: AtomicU64,
    pub(crate) get_table_metadata: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    pub connect_async: u64,
    pub connect_sync: u64,
    /// `get_session` served from the free list.
    pub session_hits: u64,
    /// `get_session` that had to create a native session.
    pub session_misses: u64,
    pub sessions_destroyed: u64,
    pub prefetch_attempts: u64,
    pub prefetch_successes: u64,
    pub prefetch_errors: u64,
    /// Pending groups created, i.e. native dictionary calls scheduled.
    pub group_callbacks: u64,
    pub list_tables: u64,
    pub get_table_metadata: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PoolStatsSnapshot {
            connect_async: get(&self.connect_async),
            connect_sync: get(&self.connect_sync),
            session_hits: get(&self.session_hits),
            session_misses: get(&self.session_misses),
            sessions_destroyed: get(&self.sessions_destroyed),
            prefetch_attempts: get(&self.prefetch_attempts),
            prefetch_successes: get(&self.prefetch_successes),
            prefetch_errors: get(&self.prefetch_errors),
            group_callbacks: get(&self.group_callbacks),
            list_tables: get(&self.list_tables),
            get_table_metadata: get(&self.get_table_metadata),
        }
    }
}

impl PoolStatsSnapshot {
    /// Log the snapshot at `tracing::info` level.
    pub fn log(&self, pool_id: u64) {
        tracing::info!(
            pool = pool_id,
            session_hits = self.session_hits,
            session_misses = self.session_misses,
            sessions_destroyed = self.sessions_destroyed,
            prefetch_successes = self.prefetch_successes,
            prefetch_errors = self.prefetch_errors,
            group_callbacks = self.group_callbacks,
            list_tables = self.list_tables,
            get_table_metadata = self.get_table_metadata,
            "pool statistics"
        );
    }
}

/// Counters for one shared cluster connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub(crate) connect_async: AtomicU64,
    pub(crate) connect_sync: AtomicU64,
    pub(crate) connections_successful: AtomicU64,
    pub(crate) connections_failed: AtomicU64,
    pub(crate) readiness_timeouts: AtomicU64,
    pub(crate) simultaneous_disconnects: AtomicU64,
    pub(crate) node_id: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatsSnapshot {
    pub connect_string: String,
    pub reference_count: usize,
    pub connect_async: u64,
    pub connect_sync: u64,
    pub connections_successful: u64,
    pub connections_failed: u64,
    pub readiness_timeouts: u64,
    /// Close requests that arrived while a close was already in progress.
    pub simultaneous_disconnects: u64,
    /// Node id of the last successful connect; 0 before the first.
    pub node_id: u64,
}

impl ConnectionStats {
    pub(crate) fn record_node_id(&self, node_id: u32) {
        self.node_id.store(node_id as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, connect_string: &str, reference_count: usize) -> ConnectionStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ConnectionStatsSnapshot {
            connect_string: connect_string.to_string(),
            reference_count,
            connect_async: get(&self.connect_async),
            connect_sync: get(&self.connect_sync),
            connections_successful: get(&self.connections_successful),
            connections_failed: get(&self.connections_failed),
            readiness_timeouts: get(&self.readiness_timeouts),
            simultaneous_disconnects: get(&self.simultaneous_disconnects),
            node_id: get(&self.node_id),
        }
    }
}
