//! Native sessions and the per-pool session free list.
//!
//! A [`Session`] wraps one native session handle plus the cooperative
//! dictionary lock that keeps at most one dictionary call outstanding on it.
//! The [`SessionPool`] keeps released sessions for reuse, prefetches up to
//! `session_pool_min` in the background, and destroys sessions it has no
//! room for.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::PoolProperties;
use crate::connection::ClusterConnection;
use crate::dictionary::DictionaryCall;
use crate::driver::{NativeDriver, SessionHandle};
use crate::error::{PoolError, PoolResult};
use crate::lock;
use crate::stats::{incr, PoolStats};

/// State of a session's dictionary lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DictionaryLock {
    /// No dictionary call in flight; the next call runs immediately.
    Unlocked,
    /// A dictionary call is in flight; new calls wait in the queue.
    Locked,
}

struct SessionState {
    lock: DictionaryLock,
    queue: VecDeque<DictionaryCall>,
}

struct SessionInner {
    id: u64,
    handle: SessionHandle,
    pool_id: u64,
    state: Mutex<SessionState>,
    /// Notified whenever the dictionary lock returns to `Unlocked`.
    idle: Notify,
}

/// A pooled native session.
///
/// Cheap to clone; clones refer to the same native handle and share its
/// dictionary lock and queue.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(id: u64, handle: SessionHandle, pool_id: u64) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                handle,
                pool_id,
                state: Mutex::new(SessionState {
                    lock: DictionaryLock::Unlocked,
                    queue: VecDeque::new(),
                }),
                idle: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn handle(&self) -> SessionHandle {
        self.inner.handle
    }

    /// Id of the pool that created this session.
    pub fn pool_id(&self) -> u64 {
        self.inner.pool_id
    }

    pub fn dictionary_lock(&self) -> DictionaryLock {
        lock(&self.inner.state).lock
    }

    /// Dictionary calls waiting for the lock.
    pub fn queued_calls(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    /// Take the dictionary lock for `call`, or queue it behind the call in
    /// flight. Returns the call when the lock was taken and it should run now.
    pub(crate) fn lock_or_enqueue(&self, call: DictionaryCall) -> Option<DictionaryCall> {
        let mut state = lock(&self.inner.state);
        match state.lock {
            DictionaryLock::Unlocked => {
                state.lock = DictionaryLock::Locked;
                Some(call)
            }
            DictionaryLock::Locked => {
                state.queue.push_back(call);
                None
            }
        }
    }

    /// Release the lock held by a completed call. If another call is queued,
    /// the lock passes straight to it and it is returned for the caller to run.
    pub(crate) fn finish_call(&self) -> Option<DictionaryCall> {
        let next = {
            let mut state = lock(&self.inner.state);
            if state.lock != DictionaryLock::Locked {
                drop(state);
                panic!("session {} released a dictionary lock it did not hold", self.inner.id);
            }
            let next = state.queue.pop_front();
            if next.is_none() {
                state.lock = DictionaryLock::Unlocked;
            }
            next
        };
        if next.is_none() {
            self.inner.idle.notify_waiters();
        }
        next
    }

    /// Remove every queued call without running it.
    pub(crate) fn drain_queue(&self) -> Vec<DictionaryCall> {
        lock(&self.inner.state).queue.drain(..).collect()
    }

    /// Wait until no dictionary call is in flight.
    pub(crate) async fn dictionary_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.dictionary_lock() == DictionaryLock::Unlocked {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("handle", &self.inner.handle)
            .field("pool_id", &self.inner.pool_id)
            .field("dictionary_lock", &self.dictionary_lock())
            .finish_non_exhaustive()
    }
}

/// Free list of reusable sessions for one pool.
pub struct SessionPool<D: NativeDriver> {
    pool_id: u64,
    driver: Arc<D>,
    database: String,
    min: usize,
    max: usize,
    free: Mutex<Vec<Session>>,
    closing: AtomicBool,
    next_id: AtomicU64,
    stats: Arc<PoolStats>,
}

impl<D: NativeDriver> SessionPool<D> {
    pub(crate) fn new(
        pool_id: u64,
        driver: Arc<D>,
        properties: &PoolProperties,
        stats: Arc<PoolStats>,
    ) -> Self {
        Self {
            pool_id,
            driver,
            database: properties.database.clone(),
            min: properties.session_pool_min,
            max: properties.session_pool_max,
            free: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            stats,
        }
    }

    /// Sessions currently on the free list.
    pub fn free_count(&self) -> usize {
        lock(&self.free).len()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_closing(&self) {
        self.closing.store(true, Ordering::Relaxed);
    }

    fn wrap(&self, handle: SessionHandle) -> Session {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Session::new(id, handle, self.pool_id)
    }

    /// Create a fresh native session, bypassing the free list.
    pub(crate) async fn create(&self, connection: &ClusterConnection<D>) -> PoolResult<Session> {
        let cluster = connection.handle().ok_or(PoolError::NotConnected)?;
        let handle = self.driver.create_session(cluster, &self.database).await?;
        Ok(self.wrap(handle))
    }

    pub(crate) fn create_blocking(&self, connection: &ClusterConnection<D>) -> PoolResult<Session> {
        let cluster = connection.handle().ok_or(PoolError::NotConnected)?;
        let handle = self.driver.create_session_blocking(cluster, &self.database)?;
        Ok(self.wrap(handle))
    }

    /// Start filling the free list up to `session_pool_min` in the background.
    ///
    /// Returns `None` when called outside a tokio runtime; sessions are then
    /// created on demand by `get_session`.
    pub(crate) fn prefetch(
        self: &Arc<Self>,
        connection: Arc<ClusterConnection<D>>,
    ) -> Option<JoinHandle<()>> {
        let pool = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(async move { pool.fill(&connection).await })),
            Err(_) => {
                debug!(pool = self.pool_id, "no tokio runtime; session prefetch skipped");
                None
            }
        }
    }

    async fn fill(&self, connection: &ClusterConnection<D>) {
        loop {
            if self.is_closing() || !connection.is_usable() || self.free_count() >= self.min {
                break;
            }
            let Some(cluster) = connection.handle() else {
                break;
            };

            incr(&self.stats.prefetch_attempts);
            match self.driver.create_session(cluster, &self.database).await {
                Ok(handle) => {
                    // The connection may have started closing while the create was in flight.
                    if self.is_closing() || !connection.is_usable() {
                        self.driver.destroy_session(handle);
                        incr(&self.stats.sessions_destroyed);
                        debug!(pool = self.pool_id, %handle, "discarded prefetched session during close");
                        break;
                    }
                    incr(&self.stats.prefetch_successes);
                    let session = self.wrap(handle);
                    // Releases may have filled the list while the create was pending.
                    let pooled = {
                        let mut free = lock(&self.free);
                        if free.len() < self.max {
                            free.push(session);
                            Ok(free.len())
                        } else {
                            Err(session)
                        }
                    };
                    match pooled {
                        Ok(free) => debug!(pool = self.pool_id, free, "prefetched session"),
                        Err(session) => {
                            self.destroy(&session);
                            break;
                        }
                    }
                }
                Err(e) => {
                    incr(&self.stats.prefetch_errors);
                    warn!(pool = self.pool_id, error = %e, "session prefetch failed");
                    break;
                }
            }
        }
    }

    /// Hand out a session: a pooled one if available, else a new one.
    pub(crate) async fn get_session(&self, connection: &ClusterConnection<D>) -> PoolResult<Session> {
        let pooled = lock(&self.free).pop();
        if let Some(session) = pooled {
            incr(&self.stats.session_hits);
            debug!(pool = self.pool_id, session = session.id(), "session pool hit");
            return Ok(session);
        }
        incr(&self.stats.session_misses);
        debug!(pool = self.pool_id, "session pool miss");
        self.create(connection).await
    }

    /// Take a session back. It is destroyed instead of pooled when the pool
    /// is closing, the connection is going down, or the free list is full.
    pub(crate) fn release_session(&self, session: Session, disconnecting: bool) {
        let rejected = {
            let mut free = lock(&self.free);
            if self.is_closing() || disconnecting || free.len() >= self.max {
                Some(session)
            } else {
                free.push(session);
                None
            }
        };
        if let Some(session) = rejected {
            self.destroy(&session);
        }
    }

    fn destroy(&self, session: &Session) {
        self.driver.destroy_session(session.handle());
        incr(&self.stats.sessions_destroyed);
        debug!(pool = self.pool_id, session = session.id(), "destroyed session");
    }

    /// Destroy every session on the free list. Returns how many were destroyed.
    pub(crate) fn destroy_all(&self) -> usize {
        let sessions: Vec<Session> = lock(&self.free).drain(..).collect();
        for session in &sessions {
            self.destroy(session);
        }
        sessions.len()
    }

    /// Destroy one session that is not on the free list.
    pub(crate) fn destroy_detached(&self, session: &Session) {
        self.destroy(session);
    }
}
