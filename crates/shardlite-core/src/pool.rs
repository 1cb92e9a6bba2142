//! Bounded pool of SQLite connections for a single shard.
//!
//! A single mutex guards the idle queue and the checked-out counter. Callers
//! that find the pool saturated park on a condition variable until a
//! connection is released, the pool is closed, or their deadline passes.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MAX_TIMEOUT;
use crate::error::{Result, ShardError};
use crate::strategy::ShardId;

/// Configuration for a connection pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Hard cap on concurrently checked-out connections.
    pub max_connections: usize,
    /// Maximum time `acquire` waits for a connection.
    pub acquire_timeout: Duration,
    /// Reissue a pooled connection only to the thread that opened it.
    pub same_thread_required: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            same_thread_required: false,
        }
    }
}

/// Read-only snapshot of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub active: usize,
    pub idle_count: usize,
    pub max_connections: usize,
    pub total_created: u64,
}

/// A live connection plus the bookkeeping the pool needs to reissue it.
struct Slot {
    id: u64,
    owner: ThreadId,
    conn: Connection,
}

struct PoolState {
    idle: VecDeque<Slot>,
    active: usize,
    total_created: u64,
    closed: bool,
}

impl PoolState {
    fn take_idle(&mut self, same_thread: bool, me: ThreadId) -> Option<Slot> {
        if !same_thread {
            return self.idle.pop_front();
        }
        let pos = self.idle.iter().position(|slot| slot.owner == me)?;
        self.idle.remove(pos)
    }
}

/// Connection pool for one shard's database file.
pub struct ConnectionPool {
    shard_id: ShardId,
    path: PathBuf,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl ConnectionPool {
    /// Create a pool for the database at `path`. No connection is opened
    /// until the first `acquire`.
    pub fn new(shard_id: ShardId, path: impl Into<PathBuf>, config: PoolConfig) -> Result<Arc<Self>> {
        if config.max_connections == 0 {
            return Err(ShardError::Config(
                "max_connections must be a positive integer".into(),
            ));
        }
        if config.acquire_timeout > MAX_TIMEOUT {
            return Err(ShardError::Config(format!(
                "acquire_timeout must be at most {MAX_TIMEOUT:?}"
            )));
        }
        Ok(Arc::new(ConnectionPool {
            shard_id,
            path: path.into(),
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: 0,
                total_created: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }))
    }

    /// Acquire a connection, waiting up to the configured timeout.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        self.acquire_within(self.config.acquire_timeout)
    }

    /// Acquire a connection, waiting up to `timeout`.
    ///
    /// Idle connections are reused first; otherwise a new one is opened while
    /// fewer than `max_connections` are checked out. Fails with
    /// [`ShardError::PoolExhausted`] once `timeout` elapses and with
    /// [`ShardError::PoolClosed`] after [`close_all`](Self::close_all).
    pub fn acquire_within(self: &Arc<Self>, timeout: Duration) -> Result<PooledConnection> {
        let started = Instant::now();
        let deadline = started + timeout.min(MAX_TIMEOUT);
        let me = thread::current().id();
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(ShardError::PoolClosed {
                    shard_id: self.shard_id,
                });
            }

            if let Some(slot) = state.take_idle(self.config.same_thread_required, me) {
                state.active += 1;
                return Ok(PooledConnection::new(slot, Arc::clone(self)));
            }

            if state.active < self.config.max_connections {
                return self.open_reserved(state, me);
            }

            if Instant::now() >= deadline {
                return Err(ShardError::PoolExhausted {
                    shard_id: self.shard_id,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            self.available.wait_until(&mut state, deadline);
        }
    }

    /// Open a fresh connection in a slot reserved under the lock.
    fn open_reserved(
        self: &Arc<Self>,
        mut state: MutexGuard<'_, PoolState>,
        me: ThreadId,
    ) -> Result<PooledConnection> {
        // Idle handles owned by other threads still count toward the cap.
        if state.active + state.idle.len() >= self.config.max_connections {
            if let Some(evicted) = state.idle.pop_front() {
                close_quietly(self.shard_id, evicted);
            }
        }
        state.active += 1;
        let opened = MutexGuard::unlocked(&mut state, || self.open_connection());

        match opened {
            Ok(conn) if !state.closed => {
                state.total_created += 1;
                let slot = Slot {
                    id: state.total_created,
                    owner: me,
                    conn,
                };
                debug!(shard_id = self.shard_id, conn_id = slot.id, "opened shard connection");
                Ok(PooledConnection::new(slot, Arc::clone(self)))
            }
            Ok(conn) => {
                state.active -= 1;
                drop(state);
                let _ = conn.close();
                Err(ShardError::PoolClosed {
                    shard_id: self.shard_id,
                })
            }
            Err(e) => {
                state.active -= 1;
                self.available.notify_one();
                Err(e.into_unavailable(self.shard_id))
            }
        }
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.config.acquire_timeout)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            debug!(shard_id = self.shard_id, %mode, "journal mode is not WAL");
        }
        Ok(conn)
    }

    /// Return a connection to the idle set, or discard it if it is no longer usable.
    fn release(&self, slot: Slot) {
        let healthy = reset_for_reuse(&slot.conn);
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        let rejected = if healthy && !state.closed {
            state.idle.push_back(slot);
            None
        } else {
            Some(slot)
        };
        self.available.notify_one();
        drop(state);

        if let Some(slot) = rejected {
            if !healthy {
                debug!(shard_id = self.shard_id, conn_id = slot.id, "discarding unhealthy connection");
            }
            close_quietly(self.shard_id, slot);
        }
    }

    fn discard(&self, slot: Slot) {
        {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            self.available.notify_one();
        }
        close_quietly(self.shard_id, slot);
    }

    /// Close every idle connection and reject further acquisitions.
    ///
    /// Checked-out connections are closed as they are released. Must run
    /// before the shard's database file is moved or deleted.
    pub fn close_all(&self) {
        let drained: Vec<Slot> = {
            let mut state = self.state.lock();
            state.closed = true;
            self.available.notify_all();
            state.idle.drain(..).collect()
        };
        let count = drained.len();
        for slot in drained {
            close_quietly(self.shard_id, slot);
        }
        debug!(shard_id = self.shard_id, closed = count, "connection pool closed");
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            active: state.active,
            idle_count: state.idle.len(),
            max_connections: self.config.max_connections,
            total_created: state.total_created,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("ConnectionPool")
            .field("shard_id", &self.shard_id)
            .field("path", &self.path)
            .field("active", &stats.active)
            .field("idle", &stats.idle_count)
            .field("max", &stats.max_connections)
            .finish()
    }
}

/// Roll back any transaction left open on the handle and check it still answers.
fn reset_for_reuse(conn: &Connection) -> bool {
    if !conn.is_autocommit() {
        if let Err(e) = conn.execute_batch("ROLLBACK") {
            debug!(error = %e, "rollback on release failed");
            return false;
        }
    }
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .is_ok()
}

fn close_quietly(shard_id: ShardId, slot: Slot) {
    if let Err((_, e)) = slot.conn.close() {
        debug!(shard_id, conn_id = slot.id, error = %e, "error closing connection");
    }
}

/// A checked-out connection. Returns itself to the pool on drop.
pub struct PooledConnection {
    slot: Option<Slot>,
    pool: Arc<ConnectionPool>,
}

impl PooledConnection {
    fn new(slot: Slot, pool: Arc<ConnectionPool>) -> Self {
        PooledConnection {
            slot: Some(slot),
            pool,
        }
    }

    /// Pool-unique id of the underlying connection.
    pub fn id(&self) -> u64 {
        self.slot.as_ref().map(|s| s.id).unwrap_or(0)
    }

    pub fn shard_id(&self) -> ShardId {
        self.pool.shard_id
    }

    /// Close the connection instead of returning it to the pool.
    pub fn discard(mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.discard(slot);
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.slot {
            Some(slot) => &slot.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.slot {
            Some(slot) => &mut slot.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("shard_id", &self.pool.shard_id)
            .field("id", &self.id())
            .finish()
    }
}
