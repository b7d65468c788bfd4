use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::primitives::engine::{map_engine_error, Connection, RawCursor, Session};
use crate::types::Result;

/// Idle cursors kept per pooled session.
pub const MAX_CACHED_CURSORS: usize = 10;

/// One engine session plus its idle cursor cache.
///
/// Shared through `Arc` between the lease that checked it out and the cursor
/// wrappers opened on it; the session closes when the last reference goes.
pub struct PooledSession {
    session: Session,
    epoch: u64,
    /// Most recently released first.
    cursors: Mutex<Vec<(u64, RawCursor)>>,
}

impl PooledSession {
    fn new(session: Session, epoch: u64) -> Self {
        Self {
            session,
            epoch,
            cursors: Mutex::new(Vec::new()),
        }
    }

    /// The underlying engine session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Returns a cached cursor for `table_id` or opens a new one on `uri`.
    pub fn get_cursor(&self, uri: &str, table_id: u64) -> Result<RawCursor> {
        let cached = {
            let mut cursors = self.cursors.lock();
            cursors
                .iter()
                .position(|(id, _)| *id == table_id)
                .map(|pos| cursors.remove(pos).1)
        };
        match cached {
            Some(cursor) => Ok(cursor),
            None => self.session.open_cursor(uri).map_err(map_engine_error),
        }
    }

    /// Puts `cursor` back in the cache, closing the least recently used one
    /// when the cache is full.
    pub fn release_cursor(&self, table_id: u64, mut cursor: RawCursor) {
        cursor.reset();
        let evicted = {
            let mut cursors = self.cursors.lock();
            cursors.insert(0, (table_id, cursor));
            if cursors.len() > MAX_CACHED_CURSORS {
                cursors.pop()
            } else {
                None
            }
        };
        drop(evicted);
    }

    /// Closes every cached cursor.
    pub fn close_all_cursors(&self) {
        let closed = std::mem::take(&mut *self.cursors.lock());
        drop(closed);
    }

    /// Number of idle cursors currently cached.
    pub fn cached_cursors(&self) -> usize {
        self.cursors.lock().len()
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("session", &self.session)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Pool of reusable engine sessions.
///
/// The pool lock guards only the idle list; engine calls (opening, rolling
/// back, closing) always happen outside it.
pub struct SessionCache {
    conn: Connection,
    idle: Mutex<Vec<Arc<PooledSession>>>,
    epoch: AtomicU64,
    next_table_id: AtomicU64,
}

impl SessionCache {
    /// Empty pool over `conn`.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            idle: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
            next_table_id: AtomicU64::new(1),
        }
    }

    /// Connection the pooled sessions belong to.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Process-unique id used to key cached cursors for one table handle.
    pub fn gen_table_id(&self) -> u64 {
        self.next_table_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Leases an idle session or opens a new one.
    pub fn get_session(self: &Arc<Self>) -> Result<SessionLease> {
        let reused = self.idle.lock().pop();
        let pooled = match reused {
            Some(pooled) => pooled,
            None => {
                let session = self.conn.open_session().map_err(map_engine_error)?;
                let epoch = self.epoch.load(Ordering::Acquire);
                Arc::new(PooledSession::new(session, epoch))
            }
        };
        Ok(SessionLease {
            pooled: Some(pooled),
            cache: Arc::clone(self),
        })
    }

    fn release(&self, pooled: Arc<PooledSession>) {
        if pooled.session.in_transaction() {
            warn!(
                session = pooled.session.id(),
                "session returned with an open transaction; rolling back"
            );
            if let Err(err) = pooled.session.rollback_transaction() {
                warn!(error = %err, "session rollback on release failed");
            }
            return;
        }
        if Arc::strong_count(&pooled) > 1 {
            // Still referenced by an open cursor wrapper; it closes with the
            // last reference instead of going back to the pool.
            return;
        }
        let mut idle = self.idle.lock();
        if pooled.epoch == self.epoch.load(Ordering::Acquire) {
            idle.push(pooled);
        }
    }

    /// Discards every idle session and makes sessions leased before this call
    /// close instead of returning to the pool.
    pub fn close_all(&self) {
        let drained = {
            let mut idle = self.idle.lock();
            self.epoch.fetch_add(1, Ordering::AcqRel);
            std::mem::take(&mut *idle)
        };
        debug!(closed = drained.len(), "session_cache.close_all");
        drop(drained);
    }

    /// Number of idle pooled sessions.
    pub fn idle_sessions(&self) -> usize {
        self.idle.lock().len()
    }

    /// Bumped on every shutdown or close of all sessions; pooled sessions from older epochs are discarded.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache")
            .field("idle", &self.idle_sessions())
            .field("epoch", &self.epoch())
            .finish()
    }
}

/// Scoped checkout of one pooled session; returns it to the pool on drop.
pub struct SessionLease {
    pooled: Option<Arc<PooledSession>>,
    cache: Arc<SessionCache>,
}

impl SessionLease {
    /// The leased session, shareable with cursor wrappers.
    pub fn get(&self) -> &Arc<PooledSession> {
        match self.pooled.as_ref() {
            Some(pooled) => pooled,
            None => crate::types::invariant_failure(
                "pooled.is_some()",
                format_args!("session lease used after release"),
            ),
        }
    }

    /// The wrapped engine session.
    pub fn session(&self) -> &Session {
        self.get().session()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.cache.release(pooled);
        }
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("session", &self.pooled)
            .finish()
    }
}
