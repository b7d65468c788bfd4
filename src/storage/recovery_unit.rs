//! Units of work over the embedded engine.
//!
//! A [`RecoveryUnit`] belongs to one operation. Units of work nest; only the
//! outermost `begin` opens an engine transaction and only the outermost
//! `commit` or `end` closes it. Registered [`Change`]s fire exactly once: in
//! registration order after a commit, in reverse order after a rollback.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, error, trace};

use crate::invariant;
use crate::operation::OperationContext;
use crate::primitives::engine::{map_engine_error, RawCursor};
use crate::storage::session_cache::{PooledSession, SessionCache, SessionLease};
use crate::types::{invariant_failure, Result};

/// Work to finish or undo when the enclosing unit of work resolves.
///
/// Ownership moves to the recovery unit on registration; exactly one of the
/// two methods runs, once.
pub trait Change: Send {
    /// Called after the unit of work committed.
    fn commit(self: Box<Self>);
    /// Called after the unit of work rolled back.
    fn rollback(self: Box<Self>);
}

struct FnChange<C, R> {
    on_commit: C,
    on_rollback: R,
}

impl<C, R> Change for FnChange<C, R>
where
    C: FnOnce() + Send,
    R: FnOnce() + Send,
{
    fn commit(self: Box<Self>) {
        (self.on_commit)()
    }

    fn rollback(self: Box<Self>) {
        (self.on_rollback)()
    }
}

/// Builds a [`Change`] from a pair of closures.
pub fn change_fn<C, R>(on_commit: C, on_rollback: R) -> Box<dyn Change>
where
    C: FnOnce() + Send + 'static,
    R: FnOnce() + Send + 'static,
{
    Box::new(FnChange {
        on_commit,
        on_rollback,
    })
}

/// A [`Change`] that only acts on rollback.
pub fn on_rollback<R>(undo: R) -> Box<dyn Change>
where
    R: FnOnce() + Send + 'static,
{
    change_fn(|| {}, undo)
}

/// A [`Change`] that only acts on commit.
pub fn on_commit<C>(finish: C) -> Box<dyn Change>
where
    C: FnOnce() + Send + 'static,
{
    change_fn(finish, || {})
}

/// Per-operation transaction lifecycle.
pub trait RecoveryUnit: Send {
    /// Enters a (possibly nested) unit of work.
    fn begin_unit_of_work(&mut self) -> Result<()>;

    /// Commits the outermost unit of work; a no-op when nested.
    ///
    /// A write conflict still closes the unit of work, rolls back registered
    /// changes, and surfaces as [`crate::types::DuskError::WriteConflict`].
    fn commit_unit_of_work(&mut self) -> Result<()>;

    /// Leaves a unit of work; leaving the outermost one without a commit rolls
    /// it back.
    fn end_unit_of_work(&mut self);

    /// Hands `change` to the active unit of work.
    fn register_change(&mut self, change: Box<dyn Change>);

    /// Marks that the caller will wait for durability of the next commit.
    fn going_to_await_commit(&mut self);

    /// Blocks until every commit so far is durable.
    fn await_commit(&mut self) -> Result<()>;

    /// Commits any read transaction so the next access takes a new snapshot.
    fn commit_and_restart(&mut self) -> Result<()>;

    /// Drops the current read snapshot outside a unit of work.
    fn abandon_snapshot(&mut self);

    /// Called when the owning operation context gives this unit away.
    fn being_released_from_operation_context(&mut self);

    /// Called when an operation context adopts this unit.
    fn being_set_on_operation_context(&mut self);

    /// Current unit-of-work nesting depth.
    fn depth(&self) -> i32;

    /// Returns `true` while an engine transaction is open.
    fn in_active_txn(&self) -> bool;

    /// Diagnostic snapshot of the unit's state.
    fn report_state(&self) -> serde_json::Value;

    /// Downcast hook for engine-specific recovery units.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// [`RecoveryUnit`] bound to a [`SessionCache`].
pub struct KvRecoveryUnit {
    cache: Arc<SessionCache>,
    lease: Option<SessionLease>,
    depth: i32,
    active: bool,
    ever_started_write: bool,
    syncing: bool,
    detached: bool,
    txn_started: Option<Instant>,
    changes: Vec<Box<dyn Change>>,
}

impl KvRecoveryUnit {
    /// Recovery unit that borrows sessions from `cache`.
    pub fn new(cache: Arc<SessionCache>) -> Self {
        Self {
            cache,
            lease: None,
            depth: 0,
            active: false,
            ever_started_write: false,
            syncing: false,
            detached: false,
            txn_started: None,
            changes: Vec::new(),
        }
    }

    /// The operation's recovery unit, which must be a `KvRecoveryUnit`.
    pub fn get(opctx: &mut OperationContext) -> &mut KvRecoveryUnit {
        match opctx
            .recovery_unit_mut()
            .as_any_mut()
            .downcast_mut::<KvRecoveryUnit>()
        {
            Some(ru) => ru,
            None => invariant_failure(
                "downcast",
                format_args!("operation is not running on a KV recovery unit"),
            ),
        }
    }

    /// Pool this unit borrows sessions from.
    pub fn session_cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    /// Session for this unit, opening a transaction if none is active.
    pub fn get_session(&mut self) -> Result<Arc<PooledSession>> {
        invariant!(
            !self.detached,
            "recovery unit used while detached from its operation"
        );
        if self.lease.is_none() {
            self.lease = Some(self.cache.get_session()?);
        }
        if !self.active {
            self.txn_open()?;
        }
        match self.lease.as_ref() {
            Some(lease) => Ok(Arc::clone(lease.get())),
            None => invariant_failure("lease.is_some()", format_args!("session lease vanished")),
        }
    }

    /// Whether a unit of work is open.
    pub fn in_unit_of_work(&self) -> bool {
        self.depth > 0
    }

    fn session(&self) -> Option<&crate::primitives::engine::Session> {
        self.lease.as_ref().map(|lease| lease.session())
    }

    fn txn_open(&mut self) -> Result<()> {
        let config = if self.syncing { "sync=true" } else { "" };
        if let Some(session) = self.session() {
            session
                .begin_transaction(config)
                .map_err(map_engine_error)?;
        }
        self.active = true;
        self.txn_started = Some(Instant::now());
        trace!(depth = self.depth, syncing = self.syncing, "recovery_unit.txn_open");
        Ok(())
    }

    fn txn_close(&mut self, commit: bool) -> Result<()> {
        let result = match self.session() {
            Some(session) if commit => session.commit_transaction().map_err(map_engine_error),
            Some(session) => session.rollback_transaction().map_err(map_engine_error),
            None => Ok(()),
        };
        self.active = false;
        self.txn_started = None;
        self.syncing = false;
        trace!(commit, ok = result.is_ok(), "recovery_unit.txn_close");
        result
    }

    fn fire_commits(&mut self) {
        for change in std::mem::take(&mut self.changes) {
            change.commit();
        }
    }

    fn fire_rollbacks(&mut self) {
        for change in std::mem::take(&mut self.changes).into_iter().rev() {
            change.rollback();
        }
    }

    fn abort(&mut self) {
        if self.active {
            if let Err(err) = self.txn_close(false) {
                error!(error = %err, "recovery_unit.rollback_failed");
            }
        }
        self.fire_rollbacks();
    }
}

impl RecoveryUnit for KvRecoveryUnit {
    fn begin_unit_of_work(&mut self) -> Result<()> {
        self.depth += 1;
        self.ever_started_write = true;
        if self.depth == 1 && !self.active {
            if let Err(err) = self.get_session() {
                self.depth -= 1;
                return Err(err);
            }
        }
        Ok(())
    }

    fn commit_unit_of_work(&mut self) -> Result<()> {
        invariant!(self.depth > 0, "commit outside a unit of work");
        if self.depth > 1 {
            return Ok(());
        }
        let result = if self.active {
            self.txn_close(true)
        } else {
            Ok(())
        };
        match result {
            Ok(()) => {
                self.fire_commits();
                Ok(())
            }
            Err(err) => {
                debug!(error = %err, "recovery_unit.commit_failed");
                self.fire_rollbacks();
                Err(err)
            }
        }
    }

    fn end_unit_of_work(&mut self) {
        invariant!(
            self.depth > 0,
            "end_unit_of_work without a matching begin (depth {})",
            self.depth
        );
        self.depth -= 1;
        if self.depth == 0 {
            self.abort();
        }
    }

    fn register_change(&mut self, change: Box<dyn Change>) {
        invariant!(self.depth > 0, "registering a change outside a unit of work");
        self.changes.push(change);
    }

    fn going_to_await_commit(&mut self) {
        self.syncing = true;
    }

    fn await_commit(&mut self) -> Result<()> {
        self.cache
            .connection()
            .sync_log()
            .map_err(map_engine_error)
    }

    fn commit_and_restart(&mut self) -> Result<()> {
        invariant!(self.depth == 0, "commit_and_restart inside a unit of work");
        if self.active {
            self.txn_close(true)?;
        }
        Ok(())
    }

    fn abandon_snapshot(&mut self) {
        invariant!(self.depth == 0, "abandon_snapshot inside a unit of work");
        if self.active {
            if let Err(err) = self.txn_close(false) {
                error!(error = %err, "recovery_unit.abandon_failed");
            }
        }
    }

    fn being_released_from_operation_context(&mut self) {
        self.detached = true;
        if !self.active {
            self.lease = None;
        }
    }

    fn being_set_on_operation_context(&mut self) {
        self.detached = false;
    }

    fn depth(&self) -> i32 {
        self.depth
    }

    fn in_active_txn(&self) -> bool {
        self.active
    }

    fn report_state(&self) -> serde_json::Value {
        json!({
            "depth": self.depth,
            "active": self.active,
            "everStartedWrite": self.ever_started_write,
            "syncing": self.syncing,
            "detached": self.detached,
            "pendingChanges": self.changes.len(),
            "txnAgeMillis": self.txn_started.map(|t| t.elapsed().as_millis() as u64),
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for KvRecoveryUnit {
    fn drop(&mut self) {
        if self.depth > 0 {
            error!(depth = self.depth, "recovery unit dropped inside a unit of work");
        }
        self.abort();
    }
}

impl std::fmt::Debug for KvRecoveryUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvRecoveryUnit")
            .field("depth", &self.depth)
            .field("active", &self.active)
            .field("changes", &self.changes.len())
            .finish()
    }
}

/// A raw cursor checked out of a pooled session's cache for one table.
///
/// Returns the cursor to the cache when dropped.
pub struct KvCursor {
    session: Arc<PooledSession>,
    table_id: u64,
    cursor: Option<RawCursor>,
}

impl KvCursor {
    /// Opens a cursor on `uri` inside the operation's transaction.
    pub fn new(uri: &str, table_id: u64, ru: &mut KvRecoveryUnit) -> Result<Self> {
        let session = ru.get_session()?;
        let cursor = session.get_cursor(uri, table_id)?;
        Ok(Self {
            session,
            table_id,
            cursor: Some(cursor),
        })
    }

    /// The underlying engine cursor.
    pub fn get(&mut self) -> &mut RawCursor {
        match self.cursor.as_mut() {
            Some(cursor) => cursor,
            None => invariant_failure("cursor.is_some()", format_args!("cursor used after release")),
        }
    }
}

impl Drop for KvCursor {
    fn drop(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            self.session.release_cursor(self.table_id, cursor);
        }
    }
}
