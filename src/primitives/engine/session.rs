use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::durable::{self, RecordKind};
use super::table::{PendingWrites, Table};
use super::{ConnInner, Counter, EngineError, EngineResult, RawCursor, TxnConfig};

pub(crate) struct TxnWrites {
    pub(crate) table: Arc<Table>,
    pub(crate) entries: PendingWrites,
}

pub(crate) struct Txn {
    id: u64,
    snapshot: u64,
    sync: bool,
    pub(crate) writes: BTreeMap<u64, TxnWrites>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WriteMode {
    /// Fails with `Exists` when the key is already visible.
    Insert,
    /// Inserts or replaces.
    Overwrite,
    /// Fails with `NotFound` when the key is absent.
    Update,
    /// Deletes; fails with `NotFound` when the key is absent.
    Remove,
}

struct SessionState {
    txn: Option<Txn>,
    /// Bumped whenever a transaction starts or ends; positioned cursors from an
    /// older generation have lost their place.
    generation: u64,
}

pub(crate) struct SessionInner {
    id: u64,
    conn: Arc<ConnInner>,
    state: Mutex<SessionState>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(txn) = self.state.get_mut().txn.take() {
            rollback_txn(&self.conn, txn);
        }
        self.conn.sessions.fetch_sub(1, Ordering::AcqRel);
        trace!(session = self.id, "engine.session.closed");
    }
}

/// A single-threaded context for transactions and cursors.
///
/// Clones refer to the same session; the session closes when the last clone
/// (including clones held by open cursors) is dropped, rolling back any open
/// transaction.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

fn begin_txn(conn: &ConnInner, cfg: TxnConfig) -> Txn {
    Txn {
        id: conn.next_txn_id.fetch_add(1, Ordering::Relaxed),
        snapshot: conn.register_snapshot(),
        sync: cfg.sync,
        writes: BTreeMap::new(),
    }
}

fn release_claims(txn: &Txn) {
    for writes in txn.writes.values() {
        writes.table.release(writes.entries.keys(), txn.id);
    }
}

fn rollback_txn(conn: &ConnInner, txn: Txn) {
    release_claims(&txn);
    conn.release_snapshot(txn.snapshot);
    conn.bump(Counter::Rollback);
}

fn commit_txn(conn: &ConnInner, mut txn: Txn) -> EngineResult<()> {
    if txn.writes.is_empty() {
        conn.release_snapshot(txn.snapshot);
        conn.bump(Counter::Commit);
        return Ok(());
    }
    let journaled = {
        let mut state = conn.commit.lock();
        let ts = conn.clock.load(Ordering::Acquire) + 1;
        if let Some(journal) = state.journal.as_mut() {
            let payload = durable::encode_commit(ts, &txn.writes);
            let logged = journal
                .append(RecordKind::Commit, &payload)
                .and_then(|_| if txn.sync { journal.sync() } else { Ok(()) });
            if let Err(err) = logged {
                drop(state);
                rollback_txn(conn, txn);
                return Err(err);
            }
        }
        let oldest = conn.oldest_snapshot();
        let writes = std::mem::take(&mut txn.writes);
        for (_, batch) in writes {
            let keys: Vec<Vec<u8>> = batch.entries.keys().cloned().collect();
            batch.table.install(batch.entries, ts, oldest);
            batch.table.release(keys.iter(), txn.id);
        }
        conn.clock.store(ts, Ordering::Release);
        debug!(ts, txn = txn.id, "engine.commit.installed");
        state.journal.is_some()
    };
    conn.release_snapshot(txn.snapshot);
    conn.bump(Counter::Commit);
    if txn.sync {
        if journaled {
            conn.bump(Counter::JournalSync);
        } else {
            conn.checkpoint()?;
        }
    }
    conn.maybe_checkpoint()
}

fn apply_write(
    conn: &ConnInner,
    txn: &mut Txn,
    table: &Arc<Table>,
    key: &[u8],
    value: Option<Vec<u8>>,
    mode: WriteMode,
) -> EngineResult<()> {
    let exists = table
        .get(
            txn.writes.get(&table.id).map(|w| &w.entries),
            Some(txn.snapshot),
            &conn.clock,
            key,
        )
        .is_some();
    match mode {
        WriteMode::Insert if exists => {
            return Err(EngineError::Exists(format!("key in {}", table.uri)));
        }
        WriteMode::Update | WriteMode::Remove if !exists => {
            return Err(EngineError::NotFound(format!("key in {}", table.uri)));
        }
        _ => {}
    }
    if let Err(err) = table.claim(key, txn.id, txn.snapshot) {
        conn.bump(Counter::WriteConflict);
        debug!(uri = %table.uri, txn = txn.id, "engine.write.conflict");
        return Err(err);
    }
    txn.writes
        .entry(table.id)
        .or_insert_with(|| TxnWrites {
            table: Arc::clone(table),
            entries: PendingWrites::new(),
        })
        .entries
        .insert(key.to_vec(), value);
    Ok(())
}

impl Session {
    pub(crate) fn new(id: u64, conn: Arc<ConnInner>) -> Self {
        trace!(session = id, "engine.session.opened");
        Self {
            inner: Arc::new(SessionInner {
                id,
                conn,
                state: Mutex::new(SessionState {
                    txn: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Session id, unique within the connection.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Starts a transaction; configuration accepts `sync=true|false`.
    pub fn begin_transaction(&self, config: &str) -> EngineResult<()> {
        let cfg = TxnConfig::parse(config)?;
        let mut state = self.inner.state.lock();
        if state.txn.is_some() {
            return Err(EngineError::Invalid(
                "transaction already running in this session".into(),
            ));
        }
        state.txn = Some(begin_txn(&self.inner.conn, cfg));
        state.generation += 1;
        Ok(())
    }

    /// Publishes the transaction's writes.
    pub fn commit_transaction(&self) -> EngineResult<()> {
        let txn = self.take_txn("commit")?;
        commit_txn(&self.inner.conn, txn)
    }

    /// Discards the transaction's writes and releases its claims.
    pub fn rollback_transaction(&self) -> EngineResult<()> {
        let txn = self.take_txn("rollback")?;
        rollback_txn(&self.inner.conn, txn);
        Ok(())
    }

    fn take_txn(&self, what: &str) -> EngineResult<Txn> {
        let mut state = self.inner.state.lock();
        let txn = state
            .txn
            .take()
            .ok_or_else(|| EngineError::Invalid(format!("{what} without a transaction")))?;
        state.generation += 1;
        Ok(txn)
    }

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.inner.state.lock().txn.is_some()
    }

    /// Opens a cursor over `uri`. Open cursors keep the table from being dropped.
    pub fn open_cursor(&self, uri: &str) -> EngineResult<RawCursor> {
        let table = self.inner.conn.table(uri)?;
        self.inner.conn.bump(Counter::CursorOpened);
        Ok(RawCursor::new(self.clone(), table))
    }

    /// Creates a table; fails with `Exists` if `uri` is already present.
    pub fn create(&self, uri: &str, config: &str) -> EngineResult<()> {
        let conn = &self.inner.conn;
        let mut state = conn.commit.lock();
        if conn.tables.read().contains_key(uri) {
            return Err(EngineError::Exists(uri.to_string()));
        }
        let id = conn.next_table_id.fetch_add(1, Ordering::Relaxed);
        let ts = conn.clock.load(Ordering::Acquire) + 1;
        if let Some(journal) = state.journal.as_mut() {
            journal.append(RecordKind::Create, &durable::encode_create(ts, id, uri, config))?;
        }
        conn.tables.write().insert(
            uri.to_string(),
            Arc::new(Table::new(id, uri.to_string(), config.to_string())),
        );
        conn.clock.store(ts, Ordering::Release);
        debug!(uri, id, "engine.table.created");
        Ok(())
    }

    /// Drops a table. Fails with `Busy` while any cursor or transaction uses it.
    /// With `force`, a missing table is not an error.
    pub fn drop(&self, uri: &str, force: bool) -> EngineResult<()> {
        let conn = &self.inner.conn;
        let mut state = conn.commit.lock();
        let table = match conn.tables.read().get(uri) {
            Some(table) => Arc::clone(table),
            None if force => return Ok(()),
            None => return Err(EngineError::NotFound(uri.to_string())),
        };
        if table.is_busy() {
            return Err(EngineError::Busy(uri.to_string()));
        }
        let ts = conn.clock.load(Ordering::Acquire) + 1;
        if let Some(journal) = state.journal.as_mut() {
            journal.append(RecordKind::Drop, &durable::encode_drop(ts, uri))?;
        }
        conn.tables.write().remove(uri);
        conn.clock.store(ts, Ordering::Release);
        debug!(uri, "engine.table.dropped");
        Ok(())
    }

    /// Discards versions no live snapshot can see.
    pub fn compact(&self, uri: &str) -> EngineResult<()> {
        let conn = &self.inner.conn;
        let table = conn.table(uri)?;
        let _serial = conn.commit.lock();
        let reclaimed = table.compact(conn.oldest_snapshot());
        debug!(uri, reclaimed, "engine.table.compacted");
        Ok(())
    }

    /// Checks the ordering of `uri`'s committed entries.
    pub fn verify(&self, uri: &str) -> EngineResult<()> {
        self.inner.conn.table(uri)?.verify()
    }

    /// Approximate bytes used by the newest committed state of `uri`.
    pub fn table_size(&self, uri: &str) -> EngineResult<u64> {
        Ok(self.inner.conn.table(uri)?.data_size())
    }

    /// Writes a checkpoint of every table.
    pub fn checkpoint(&self) -> EngineResult<()> {
        self.inner.conn.checkpoint()
    }

    /// Waits for every commit so far to be durable.
    pub fn log_flush(&self) -> EngineResult<()> {
        self.inner.conn.sync_log()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    pub(crate) fn read(&self, table: &Table, key: &[u8]) -> Option<Vec<u8>> {
        let state = self.inner.state.lock();
        let (pending, snapshot) = view(&state, table);
        table.get(pending, snapshot, &self.inner.conn.clock, key)
    }

    pub(crate) fn step(
        &self,
        table: &Table,
        from: Bound<&[u8]>,
        forward: bool,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let state = self.inner.state.lock();
        let (pending, snapshot) = view(&state, table);
        table.step(pending, snapshot, &self.inner.conn.clock, from, forward)
    }

    /// Applies one write inside the running transaction, or as its own
    /// transaction when none is running.
    pub(crate) fn write(
        &self,
        table: &Arc<Table>,
        key: &[u8],
        value: Option<Vec<u8>>,
        mode: WriteMode,
    ) -> EngineResult<()> {
        let conn = &self.inner.conn;
        let mut state = self.inner.state.lock();
        if let Some(txn) = state.txn.as_mut() {
            return apply_write(conn, txn, table, key, value, mode);
        }
        drop(state);
        let mut txn = begin_txn(conn, TxnConfig::default());
        match apply_write(conn, &mut txn, table, key, value, mode) {
            Ok(()) => commit_txn(conn, txn),
            Err(err) => {
                rollback_txn(conn, txn);
                Err(err)
            }
        }
    }
}

fn view<'a>(state: &'a SessionState, table: &Table) -> (Option<&'a PendingWrites>, Option<u64>) {
    match state.txn.as_ref() {
        Some(txn) => (
            txn.writes.get(&table.id).map(|w| &w.entries),
            Some(txn.snapshot),
        ),
        None => (None, None),
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.inner.id).finish()
    }
}
