#![forbid(unsafe_code)]

//! Embedded ordered key/value engine with snapshot-isolated transactions.
//!
//! The engine exposes connections, sessions and cursors over named tables
//! (`table:<name>`). Each session runs at most one transaction at a time;
//! outside a transaction every cursor write commits on its own. Writes that
//! touch a key already written by a concurrent transaction, or committed after
//! the writer's snapshot, fail immediately with [`EngineError::WriteConflict`].
//!
//! Durability comes from a checkpoint file plus an optional journal that is
//! replayed on open; the `durable` module documents the on-disk formats.

mod config;
mod cursor;
mod durable;
mod session;
mod table;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::types::{DuskError, Result};

pub use config::{
    parse_config, parse_size, CheckpointConfig, ConfigItem, ConfigValue, LogConfig, OpenConfig,
    TxnConfig,
};
pub use cursor::RawCursor;
pub use session::Session;

use durable::Journal;
use table::Table;

/// Errors reported by the engine before they are mapped onto [`DuskError`].
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// The target is in use by an open cursor or transaction.
    #[error("resource busy: {0}")]
    Busy(String),
    /// A concurrent transaction already claimed the key.
    #[error("write conflict on {0}")]
    WriteConflict(String),
    /// The table or key does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// The table already exists.
    #[error("{0} already exists")]
    Exists(String),
    /// Malformed configuration or misuse of the API.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// The cursor's position no longer exists; reposition before reading.
    #[error("cursor position lost: {0}")]
    CursorReset(String),
    /// Every session slot is taken.
    #[error("session limit of {0} reached")]
    SessionLimit(usize),
    /// A checkpoint or journal record failed its checksum.
    #[error("corruption: {0}")]
    Corruption(String),
    /// Filesystem failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DuskError> for EngineError {
    fn from(err: DuskError) -> Self {
        match err {
            DuskError::Io(io) => EngineError::Io(io),
            other => EngineError::Corruption(other.to_string()),
        }
    }
}

/// Result alias for engine calls.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Maps an engine failure onto the crate error taxonomy.
///
/// `NotFound` and `Exists` are usually handled by callers before mapping;
/// when they leak through they keep their meaning.
pub fn map_engine_error(err: EngineError) -> DuskError {
    match err {
        EngineError::Busy(what) => DuskError::ResourceBusy(what),
        EngineError::WriteConflict(_) => DuskError::WriteConflict,
        EngineError::NotFound(what) => DuskError::NotFound(what),
        EngineError::Exists(what) => DuskError::DuplicateKey(what),
        EngineError::Corruption(msg) => DuskError::Corruption(msg),
        EngineError::Io(io) => DuskError::Io(io),
        other => DuskError::Engine(other.to_string()),
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EngineStats {
    /// Sessions currently open.
    pub sessions_open: u64,
    /// Cursors opened since startup.
    pub cursors_opened: u64,
    /// Committed transactions.
    pub commits: u64,
    /// Rolled-back transactions.
    pub rollbacks: u64,
    /// Commits refused because another writer claimed a key first.
    pub write_conflicts: u64,
    /// Checkpoints written.
    pub checkpoints: u64,
    /// Journal fsyncs.
    pub journal_syncs: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    cursors_opened: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    write_conflicts: AtomicU64,
    checkpoints: AtomicU64,
    journal_syncs: AtomicU64,
}

pub(crate) enum Counter {
    CursorOpened,
    Commit,
    Rollback,
    WriteConflict,
    Checkpoint,
    JournalSync,
}

/// State serialised by the commit lock: the journal and checkpoint bookkeeping.
pub(crate) struct CommitState {
    pub(crate) journal: Option<Journal>,
    pub(crate) last_checkpoint: Instant,
}

pub(crate) struct ConnInner {
    pub(crate) dir: PathBuf,
    pub(crate) config: OpenConfig,
    pub(crate) tables: RwLock<HashMap<String, Arc<Table>>>,
    pub(crate) next_table_id: AtomicU64,
    pub(crate) next_txn_id: AtomicU64,
    next_session_id: AtomicU64,
    /// Timestamp of the newest fully installed commit.
    pub(crate) clock: AtomicU64,
    pub(crate) commit: Mutex<CommitState>,
    /// Active snapshot timestamps with their reference counts.
    pub(crate) snapshots: Mutex<BTreeMap<u64, usize>>,
    pub(crate) sessions: AtomicUsize,
    counters: Counters,
    closed: AtomicBool,
}

impl ConnInner {
    pub(crate) fn bump(&self, counter: Counter) {
        if !self.config.statistics {
            return;
        }
        let slot = match counter {
            Counter::CursorOpened => &self.counters.cursors_opened,
            Counter::Commit => &self.counters.commits,
            Counter::Rollback => &self.counters.rollbacks,
            Counter::WriteConflict => &self.counters.write_conflicts,
            Counter::Checkpoint => &self.counters.checkpoints,
            Counter::JournalSync => &self.counters.journal_syncs,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn register_snapshot(&self) -> u64 {
        let mut snaps = self.snapshots.lock();
        let ts = self.clock.load(Ordering::Acquire);
        *snaps.entry(ts).or_insert(0) += 1;
        ts
    }

    pub(crate) fn release_snapshot(&self, ts: u64) {
        let mut snaps = self.snapshots.lock();
        if let Some(count) = snaps.get_mut(&ts) {
            *count -= 1;
            if *count == 0 {
                snaps.remove(&ts);
            }
        }
    }

    /// Oldest timestamp any reader may still need.
    pub(crate) fn oldest_snapshot(&self) -> u64 {
        let snaps = self.snapshots.lock();
        snaps
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.clock.load(Ordering::Acquire))
    }

    pub(crate) fn table(&self, uri: &str) -> EngineResult<Arc<Table>> {
        self.tables
            .read()
            .get(uri)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(uri.to_string()))
    }

    fn checkpoint_due(&self, state: &CommitState) -> bool {
        let cfg = &self.config.checkpoint;
        let by_time =
            cfg.wait_secs > 0 && state.last_checkpoint.elapsed().as_secs() >= cfg.wait_secs;
        let by_size = cfg.log_size > 0
            && state
                .journal
                .as_ref()
                .is_some_and(|j| j.len() >= cfg.log_size);
        by_time || by_size
    }

    /// Runs a checkpoint if one of the configured triggers fired.
    pub(crate) fn maybe_checkpoint(&self) -> EngineResult<()> {
        let due = {
            let state = self.commit.lock();
            self.checkpoint_due(&state)
        };
        if due {
            debug!(dir = %self.dir.display(), "engine.checkpoint.triggered");
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Writes every table's newest committed state to the checkpoint file.
    pub(crate) fn checkpoint(&self) -> EngineResult<()> {
        let mut state = self.commit.lock();
        let ts = self.clock.load(Ordering::Acquire);
        let tables: Vec<Arc<Table>> = self.tables.read().values().cloned().collect();
        durable::write_checkpoint(
            &self.dir,
            ts,
            self.next_table_id.load(Ordering::Relaxed),
            &tables,
        )?;
        if self.config.log.archive {
            if let Some(journal) = state.journal.as_mut() {
                journal.truncate()?;
            }
        }
        state.last_checkpoint = Instant::now();
        self.bump(Counter::Checkpoint);
        debug!(ts, tables = tables.len(), "engine.checkpoint.done");
        Ok(())
    }

    /// Makes every commit so far durable.
    pub(crate) fn sync_log(&self) -> EngineResult<()> {
        let needs_checkpoint = {
            let mut state = self.commit.lock();
            match state.journal.as_mut() {
                Some(journal) => {
                    journal.sync()?;
                    self.bump(Counter::JournalSync);
                    false
                }
                None => true,
            }
        };
        if needs_checkpoint {
            self.checkpoint()?;
        }
        Ok(())
    }
}

/// Handle to an open engine instance. Clones share the same instance.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    /// Opens (or with `create`, initialises) the engine rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, config: &str) -> EngineResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let config = OpenConfig::parse(config)?;
        if !dir.exists() {
            if !config.create {
                return Err(EngineError::NotFound(format!(
                    "database directory {}",
                    dir.display()
                )));
            }
            std::fs::create_dir_all(&dir)?;
        }

        let mut tables = HashMap::new();
        let mut clock = 0;
        let mut next_table_id = 1;
        if let Some(image) = durable::read_checkpoint(&dir)? {
            clock = image.ts;
            next_table_id = image.next_table_id;
            for table in image.tables {
                tables.insert(table.uri.clone(), Arc::new(table));
            }
        }

        let journal = if config.log.enabled {
            let journal_dir = dir.join(&config.log.path);
            std::fs::create_dir_all(&journal_dir)?;
            let (journal, records) = Journal::open(&journal_dir)?;
            let replayed = records.len();
            let checkpoint_ts = clock;
            for record in records {
                durable::apply_record(
                    record,
                    checkpoint_ts,
                    &mut tables,
                    &mut next_table_id,
                    &mut clock,
                );
            }
            if replayed > 0 {
                info!(records = replayed, ts = clock, "engine.journal.replayed");
            }
            Some(journal)
        } else {
            None
        };

        info!(
            dir = %dir.display(),
            tables = tables.len(),
            ts = clock,
            journal = config.log.enabled,
            "engine.open"
        );

        Ok(Self {
            inner: Arc::new(ConnInner {
                dir,
                config,
                tables: RwLock::new(tables),
                next_table_id: AtomicU64::new(next_table_id),
                next_txn_id: AtomicU64::new(1),
                next_session_id: AtomicU64::new(1),
                clock: AtomicU64::new(clock),
                commit: Mutex::new(CommitState {
                    journal,
                    last_checkpoint: Instant::now(),
                }),
                snapshots: Mutex::new(BTreeMap::new()),
                sessions: AtomicUsize::new(0),
                counters: Counters::default(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Opens a new session, failing once `session_max` sessions are live.
    pub fn open_session(&self) -> EngineResult<Session> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(EngineError::Invalid("connection is closed".into()));
        }
        let max = self.inner.config.session_max;
        let prev = self.inner.sessions.fetch_add(1, Ordering::AcqRel);
        if prev >= max {
            self.inner.sessions.fetch_sub(1, Ordering::AcqRel);
            return Err(EngineError::SessionLimit(max));
        }
        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        Ok(Session::new(id, Arc::clone(&self.inner)))
    }

    /// Checkpoints and refuses further sessions.
    pub fn close(&self) -> EngineResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.checkpoint()?;
        info!(dir = %self.inner.dir.display(), "engine.close");
        Ok(())
    }

    /// Forces a checkpoint now.
    pub fn checkpoint(&self) -> EngineResult<()> {
        self.inner.checkpoint()
    }

    /// Flushes the journal, or checkpoints when no journal is configured.
    pub fn sync_log(&self) -> EngineResult<()> {
        self.inner.sync_log()
    }

    /// Settings the connection was opened with.
    pub fn config(&self) -> &OpenConfig {
        &self.inner.config
    }

    /// Directory holding the checkpoint and journal.
    pub fn home(&self) -> &Path {
        &self.inner.dir
    }

    /// Names of every table currently present, sorted.
    pub fn table_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.inner.tables.read().keys().cloned().collect();
        uris.sort();
        uris
    }

    /// Snapshot of the counters; all zero unless statistics are enabled.
    pub fn stats(&self) -> EngineStats {
        let c = &self.inner.counters;
        EngineStats {
            sessions_open: self.inner.sessions.load(Ordering::Relaxed) as u64,
            cursors_opened: c.cursors_opened.load(Ordering::Relaxed),
            commits: c.commits.load(Ordering::Relaxed),
            rollbacks: c.rollbacks.load(Ordering::Relaxed),
            write_conflicts: c.write_conflicts.load(Ordering::Relaxed),
            checkpoints: c.checkpoints.load(Ordering::Relaxed),
            journal_syncs: c.journal_syncs.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("dir", &self.inner.dir)
            .field("sessions", &self.inner.sessions.load(Ordering::Relaxed))
            .finish()
    }
}

/// Convenience used by callers that only deal in crate errors.
pub fn open(dir: impl AsRef<Path>, config: &str) -> Result<Connection> {
    Connection::open(dir, config).map_err(map_engine_error)
}
