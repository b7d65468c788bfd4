//! Approximate record counts and data sizes, persisted across restarts.
//!
//! Live record stores share an [`Arc<SizeInfo>`] with the storer, so the
//! storer always sees current values. [`SizeStorer::store_into`] writes the
//! dirty entries to a reserved engine table inside one durable transaction.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::primitives::engine::{map_engine_error, Connection, EngineError};
use crate::types::{DuskError, Result};

/// Engine table holding the persisted size entries.
pub const SIZE_STORER_URI: &str = "table:sizeStorer";

/// Shared, lock-free counters for one resource.
#[derive(Debug, Default)]
pub struct SizeInfo {
    num_records: AtomicI64,
    data_size: AtomicI64,
    dirty: AtomicBool,
}

impl SizeInfo {
    /// Clean entry with the given counters.
    pub fn new(num_records: i64, data_size: i64) -> Self {
        Self {
            num_records: AtomicI64::new(num_records),
            data_size: AtomicI64::new(data_size),
            dirty: AtomicBool::new(false),
        }
    }

    /// Record count.
    pub fn num_records(&self) -> i64 {
        self.num_records.load(Ordering::Acquire)
    }

    /// Data size in bytes.
    pub fn data_size(&self) -> i64 {
        self.data_size.load(Ordering::Acquire)
    }

    /// Applies a delta and marks the entry dirty.
    pub fn add(&self, records: i64, bytes: i64) {
        self.num_records.fetch_add(records, Ordering::AcqRel);
        self.data_size.fetch_add(bytes, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
    }

    /// Overwrites both counters and marks the entry dirty.
    pub fn set(&self, num_records: i64, data_size: i64) {
        self.num_records.store(num_records, Ordering::Release);
        self.data_size.store(data_size, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
    }

    /// True when the entry changed since it was last stored.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

#[derive(Serialize, Deserialize)]
struct SizeDoc {
    #[serde(rename = "numRecords")]
    num_records: i64,
    #[serde(rename = "dataSize")]
    data_size: i64,
}

fn decode_entry(uri: &str, raw: &[u8]) -> Result<SizeDoc> {
    serde_json::from_slice(raw)
        .map_err(|err| DuskError::TypeMismatch(format!("size entry for {uri}: {err}")))
}

#[derive(Default)]
struct Entries {
    live: FxHashMap<String, Arc<SizeInfo>>,
    /// Resources forgotten since the last store; their rows get deleted.
    removed: BTreeSet<String>,
}

/// Persists per-resource [`SizeInfo`] under [`SIZE_STORER_URI`].
///
/// The entry lock is never held across an engine call; every load or store
/// runs on its own short-lived session.
pub struct SizeStorer {
    conn: Connection,
    uri: String,
    entries: Mutex<Entries>,
}

impl SizeStorer {
    /// Opens the storer, creating the backing table if needed, and loads every
    /// persisted entry.
    pub fn open(conn: Connection) -> Result<Self> {
        Self::open_at(conn, SIZE_STORER_URI)
    }

    /// Opens a storer over the table at `uri` and loads its rows.
    pub fn open_at(conn: Connection, uri: &str) -> Result<Self> {
        let session = conn.open_session().map_err(map_engine_error)?;
        match session.create(uri, "key_format=u,value_format=u") {
            Ok(()) | Err(EngineError::Exists(_)) => {}
            Err(err) => return Err(map_engine_error(err)),
        }
        drop(session);
        let storer = Self {
            conn,
            uri: uri.to_string(),
            entries: Mutex::new(Entries::default()),
        };
        storer.load_from()?;
        Ok(storer)
    }

    /// Replaces the in-memory entries with what is persisted.
    pub fn load_from(&self) -> Result<()> {
        let mut loaded = FxHashMap::default();
        {
            let session = self.conn.open_session().map_err(map_engine_error)?;
            let mut cursor = session.open_cursor(&self.uri).map_err(map_engine_error)?;
            while cursor.next().map_err(map_engine_error)? {
                let (Some(key), Some(value)) = (cursor.key(), cursor.value()) else {
                    continue;
                };
                let uri = String::from_utf8_lossy(key).into_owned();
                let doc = decode_entry(&uri, value)?;
                debug!(uri = %uri, num_records = doc.num_records, data_size = doc.data_size, "size_storer.loaded");
                loaded.insert(uri, Arc::new(SizeInfo::new(doc.num_records, doc.data_size)));
            }
        }
        let mut entries = self.entries.lock();
        entries.live = loaded;
        entries.removed.clear();
        Ok(())
    }

    /// Shared counters for `uri`, if the storer knows it.
    pub fn load(&self, uri: &str) -> Option<Arc<SizeInfo>> {
        self.entries.lock().live.get(uri).cloned()
    }

    /// Tracks `info` as the live counters of `uri`.
    pub fn register(&self, uri: &str, info: Arc<SizeInfo>) {
        let mut entries = self.entries.lock();
        entries.removed.remove(uri);
        info.mark_dirty();
        entries.live.insert(uri.to_string(), info);
    }

    /// Records explicit values for `uri`; they are written on the next store.
    pub fn store(&self, uri: &str, num_records: i64, data_size: i64) {
        let mut entries = self.entries.lock();
        entries.removed.remove(uri);
        match entries.live.get(uri) {
            Some(info) => info.set(num_records, data_size),
            None => {
                let info = Arc::new(SizeInfo::new(num_records, data_size));
                info.mark_dirty();
                entries.live.insert(uri.to_string(), info);
            }
        }
    }

    /// Forgets `uri`; its persisted row is deleted on the next store.
    pub fn remove(&self, uri: &str) {
        let mut entries = self.entries.lock();
        if entries.live.remove(uri).is_some() {
            entries.removed.insert(uri.to_string());
        }
    }

    /// Writes every dirty entry in one transaction, durable when `sync`.
    ///
    /// Entries whose write fails, including on a write conflict with another
    /// transaction holding the same rows, are marked dirty again and the error
    /// is returned.
    pub fn store_into(&self, sync: bool) -> Result<usize> {
        let (dirty, removed) = {
            let mut entries = self.entries.lock();
            let dirty: Vec<(String, Arc<SizeInfo>)> = entries
                .live
                .iter()
                .filter(|(_, info)| info.take_dirty())
                .map(|(uri, info)| (uri.clone(), Arc::clone(info)))
                .collect();
            (dirty, std::mem::take(&mut entries.removed))
        };
        if dirty.is_empty() && removed.is_empty() {
            return Ok(0);
        }
        match self.write_entries(&dirty, &removed, sync) {
            Ok(()) => {
                debug!(written = dirty.len(), removed = removed.len(), sync, "size_storer.stored");
                Ok(dirty.len())
            }
            Err(err) => {
                for (_, info) in &dirty {
                    info.mark_dirty();
                }
                {
                    let mut entries = self.entries.lock();
                    for uri in removed {
                        if !entries.live.contains_key(&uri) {
                            entries.removed.insert(uri);
                        }
                    }
                }
                debug!(error = %err, pending = dirty.len(), "size_storer.store_failed");
                Err(err)
            }
        }
    }

    fn write_entries(
        &self,
        dirty: &[(String, Arc<SizeInfo>)],
        removed: &BTreeSet<String>,
        sync: bool,
    ) -> Result<()> {
        let config = if sync { "sync=true" } else { "" };
        let session = self.conn.open_session().map_err(map_engine_error)?;
        session.begin_transaction(config).map_err(map_engine_error)?;
        let written = (|| -> Result<()> {
            let mut cursor = session.open_cursor(&self.uri).map_err(map_engine_error)?;
            for (uri, info) in dirty {
                let doc = SizeDoc {
                    num_records: info.num_records(),
                    data_size: info.data_size(),
                };
                let value = serde_json::to_vec(&doc)
                    .map_err(|err| DuskError::Corruption(format!("size entry for {uri}: {err}")))?;
                cursor.put(uri.as_bytes(), &value).map_err(map_engine_error)?;
            }
            for uri in removed {
                match cursor.remove(uri.as_bytes()) {
                    Ok(()) | Err(EngineError::NotFound(_)) => {}
                    Err(err) => return Err(map_engine_error(err)),
                }
            }
            Ok(())
        })();
        match written {
            Ok(()) => session.commit_transaction().map_err(map_engine_error),
            Err(err) => {
                if let Err(rollback) = session.rollback_transaction() {
                    warn!(error = %rollback, "size_storer.rollback_failed");
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for SizeStorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeStorer")
            .field("uri", &self.uri)
            .field("entries", &self.entries.lock().live.len())
            .finish()
    }
}

/// Fires after a number of hits or an elapsed interval, whichever comes first.
#[derive(Debug)]
pub struct SyncTracker {
    hits: AtomicU64,
    hits_between: u64,
    interval: Duration,
    last: Mutex<Instant>,
}

impl SyncTracker {
    /// Syncs after `hits_between` hits or once `interval` has passed.
    pub fn new(hits_between: u64, interval: Duration) -> Self {
        Self {
            hits: AtomicU64::new(0),
            hits_between,
            interval,
            last: Mutex::new(Instant::now()),
        }
    }

    /// Counts one hit; returns `true` (and resets) when a sync is due.
    pub fn int_check(&self) -> bool {
        let hits = self.hits.fetch_add(1, Ordering::AcqRel) + 1;
        if hits >= self.hits_between || self.interval_has_elapsed() {
            self.reset();
            return true;
        }
        false
    }

    /// True once the sync interval has passed since the last reset.
    pub fn interval_has_elapsed(&self) -> bool {
        self.last.lock().elapsed() >= self.interval
    }

    /// Restarts both counters.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Release);
        *self.last.lock() = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::engine::Connection;
    use tempfile::tempdir;

    #[test]
    fn stored_sizes_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let conn = Connection::open(dir.path(), "create").unwrap();
            let storer = SizeStorer::open(conn.clone()).unwrap();
            let info = Arc::new(SizeInfo::new(0, 0));
            storer.register("table:a", Arc::clone(&info));
            info.add(3, 120);
            assert_eq!(storer.store_into(true).unwrap(), 1);
            assert!(!info.is_dirty());
            assert_eq!(storer.store_into(true).unwrap(), 0);
        }
        let conn = Connection::open(dir.path(), "").unwrap();
        let storer = SizeStorer::open(conn).unwrap();
        let info = storer.load("table:a").unwrap();
        assert_eq!((info.num_records(), info.data_size()), (3, 120));
    }

    #[test]
    fn removed_entries_are_deleted_on_store() {
        let dir = tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        let storer = SizeStorer::open(conn).unwrap();
        storer.store("table:a", 1, 10);
        storer.store_into(false).unwrap();
        storer.remove("table:a");
        storer.store_into(false).unwrap();
        storer.load_from().unwrap();
        assert!(storer.load("table:a").is_none());
    }

    #[test]
    fn malformed_entry_is_a_type_mismatch() {
        let dir = tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        let session = conn.open_session().unwrap();
        session.create(SIZE_STORER_URI, "").unwrap();
        let mut cursor = session.open_cursor(SIZE_STORER_URI).unwrap();
        cursor
            .put(b"table:bad", br#"{"numRecords":"many","dataSize":1}"#)
            .unwrap();
        drop(cursor);
        assert!(matches!(
            SizeStorer::open(conn.clone()),
            Err(DuskError::TypeMismatch(_))
        ));
    }

    #[test]
    fn conflicting_store_keeps_entries_dirty() {
        let dir = tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        let storer = SizeStorer::open(conn.clone()).unwrap();
        storer.store("table:a", 1, 10);
        storer.store_into(true).unwrap();

        let holder = conn.open_session().unwrap();
        holder.begin_transaction("").unwrap();
        let mut cursor = holder.open_cursor(SIZE_STORER_URI).unwrap();
        cursor
            .put(b"table:a", br#"{"numRecords":9,"dataSize":9}"#)
            .unwrap();

        storer.store("table:a", 2, 20);
        let err = storer.store_into(true).unwrap_err();
        assert!(err.is_write_conflict());
        assert!(storer.load("table:a").unwrap().is_dirty());

        drop(cursor);
        holder.rollback_transaction().unwrap();
        assert_eq!(storer.store_into(true).unwrap(), 1);
        storer.load_from().unwrap();
        let info = storer.load("table:a").unwrap();
        assert_eq!((info.num_records(), info.data_size()), (2, 20));
    }

    #[test]
    fn tracker_fires_on_hits_or_interval() {
        let tracker = SyncTracker::new(3, Duration::from_secs(3600));
        assert!(!tracker.int_check());
        assert!(!tracker.int_check());
        assert!(tracker.int_check());
        assert!(!tracker.int_check());

        let tracker = SyncTracker::new(u64::MAX, Duration::ZERO);
        assert!(tracker.interval_has_elapsed());
        assert!(tracker.int_check());
    }
}
