//! Record store over one engine table keyed by [`RecordId`].

use std::cmp::Ordering as KeyOrdering;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::operation::OperationContext;
use crate::primitives::bytes::ord;
use crate::primitives::engine::{map_engine_error, EngineError};
use crate::storage::recovery_unit::{on_rollback, KvCursor, KvRecoveryUnit};
use crate::storage::size_storer::{SizeInfo, SizeStorer};
use crate::types::{DuskError, RecordId, Result};

fn record_key(id: RecordId) -> Vec<u8> {
    let mut key = Vec::with_capacity(8);
    ord::push_i64(&mut key, id.0);
    key
}

fn decode_record_key(key: &[u8]) -> Result<RecordId> {
    if key.len() != 8 {
        return Err(DuskError::Corruption(format!(
            "record key has {} bytes",
            key.len()
        )));
    }
    Ok(RecordId(ord::read_i64(key)?))
}

/// Stores opaque record payloads under monotonically assigned [`RecordId`]s.
///
/// Writes must run inside a unit of work; count and size deltas apply
/// immediately and are reverted if the unit of work rolls back.
pub struct KvRecordStore {
    ns: RwLock<String>,
    uri: String,
    table_id: u64,
    next_id: AtomicI64,
    sizes: Arc<SizeInfo>,
}

impl KvRecordStore {
    /// Opens the store backed by `uri`, seeding the id allocator from the
    /// largest existing record and the counters from the size storer (or a
    /// full scan when the storer has no entry).
    pub fn open(
        opctx: &mut OperationContext,
        ns: &str,
        uri: &str,
        size_storer: Option<Arc<SizeStorer>>,
    ) -> Result<Self> {
        let ru = KvRecoveryUnit::get(opctx);
        let table_id = ru.session_cache().gen_table_id();
        let mut cursor = KvCursor::new(uri, table_id, ru)?;
        let raw = cursor.get();
        let last = if raw.prev().map_err(map_engine_error)? {
            match raw.key() {
                Some(key) => decode_record_key(key)?.0,
                None => 0,
            }
        } else {
            0
        };
        raw.reset();

        let sizes = match size_storer.as_ref().and_then(|s| s.load(uri)) {
            Some(info) => info,
            None => {
                let (mut count, mut bytes) = (0i64, 0i64);
                while raw.next().map_err(map_engine_error)? {
                    count += 1;
                    bytes += raw.value().map_or(0, |v| v.len() as i64);
                }
                let info = Arc::new(SizeInfo::new(count, bytes));
                if let Some(storer) = size_storer.as_ref() {
                    storer.register(uri, Arc::clone(&info));
                }
                info
            }
        };
        drop(cursor);
        debug!(ns, uri, last, num_records = sizes.num_records(), "record_store.opened");
        Ok(Self {
            ns: RwLock::new(ns.to_string()),
            uri: uri.to_string(),
            table_id,
            next_id: AtomicI64::new(last + 1),
            sizes,
        })
    }

    /// Namespace this store backs.
    pub fn ns(&self) -> String {
        self.ns.read().clone()
    }

    pub(crate) fn set_ns(&self, ns: &str) {
        *self.ns.write() = ns.to_string();
    }

    /// Engine URI of the backing table.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn cursor(&self, opctx: &mut OperationContext) -> Result<KvCursor> {
        KvCursor::new(&self.uri, self.table_id, KvRecoveryUnit::get(opctx))
    }

    fn change_sizes(&self, opctx: &mut OperationContext, records: i64, bytes: i64) {
        self.sizes.add(records, bytes);
        let sizes = Arc::clone(&self.sizes);
        opctx
            .recovery_unit_mut()
            .register_change(on_rollback(move || sizes.add(-records, -bytes)));
    }

    /// Appends `data` under a fresh record id.
    pub fn insert_record(&self, opctx: &mut OperationContext, data: &[u8]) -> Result<RecordId> {
        let id = RecordId(self.next_id.fetch_add(1, Ordering::AcqRel));
        let mut cursor = self.cursor(opctx)?;
        cursor
            .get()
            .insert(&record_key(id), data)
            .map_err(map_engine_error)?;
        drop(cursor);
        self.change_sizes(opctx, 1, data.len() as i64);
        Ok(id)
    }

    /// Overwrites the record at `id`.
    pub fn update_record(
        &self,
        opctx: &mut OperationContext,
        id: RecordId,
        data: &[u8],
    ) -> Result<()> {
        let key = record_key(id);
        let mut cursor = self.cursor(opctx)?;
        let raw = cursor.get();
        let old = raw
            .search(&key)
            .map_err(map_engine_error)?
            .ok_or_else(|| DuskError::NotFound(format!("record {id} in {}", self.ns())))?;
        raw.put(&key, data).map_err(map_engine_error)?;
        drop(cursor);
        self.change_sizes(opctx, 0, data.len() as i64 - old.len() as i64);
        Ok(())
    }

    /// Removes the record at `id`, failing if it does not exist.
    pub fn delete_record(&self, opctx: &mut OperationContext, id: RecordId) -> Result<()> {
        let key = record_key(id);
        let mut cursor = self.cursor(opctx)?;
        let raw = cursor.get();
        let old = raw
            .search(&key)
            .map_err(map_engine_error)?
            .ok_or_else(|| DuskError::NotFound(format!("record {id} in {}", self.ns())))?;
        raw.remove(&key).map_err(map_engine_error)?;
        drop(cursor);
        self.change_sizes(opctx, -1, -(old.len() as i64));
        Ok(())
    }

    /// Payload of `id`; `NotFound` when absent.
    pub fn data_for(&self, opctx: &mut OperationContext, id: RecordId) -> Result<Vec<u8>> {
        self.find_record(opctx, id)?
            .ok_or_else(|| DuskError::NotFound(format!("record {id} in {}", self.ns())))
    }

    /// Reads the record at `id`.
    pub fn find_record(&self, opctx: &mut OperationContext, id: RecordId) -> Result<Option<Vec<u8>>> {
        let mut cursor = self.cursor(opctx)?;
        cursor.get().search(&record_key(id)).map_err(map_engine_error)
    }

    /// Unpositioned cursor; the first `next` starts at the near end.
    pub fn cursor_for(&self, forward: bool) -> RecordCursor {
        RecordCursor {
            uri: self.uri.clone(),
            table_id: self.table_id,
            forward,
            cursor: None,
            last: None,
            eof: false,
        }
    }

    /// Removes every record inside the caller's unit of work.
    pub fn truncate(&self, opctx: &mut OperationContext) -> Result<()> {
        let mut cursor = self.cursor(opctx)?;
        let raw = cursor.get();
        let mut keys = Vec::new();
        while raw.next().map_err(map_engine_error)? {
            if let Some(key) = raw.key() {
                keys.push(key.to_vec());
            }
        }
        for key in &keys {
            raw.remove(key).map_err(map_engine_error)?;
        }
        drop(cursor);
        let (records, bytes) = (self.sizes.num_records(), self.sizes.data_size());
        self.change_sizes(opctx, -records, -bytes);
        debug!(ns = %self.ns(), removed = keys.len(), "record_store.truncated");
        Ok(())
    }

    /// Cached record count.
    pub fn num_records(&self) -> i64 {
        self.sizes.num_records()
    }

    /// Cached sum of record sizes in bytes.
    pub fn data_size(&self) -> i64 {
        self.sizes.data_size()
    }

    /// Bytes the engine reports for the backing table.
    pub fn storage_size(&self, opctx: &mut OperationContext) -> Result<i64> {
        let session = KvRecoveryUnit::get(opctx).get_session()?;
        let size = session
            .session()
            .table_size(&self.uri)
            .map_err(map_engine_error)?;
        Ok(size as i64)
    }

    /// Reconciles the counters with a full scan.
    pub fn validate(&self, opctx: &mut OperationContext) -> Result<(i64, i64)> {
        let mut cursor = self.cursor(opctx)?;
        let raw = cursor.get();
        let (mut count, mut bytes) = (0i64, 0i64);
        let mut previous: Option<RecordId> = None;
        while raw.next().map_err(map_engine_error)? {
            let id = decode_record_key(raw.key().unwrap_or_default())?;
            if previous.is_some_and(|p| p >= id) {
                return Err(DuskError::Corruption(format!(
                    "record ids out of order in {}",
                    self.uri
                )));
            }
            previous = Some(id);
            count += 1;
            bytes += raw.value().map_or(0, |v| v.len() as i64);
        }
        if count != self.num_records() || bytes != self.data_size() {
            debug!(uri = %self.uri, count, bytes, "record_store.validate.resized");
            self.sizes.set(count, bytes);
        }
        Ok((count, bytes))
    }

    pub(crate) fn size_info(&self) -> &Arc<SizeInfo> {
        &self.sizes
    }
}

impl std::fmt::Debug for KvRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvRecordStore")
            .field("ns", &*self.ns.read())
            .field("uri", &self.uri)
            .field("num_records", &self.num_records())
            .finish()
    }
}

/// Iterates a record store; survives transaction boundaries through
/// [`RecordCursor::save_position`] / [`RecordCursor::restore_position`].
pub struct RecordCursor {
    uri: String,
    table_id: u64,
    forward: bool,
    cursor: Option<KvCursor>,
    last: Option<RecordId>,
    eof: bool,
}

impl RecordCursor {
    /// Next record in cursor direction, or `None` at the end.
    pub fn next(&mut self, opctx: &mut OperationContext) -> Result<Option<(RecordId, Vec<u8>)>> {
        if self.eof {
            return Ok(None);
        }
        if self.cursor.is_none() {
            self.reposition(opctx)?;
        }
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        let raw = cursor.get();
        let stepped = if self.forward { raw.next() } else { raw.prev() };
        let found = match stepped {
            Ok(found) => found,
            Err(EngineError::CursorReset(_)) => {
                self.cursor = None;
                return self.next(opctx);
            }
            Err(err) => return Err(map_engine_error(err)),
        };
        if !found {
            self.eof = true;
            return Ok(None);
        }
        let id = decode_record_key(raw.key().unwrap_or_default())?;
        let value = raw.value().unwrap_or_default().to_vec();
        self.last = Some(id);
        Ok(Some((id, value)))
    }

    /// Releases the engine cursor, remembering the last returned record.
    pub fn save_position(&mut self) {
        self.cursor = None;
    }

    /// Reacquires an engine cursor after the last returned record.
    pub fn restore_position(&mut self, opctx: &mut OperationContext) -> Result<()> {
        if !self.eof {
            self.reposition(opctx)?;
        }
        Ok(())
    }

    /// Opens a fresh cursor placed just before the next record to return.
    fn reposition(&mut self, opctx: &mut OperationContext) -> Result<()> {
        let mut cursor = KvCursor::new(&self.uri, self.table_id, KvRecoveryUnit::get(opctx))?;
        if let Some(last) = self.last {
            let raw = cursor.get();
            match raw.search_near(&record_key(last)).map_err(map_engine_error)? {
                None => raw.reset(),
                Some(KeyOrdering::Equal) => {}
                Some(KeyOrdering::Greater) if self.forward => {
                    // Landed past a deleted record; step back so `next` returns it.
                    if !raw.prev().map_err(map_engine_error)? {
                        raw.reset();
                    }
                }
                Some(KeyOrdering::Less) if !self.forward => {
                    if !raw.next().map_err(map_engine_error)? {
                        raw.reset();
                    }
                }
                Some(_) => {}
            }
        }
        self.cursor = Some(cursor);
        Ok(())
    }
}
