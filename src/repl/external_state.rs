use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::concurrency::{DbLock, LockMode};
use crate::operation::OperationContext;
use crate::storage::kv::{database_of, CollectionOptions, StorageEngine};
use crate::storage::record_store::KvRecordStore;
use crate::types::{DuskError, Result};

use super::OpTime;

/// The unreplicated database holding node-local state.
pub const LOCAL_DB: &str = "local";
/// Singleton naming this node: `{_id, host}`.
pub const ME_NS: &str = "local.me";
/// Singleton holding the replica set configuration.
pub const CONFIG_NS: &str = "local.system.replset";
/// The replica set oplog.
pub const OPLOG_NS: &str = "local.oplog.rs";
/// Oplog entry field carrying the entry's position.
pub const TS_FIELD: &str = "ts";

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Node-local persistent state replication reads and writes through storage.
pub trait ExternalState: Send + Sync {
    /// Returns this node's identifier, minting and persisting a new one when
    /// none is stored or the stored one belongs to another host.
    fn ensure_me(&self, opctx: &mut OperationContext) -> Result<String>;

    /// Reads the stored replica set config document.
    fn load_local_config_document(&self, opctx: &mut OperationContext) -> Result<Value>;

    /// Replaces the stored replica set config document.
    fn store_local_config_document(&self, opctx: &mut OperationContext, config: &Value) -> Result<()>;

    /// Position of the newest oplog entry.
    fn load_last_op_time(&self, opctx: &mut OperationContext) -> Result<OpTime>;

    /// Drops temporary collections in every database except `local`.
    fn drop_all_temp_collections(&self, opctx: &mut OperationContext) -> Result<()>;
}

/// [`ExternalState`] over a [`StorageEngine`], storing documents as JSON.
pub struct StorageExternalState {
    storage: Arc<dyn StorageEngine>,
    host: String,
    lock_timeout: Duration,
}

impl StorageExternalState {
    /// External state for `host` backed by `storage`.
    pub fn new(storage: Arc<dyn StorageEngine>, host: impl Into<String>) -> Self {
        Self {
            storage,
            host: host.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Bounds how long config reads and writes wait for locks.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Host name this node reports.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn record_store(&self, ns: &str) -> Option<Arc<KvRecordStore>> {
        self.storage
            .database_catalog_entry(database_of(ns))
            .record_store(ns)
    }

    fn first_or_last(
        &self,
        opctx: &mut OperationContext,
        ns: &str,
        forward: bool,
    ) -> Result<Option<Value>> {
        let Some(rs) = self.record_store(ns) else {
            return Ok(None);
        };
        let mut cursor = rs.cursor_for(forward);
        match cursor.next(opctx)? {
            Some((_, bytes)) => decode(ns, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn get_singleton(&self, opctx: &mut OperationContext, ns: &str) -> Result<Option<Value>> {
        self.first_or_last(opctx, ns, true)
    }

    /// Overwrites the singleton in `ns`, creating the collection if needed.
    /// Must run inside a unit of work.
    fn put_singleton(&self, opctx: &mut OperationContext, ns: &str, doc: &Value) -> Result<()> {
        let db = self.storage.database_catalog_entry(database_of(ns));
        let rs = match db.record_store(ns) {
            Some(rs) => rs,
            None => db.create_collection(opctx, ns, &CollectionOptions::default())?,
        };
        let bytes = encode(ns, doc)?;
        let existing = rs.cursor_for(true).next(opctx)?;
        match existing {
            Some((id, _)) => rs.update_record(opctx, id, &bytes),
            None => rs.insert_record(opctx, &bytes).map(|_| ()),
        }
    }

    fn empty_collection(&self, opctx: &mut OperationContext, ns: &str) -> Result<()> {
        match self.record_store(ns) {
            Some(rs) => rs.truncate(opctx),
            None => Ok(()),
        }
    }
}

impl ExternalState for StorageExternalState {
    fn ensure_me(&self, opctx: &mut OperationContext) -> Result<String> {
        let _lock = DbLock::acquire(opctx.locker(), LOCAL_DB, LockMode::Exclusive, self.lock_timeout)?;
        let stored = self.get_singleton(opctx, ME_NS)?;
        let reusable = stored.as_ref().and_then(|me| {
            let host = me.get("host")?.as_str()?;
            let id = me.get("_id")?.as_str()?;
            (host == self.host).then(|| id.to_string())
        });
        if let Some(id) = reusable {
            debug!(id = %id, host = %self.host, "repl.ensure_me_reused");
            return Ok(id);
        }

        let id = hex::encode(rand::random::<[u8; 12]>());
        let me = json!({ "_id": id, "host": self.host });
        opctx.write_unit_of_work(|opctx| {
            self.empty_collection(opctx, ME_NS)?;
            self.put_singleton(opctx, ME_NS, &me)
        })?;
        info!(id = %id, host = %self.host, "repl.ensure_me_minted");
        Ok(id)
    }

    fn load_local_config_document(&self, opctx: &mut OperationContext) -> Result<Value> {
        self.get_singleton(opctx, CONFIG_NS)?.ok_or_else(|| {
            DuskError::NoMatchingDocument(format!(
                "did not find replica set configuration document in {CONFIG_NS}"
            ))
        })
    }

    fn store_local_config_document(&self, opctx: &mut OperationContext, config: &Value) -> Result<()> {
        if !config.is_object() {
            return Err(DuskError::InvalidArgument(format!(
                "replica set configuration must be a document, found {}",
                type_name(config)
            )));
        }
        let _lock = DbLock::acquire(opctx.locker(), LOCAL_DB, LockMode::Exclusive, self.lock_timeout)?;
        opctx.write_unit_of_work(|opctx| self.put_singleton(opctx, CONFIG_NS, config))
    }

    fn load_last_op_time(&self, opctx: &mut OperationContext) -> Result<OpTime> {
        let entry = self.first_or_last(opctx, OPLOG_NS, false)?.ok_or_else(|| {
            DuskError::NoMatchingDocument(format!("did not find any entries in {OPLOG_NS}"))
        })?;
        let ts = entry.get(TS_FIELD).ok_or_else(|| {
            DuskError::NoSuchKey(format!(
                "most recent entry in {OPLOG_NS} missing \"{TS_FIELD}\" field"
            ))
        })?;
        parse_timestamp(ts).ok_or_else(|| {
            DuskError::TypeMismatch(format!(
                "expected type of \"{TS_FIELD}\" in most recent {OPLOG_NS} entry to be a timestamp, but found {}",
                type_name(ts)
            ))
        })
    }

    fn drop_all_temp_collections(&self, opctx: &mut OperationContext) -> Result<()> {
        for db in self.storage.list_databases() {
            if db == LOCAL_DB {
                continue;
            }
            let _lock = DbLock::acquire(opctx.locker(), &db, LockMode::Exclusive, self.lock_timeout)?;
            let dropped = self
                .storage
                .database_catalog_entry(&db)
                .clear_tmp_collections(opctx)?;
            debug!(db = %db, dropped = dropped.len(), "repl.dropped_temp_collections");
        }
        Ok(())
    }
}

impl std::fmt::Debug for StorageExternalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageExternalState")
            .field("storage", &self.storage.name())
            .field("host", &self.host)
            .finish()
    }
}

fn decode(ns: &str, bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes)
        .map_err(|err| DuskError::TypeMismatch(format!("document in {ns} is not valid JSON: {err}")))
}

fn encode(ns: &str, doc: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(doc)
        .map_err(|err| DuskError::InvalidArgument(format!("document for {ns}: {err}")))
}

/// Reads `{"$timestamp": {"t": <secs>, "i": <inc>}}`.
fn parse_timestamp(value: &Value) -> Option<OpTime> {
    let ts = value.as_object()?.get("$timestamp")?.as_object()?;
    let secs = u32::try_from(ts.get("t")?.as_u64()?).ok()?;
    let inc = u32::try_from(ts.get("i")?.as_u64()?).ok()?;
    Some(OpTime::new(secs, inc))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
