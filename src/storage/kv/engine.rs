use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::operation::OperationContext;
use crate::primitives::engine::{map_engine_error, Connection, EngineError};
use crate::storage::index::{IndexDescriptor, KvIndex};
use crate::storage::record_store::KvRecordStore;
use crate::storage::recovery_unit::{KvRecoveryUnit, RecoveryUnit};
use crate::storage::session_cache::SessionCache;
use crate::storage::size_storer::{SizeStorer, SyncTracker};
use crate::types::{DuskError, Result};

use super::catalog::CollectionOptions;
use super::options::StorageOptions;

const FORCED_SYNC_ATTEMPTS: u32 = 5;
const FORCED_SYNC_BACKOFF: Duration = Duration::from_millis(2);

#[derive(Debug, Default)]
struct DropQueue {
    uris: BTreeSet<String>,
    epoch: u64,
}

/// Façade over one engine connection: resource naming, creation, deferred
/// drops, and size metadata persistence.
pub struct DuskKvEngine {
    conn: Connection,
    durable: bool,
    session_cache: Arc<SessionCache>,
    size_storer: Arc<SizeStorer>,
    size_sync: SyncTracker,
    drops: Mutex<DropQueue>,
    rs_options: String,
    index_options: String,
}

impl DuskKvEngine {
    /// Opens or creates the engine under `options.db_path`.
    pub fn open(options: &StorageOptions) -> Result<Self> {
        options
            .validate()
            .map_err(|err| DuskError::InvalidArgument(err.to_string()))?;
        if options.durable {
            let journal = options.db_path.join("journal");
            if !journal.exists() {
                std::fs::create_dir_all(&journal).map_err(|err| {
                    warn!(path = %journal.display(), error = %err, "kv_engine.journal_dir_failed");
                    err
                })?;
            }
        }
        let config = options.open_config();
        info!(config = %config, "kv_engine.open");
        let conn = Connection::open(&options.db_path, &config).map_err(map_engine_error)?;
        let session_cache = Arc::new(SessionCache::new(conn.clone()));
        let size_storer = Arc::new(SizeStorer::open(conn.clone())?);
        Ok(Self {
            conn,
            durable: options.durable,
            session_cache,
            size_storer,
            size_sync: SyncTracker::new(options.size_sync_hits, options.size_sync_interval()),
            drops: Mutex::new(DropQueue::default()),
            rs_options: options.collection_config.clone(),
            index_options: options.index_config.clone(),
        })
    }

    /// Engine connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Session pool shared by recovery units.
    pub fn session_cache(&self) -> &Arc<SessionCache> {
        &self.session_cache
    }

    /// Size metadata cache.
    pub fn size_storer(&self) -> &Arc<SizeStorer> {
        &self.size_storer
    }

    /// Whether commits are journaled.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Engine resource name of `ident`.
    pub fn uri_for(ident: &str) -> String {
        format!("table:{ident}")
    }

    /// Recovery unit over the shared session pool.
    pub fn new_recovery_unit(&self) -> Box<dyn RecoveryUnit> {
        Box::new(KvRecoveryUnit::new(Arc::clone(&self.session_cache)))
    }

    fn record_store_config(&self, ns: &str, options: &CollectionOptions) -> String {
        let mut config = format!(
            "type=file,key_format=q,value_format=u,app_metadata=(formatVersion=1,ns={ns},temp={})",
            options.temp
        );
        if !self.rs_options.is_empty() {
            config.push(',');
            config.push_str(&self.rs_options);
        }
        config
    }

    /// Creates the table backing a collection.
    pub fn create_record_store(
        &self,
        ns: &str,
        ident: &str,
        options: &CollectionOptions,
    ) -> Result<()> {
        let uri = Self::uri_for(ident);
        let config = self.record_store_config(ns, options);
        debug!(uri = %uri, config = %config, "kv_engine.create_record_store");
        let session = self.conn.open_session().map_err(map_engine_error)?;
        session.create(&uri, &config).map_err(map_engine_error)
    }

    /// Record store over the existing table of `ident`.
    pub fn get_record_store(
        &self,
        opctx: &mut OperationContext,
        ns: &str,
        ident: &str,
    ) -> Result<Arc<KvRecordStore>> {
        let store = KvRecordStore::open(
            opctx,
            ns,
            &Self::uri_for(ident),
            Some(Arc::clone(&self.size_storer)),
        )?;
        Ok(Arc::new(store))
    }

    /// Creates the table backing an index.
    pub fn create_sorted_data_interface(&self, ident: &str, desc: &IndexDescriptor) -> Result<()> {
        let uri = Self::uri_for(ident);
        let config = desc.create_config(&self.index_options)?;
        debug!(uri = %uri, index = %desc.name, "kv_engine.create_index");
        let session = self.conn.open_session().map_err(map_engine_error)?;
        session.create(&uri, &config).map_err(map_engine_error)
    }

    /// Index over the existing table of `ident`.
    pub fn get_sorted_data_interface(&self, ident: &str, desc: &IndexDescriptor) -> KvIndex {
        KvIndex::new(
            &Self::uri_for(ident),
            self.session_cache.gen_table_id(),
            desc,
        )
    }

    /// Drops the record store `ident`. Never fails because the table is busy;
    /// a busy table is queued and reclaimed by [`Self::drop_all_queued`].
    pub fn drop_record_store(&self, ident: &str) -> Result<()> {
        self.drop_ident(ident).map(|_| ())
    }

    /// Drops an index table, deferring the drop while the table is busy.
    pub fn drop_sorted_data_interface(&self, ident: &str) -> Result<()> {
        self.drop_ident(ident).map(|_| ())
    }

    /// Returns `true` when the table is gone, `false` when it was queued.
    fn drop_ident(&self, ident: &str) -> Result<bool> {
        let uri = Self::uri_for(ident);
        let session = self.conn.open_session().map_err(map_engine_error)?;
        let result = session.drop(&uri, true);
        drop(session);
        match result {
            Ok(()) => {
                debug!(uri = %uri, "kv_engine.drop.done");
                self.size_storer.remove(&uri);
                self.sync_size_info(true)?;
                Ok(true)
            }
            Err(EngineError::Busy(_)) => {
                {
                    let mut drops = self.drops.lock();
                    drops.uris.insert(uri.clone());
                    drops.epoch += 1;
                }
                info!(uri = %uri, "kv_engine.drop.queued");
                self.session_cache.close_all();
                Ok(false)
            }
            Err(err) => {
                warn!(uri = %uri, error = %err, "kv_engine.drop.failed");
                Err(map_engine_error(err))
            }
        }
    }

    /// Whether deferred table drops are still pending.
    pub fn have_drops_queued(&self) -> bool {
        !self.drops.lock().uris.is_empty()
    }

    /// Snapshot of the queued resource names.
    pub fn queued_drops(&self) -> Vec<String> {
        self.drops.lock().uris.iter().cloned().collect()
    }

    /// Bumped every time a drop is queued.
    pub fn drop_epoch(&self) -> u64 {
        self.drops.lock().epoch
    }

    /// Tries every queued drop once; returns how many tables were removed.
    pub fn drop_all_queued(&self) -> Result<usize> {
        let mine: Vec<String> = self.drops.lock().uris.iter().cloned().collect();
        if mine.is_empty() {
            return Ok(0);
        }
        let mut deleted = Vec::new();
        let mut failure = None;
        {
            let session = self.conn.open_session().map_err(map_engine_error)?;
            for uri in &mine {
                match session.drop(uri, true) {
                    Ok(()) => {
                        debug!(uri = %uri, "kv_engine.queued_drop.done");
                        deleted.push(uri.clone());
                    }
                    Err(EngineError::Busy(_)) => {
                        debug!(uri = %uri, "kv_engine.queued_drop.busy");
                    }
                    Err(err) => {
                        warn!(uri = %uri, error = %err, "kv_engine.queued_drop.failed");
                        failure = Some(map_engine_error(err));
                        break;
                    }
                }
            }
        }
        {
            let mut drops = self.drops.lock();
            for uri in &deleted {
                drops.uris.remove(uri);
            }
        }
        for uri in &deleted {
            self.size_storer.remove(uri);
        }
        if !deleted.is_empty() {
            self.sync_size_info(true)?;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(deleted.len()),
        }
    }

    /// Persists the size metadata of `rs` under its current ident before a
    /// rename touches the catalog.
    pub fn ok_to_rename(
        &self,
        from_ns: &str,
        to_ns: &str,
        ident: &str,
        rs: &KvRecordStore,
    ) -> Result<()> {
        debug!(from = from_ns, to = to_ns, ident, "kv_engine.ok_to_rename");
        self.size_storer
            .store(&Self::uri_for(ident), rs.num_records(), rs.data_size());
        self.sync_size_info(true)
    }

    /// Writes dirty size metadata until it lands.
    ///
    /// A write conflict with another transaction on the same rows is retried
    /// with backoff; if the rows stay claimed the conflict is returned and the
    /// entries remain dirty.
    pub fn sync_size_info(&self, sync: bool) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.size_storer.store_into(sync) {
                Ok(_) => return Ok(()),
                Err(err) if err.is_write_conflict() && attempt + 1 < FORCED_SYNC_ATTEMPTS => {
                    attempt += 1;
                    debug!(attempt, "kv_engine.size_sync_retry");
                    std::thread::sleep(FORCED_SYNC_BACKOFF * attempt);
                }
                Err(err) => {
                    warn!(error = %err, attempts = attempt + 1, "kv_engine.size_sync_failed");
                    return Err(err);
                }
            }
        }
    }

    /// Counts one unit of foreground activity and syncs size metadata when the
    /// tracker fires. A conflicting writer only postpones the sync.
    pub fn maybe_sync_size_info(&self) -> Result<bool> {
        if !self.size_sync.int_check() {
            return Ok(false);
        }
        match self.size_storer.store_into(true) {
            Ok(_) => Ok(true),
            Err(err) if err.is_write_conflict() => {
                debug!("kv_engine.size_sync_postponed");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Syncs size metadata, then checkpoints.
    pub fn flush_all_files(&self, _sync: bool) -> Result<()> {
        debug!("kv_engine.flush_all_files");
        self.sync_size_info(true)?;
        self.conn.checkpoint().map_err(map_engine_error)
    }

    /// Bytes used by the table behind `ident`.
    pub fn ident_size(&self, opctx: &mut OperationContext, ident: &str) -> Result<i64> {
        let session = KvRecoveryUnit::get(opctx).get_session()?;
        let size = session
            .session()
            .table_size(&Self::uri_for(ident))
            .map_err(map_engine_error)?;
        Ok(size as i64)
    }

    /// Compacts the table behind `ident`.
    pub fn repair_ident(&self, ident: &str) -> Result<()> {
        let session = self.conn.open_session().map_err(map_engine_error)?;
        session
            .compact(&Self::uri_for(ident))
            .map_err(map_engine_error)
    }

    /// Whether a table for `ident` exists.
    pub fn has_ident(&self, ident: &str) -> bool {
        let uri = Self::uri_for(ident);
        self.conn.table_uris().iter().any(|u| *u == uri)
    }

    /// Every ident with a table in the engine.
    pub fn all_idents(&self) -> Vec<String> {
        self.conn
            .table_uris()
            .into_iter()
            .filter_map(|uri| uri.strip_prefix("table:").map(str::to_string))
            .collect()
    }

    /// Final size sync, pool teardown, and engine close.
    pub fn clean_shutdown(&self) -> Result<()> {
        info!("kv_engine.shutdown");
        self.sync_size_info(true)?;
        self.session_cache.close_all();
        self.conn.close().map_err(map_engine_error)
    }
}

impl std::fmt::Debug for DuskKvEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuskKvEngine")
            .field("home", &self.conn.home())
            .field("durable", &self.durable)
            .field("queued_drops", &self.drops.lock().uris.len())
            .finish()
    }
}
