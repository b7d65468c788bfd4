use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::concurrency::{LockManager, Locker, LockerImpl};
use crate::operation::OperationContext;
use crate::storage::recovery_unit::RecoveryUnit;
use crate::types::{DuskError, Result};

use super::catalog::KvCatalog;
use super::database::KvDatabaseCatalogEntry;
use super::engine::DuskKvEngine;
use super::options::StorageOptions;

/// What the rest of the server needs from a storage engine.
pub trait StorageEngine: Send + Sync {
    /// Name the engine registered under.
    fn name(&self) -> &str;

    /// Fresh recovery unit for a new operation.
    fn new_recovery_unit(&self) -> Box<dyn RecoveryUnit>;

    /// Locker for one operation; engines without document-level concurrency
    /// hand out database-granular lockers.
    fn new_locker(&self) -> Arc<dyn Locker>;

    /// Whether writers only conflict on the same document.
    fn supports_doc_locking(&self) -> bool;

    /// Names of databases that have at least one collection.
    fn list_databases(&self) -> Vec<String>;

    /// The entry for `db`, created empty on first use.
    fn database_catalog_entry(&self, db: &str) -> Arc<KvDatabaseCatalogEntry>;

    /// Drops every collection of `db`, one unit of work each.
    fn drop_database(&self, opctx: &mut OperationContext, db: &str) -> Result<()>;

    /// Flushes size metadata and checkpoints; `sync` waits for durability.
    fn flush_all_files(&self, sync: bool) -> Result<()>;

    /// Persists sizes and closes the engine.
    fn clean_shutdown(&self) -> Result<()>;

    /// Opportunistic maintenance run from foreground activity.
    fn run_background_tasks(&self) -> Result<()>;
}

/// [`StorageEngine`] over [`DuskKvEngine`] and a [`KvCatalog`].
pub struct KvStorageEngine {
    name: String,
    kv: Arc<DuskKvEngine>,
    catalog: Arc<KvCatalog>,
    lock_manager: Arc<LockManager>,
    databases: Mutex<BTreeMap<String, Arc<KvDatabaseCatalogEntry>>>,
}

impl KvStorageEngine {
    /// Opens the engine, loads the catalog, opens every committed collection,
    /// and discards temporary ones.
    pub fn open(options: &StorageOptions) -> Result<Self> {
        let kv = Arc::new(DuskKvEngine::open(options)?);
        let catalog = Arc::new(KvCatalog::open(
            kv.connection(),
            kv.session_cache().gen_table_id(),
        )?);
        let engine = Self {
            name: options.engine.clone(),
            kv,
            catalog,
            lock_manager: Arc::new(LockManager::new()),
            databases: Mutex::new(BTreeMap::new()),
        };
        engine.load_databases()?;
        Ok(engine)
    }

    fn load_databases(&self) -> Result<()> {
        let mut opctx = OperationContext::detached(self.new_recovery_unit(), self.new_locker());
        for ns in self.catalog.all_collections() {
            let db = database_of(&ns);
            self.database_catalog_entry(db).init_collection(&mut opctx, &ns)?;
        }
        opctx.recovery_unit_mut().abandon_snapshot();
        let entries: Vec<_> = self.databases.lock().values().cloned().collect();
        for entry in entries {
            entry.clear_tmp_collections(&mut opctx)?;
        }
        debug!(databases = self.databases.lock().len(), "storage.loaded");
        Ok(())
    }

    /// Underlying KV engine.
    pub fn kv(&self) -> &Arc<DuskKvEngine> {
        &self.kv
    }

    /// Collection catalog.
    pub fn catalog(&self) -> &Arc<KvCatalog> {
        &self.catalog
    }

    /// Lock manager shared by every locker this engine hands out.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }
}

/// Database part of `ns` (everything before the first `.`).
pub fn database_of(ns: &str) -> &str {
    ns.split_once('.').map_or(ns, |(db, _)| db)
}

impl StorageEngine for KvStorageEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_recovery_unit(&self) -> Box<dyn RecoveryUnit> {
        self.kv.new_recovery_unit()
    }

    fn new_locker(&self) -> Arc<dyn Locker> {
        if self.supports_doc_locking() {
            Arc::new(LockerImpl::new(Arc::clone(&self.lock_manager)))
        } else {
            Arc::new(LockerImpl::db_level(Arc::clone(&self.lock_manager)))
        }
    }

    fn supports_doc_locking(&self) -> bool {
        true
    }

    fn list_databases(&self) -> Vec<String> {
        self.databases
            .lock()
            .iter()
            .filter(|(_, entry)| entry.exists())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn database_catalog_entry(&self, db: &str) -> Arc<KvDatabaseCatalogEntry> {
        let mut databases = self.databases.lock();
        let entry = databases.entry(db.to_string()).or_insert_with(|| {
            Arc::new(KvDatabaseCatalogEntry::new(
                db,
                Arc::clone(&self.kv),
                Arc::clone(&self.catalog),
            ))
        });
        Arc::clone(entry)
    }

    fn drop_database(&self, opctx: &mut OperationContext, db: &str) -> Result<()> {
        let Some(entry) = self.databases.lock().get(db).cloned() else {
            return Err(DuskError::NamespaceNotFound(db.to_string()));
        };
        for ns in entry.collection_namespaces() {
            opctx.write_unit_of_work(|opctx| entry.drop_collection(opctx, &ns))?;
        }
        self.databases.lock().remove(db);
        info!(db, "storage.drop_database");
        Ok(())
    }

    fn flush_all_files(&self, sync: bool) -> Result<()> {
        self.kv.flush_all_files(sync)
    }

    fn clean_shutdown(&self) -> Result<()> {
        self.databases.lock().clear();
        self.kv.clean_shutdown()
    }

    /// Size metadata sync and queued drop reclamation run independently.
    fn run_background_tasks(&self) -> Result<()> {
        if let Err(err) = self.kv.maybe_sync_size_info() {
            warn!(error = %err, "storage.size_sync_failed");
        }
        if self.kv.have_drops_queued() {
            let dropped = self.kv.drop_all_queued()?;
            if dropped > 0 {
                debug!(dropped, "storage.queued_drops_reclaimed");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for KvStorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStorageEngine")
            .field("name", &self.name)
            .field("kv", &self.kv)
            .finish()
    }
}

/// Builds a storage engine from options.
pub type StorageEngineFactory =
    Box<dyn Fn(&StorageOptions) -> Result<Arc<dyn StorageEngine>> + Send + Sync>;

/// Named storage engine factories, built once at start-up and passed down.
#[derive(Default)]
pub struct StorageEngineRegistry {
    factories: BTreeMap<String, StorageEngineFactory>,
}

impl StorageEngineRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `dusk` engine.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(
            "dusk".to_string(),
            Box::new(|options: &StorageOptions| {
                let engine = KvStorageEngine::open(options)?;
                Ok(Arc::new(engine) as Arc<dyn StorageEngine>)
            }),
        );
        registry
    }

    /// Adds a factory under `name`; names are unique.
    pub fn register(&mut self, name: &str, factory: StorageEngineFactory) -> Result<()> {
        if self.factories.contains_key(name) {
            return Err(DuskError::InvalidArgument(format!(
                "storage engine '{name}' already registered"
            )));
        }
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    /// Registered engine names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Opens the engine named by `options.engine`.
    pub fn create(&self, options: &StorageOptions) -> Result<Arc<dyn StorageEngine>> {
        let factory = self.factories.get(&options.engine).ok_or_else(|| {
            DuskError::InvalidArgument(format!(
                "unknown storage engine '{}'; registered: {:?}",
                options.engine,
                self.names()
            ))
        })?;
        info!(engine = %options.engine, path = %options.db_path.display(), "storage.create_engine");
        factory(options)
    }
}

impl std::fmt::Debug for StorageEngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngineRegistry")
            .field("engines", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::catalog::CollectionOptions;
    use crate::storage::kv::tests_support::harness;

    #[test]
    fn namespaces_split_on_first_dot() {
        assert_eq!(database_of("test.coll.sub"), "test");
        assert_eq!(database_of("admin"), "admin");
    }

    #[test]
    fn registry_rejects_unknown_and_duplicate_engines() {
        let mut registry = StorageEngineRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["dusk".to_string()]);
        let dup = registry.register("dusk", Box::new(|_: &StorageOptions| {
            Err(DuskError::InvalidArgument("unused".into()))
        }));
        assert!(dup.is_err());
        let dir = tempfile::tempdir().unwrap();
        let mut options = StorageOptions::new(dir.path());
        options.engine = "missing".into();
        assert!(matches!(
            registry.create(&options),
            Err(DuskError::InvalidArgument(_))
        ));
        options.engine = "dusk".into();
        options.cache_size_gb = Some(1);
        let engine = registry.create(&options).unwrap();
        assert_eq!(engine.name(), "dusk");
        assert!(engine.supports_doc_locking());
    }

    #[test]
    fn collections_survive_reopen_and_temps_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = StorageOptions::new(dir.path());
        options.cache_size_gb = Some(1);
        {
            let engine = KvStorageEngine::open(&options).unwrap();
            let mut opctx =
                OperationContext::detached(engine.new_recovery_unit(), engine.new_locker());
            let db = engine.database_catalog_entry("app");
            opctx
                .write_unit_of_work(|opctx| {
                    let rs = db.create_collection(opctx, "app.users", &CollectionOptions::default())?;
                    rs.insert_record(opctx, b"alice")?;
                    db.create_collection(opctx, "app.tmp", &CollectionOptions { temp: true })?;
                    Ok(())
                })
                .unwrap();
            drop(opctx);
            engine.clean_shutdown().unwrap();
        }
        let engine = KvStorageEngine::open(&options).unwrap();
        assert_eq!(engine.list_databases(), vec!["app".to_string()]);
        let db = engine.database_catalog_entry("app");
        assert_eq!(db.collection_namespaces(), vec!["app.users".to_string()]);
        let rs = db.record_store("app.users").unwrap();
        assert_eq!((rs.num_records(), rs.data_size()), (1, 5));
    }

    #[test]
    fn drop_database_removes_every_collection() {
        let h = harness();
        let storage = h.storage();
        let db = storage.database_catalog_entry("gone");
        let mut opctx = h.opctx();
        opctx
            .write_unit_of_work(|opctx| {
                db.create_collection(opctx, "gone.a", &CollectionOptions::default())?;
                db.create_collection(opctx, "gone.b", &CollectionOptions::default())?;
                Ok(())
            })
            .unwrap();
        assert_eq!(storage.list_databases(), vec!["gone".to_string()]);
        storage.drop_database(&mut opctx, "gone").unwrap();
        assert!(storage.list_databases().is_empty());
        assert!(storage.catalog().all_collections().is_empty());
        assert!(matches!(
            storage.drop_database(&mut opctx, "gone"),
            Err(DuskError::NamespaceNotFound(_))
        ));
    }
}
