use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::operation::OperationContext;
use crate::storage::index::{IndexDescriptor, KvIndex};
use crate::storage::record_store::KvRecordStore;
use crate::storage::recovery_unit::{change_fn, on_commit, on_rollback};
use crate::types::{DuskError, Result};

use super::catalog::{CollectionOptions, KvCatalog};
use super::engine::DuskKvEngine;

/// A live collection: its namespace, ident and record store.
#[derive(Debug)]
pub struct KvCollectionCatalogEntry {
    ns: String,
    ident: String,
    record_store: Arc<KvRecordStore>,
}

impl KvCollectionCatalogEntry {
    /// Collection namespace.
    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// Engine ident of the collection's table.
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Record store of the collection.
    pub fn record_store(&self) -> &Arc<KvRecordStore> {
        &self.record_store
    }
}

type CollectionMap = BTreeMap<String, Arc<KvCollectionCatalogEntry>>;

/// The collections of one database.
pub struct KvDatabaseCatalogEntry {
    name: String,
    engine: Arc<DuskKvEngine>,
    catalog: Arc<KvCatalog>,
    collections: Arc<Mutex<CollectionMap>>,
}

impl KvDatabaseCatalogEntry {
    /// Entry for database `name`.
    pub fn new(name: &str, engine: Arc<DuskKvEngine>, catalog: Arc<KvCatalog>) -> Self {
        Self {
            name: name.to_string(),
            engine,
            catalog,
            collections: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the catalog has seen this database.
    pub fn exists(&self) -> bool {
        !self.is_empty()
    }

    /// True when the database has no collections.
    pub fn is_empty(&self) -> bool {
        self.collections.lock().is_empty()
    }

    /// Namespaces of this database's collections.
    pub fn collection_namespaces(&self) -> Vec<String> {
        self.collections.lock().keys().cloned().collect()
    }

    /// Entry for collection `ns`, if it exists.
    pub fn collection(&self, ns: &str) -> Option<Arc<KvCollectionCatalogEntry>> {
        self.collections.lock().get(ns).cloned()
    }

    /// Record store of `ns`, if the collection exists.
    pub fn record_store(&self, ns: &str) -> Option<Arc<KvRecordStore>> {
        self.collection(ns).map(|c| Arc::clone(&c.record_store))
    }

    /// Storage used by every collection and index of the database.
    pub fn size_on_disk(&self, opctx: &mut OperationContext) -> Result<i64> {
        let collections: Vec<Arc<KvCollectionCatalogEntry>> =
            self.collections.lock().values().cloned().collect();
        let mut size = 0;
        for coll in collections {
            size += coll.record_store.storage_size(opctx)?;
            for name in self.catalog.index_names(&coll.ns)? {
                let ident = self.catalog.index(&coll.ns, &name)?.ident;
                size += self.engine.ident_size(opctx, &ident)?;
            }
        }
        Ok(size)
    }

    /// Opens an already committed collection at startup.
    pub(crate) fn init_collection(&self, opctx: &mut OperationContext, ns: &str) -> Result<()> {
        let ident = self.catalog.collection_ident(ns)?;
        let record_store = self.engine.get_record_store(opctx, ns, &ident)?;
        let mut collections = self.collections.lock();
        crate::invariant!(!collections.contains_key(ns), "collection {ns} opened twice");
        collections.insert(
            ns.to_string(),
            Arc::new(KvCollectionCatalogEntry {
                ns: ns.to_string(),
                ident,
                record_store,
            }),
        );
        Ok(())
    }

    /// Rollback hook removing `ns` from the map and optionally dropping `ident`.
    fn add_collection_change(
        &self,
        opctx: &mut OperationContext,
        ns: &str,
        ident: &str,
        drop_on_rollback: bool,
    ) {
        let engine = Arc::clone(&self.engine);
        let collections = Arc::clone(&self.collections);
        let (ns, ident) = (ns.to_string(), ident.to_string());
        opctx
            .recovery_unit_mut()
            .register_change(on_rollback(move || {
                if drop_on_rollback {
                    if let Err(err) = engine.drop_record_store(&ident) {
                        warn!(ident = %ident, error = %err, "database.rollback_drop_failed");
                    }
                }
                collections.lock().remove(&ns);
            }));
    }

    /// Commit hook optionally dropping the removed collection's table;
    /// rollback puts `entry` back under `ns`.
    fn remove_collection_change(
        &self,
        opctx: &mut OperationContext,
        ns: &str,
        entry: Arc<KvCollectionCatalogEntry>,
        drop_on_commit: bool,
    ) {
        let engine = Arc::clone(&self.engine);
        let collections = Arc::clone(&self.collections);
        let ident = entry.ident.clone();
        let ns = ns.to_string();
        opctx.recovery_unit_mut().register_change(change_fn(
            move || {
                if drop_on_commit {
                    if let Err(err) = engine.drop_record_store(&ident) {
                        warn!(ident = %ident, error = %err, "database.commit_drop_failed");
                    }
                }
            },
            move || {
                collections.lock().insert(ns, entry);
            },
        ));
    }

    /// Registers `ns` in the catalog and creates its table.
    pub fn create_collection(
        &self,
        opctx: &mut OperationContext,
        ns: &str,
        options: &CollectionOptions,
    ) -> Result<Arc<KvRecordStore>> {
        if self.collections.lock().contains_key(ns) {
            return Err(DuskError::NamespaceExists(ns.to_string()));
        }
        let ident = self.catalog.new_collection(opctx, ns, options)?;
        self.engine.create_record_store(ns, &ident, options)?;
        let record_store = self.engine.get_record_store(opctx, ns, &ident)?;
        self.add_collection_change(opctx, ns, &ident, true);
        self.collections.lock().insert(
            ns.to_string(),
            Arc::new(KvCollectionCatalogEntry {
                ns: ns.to_string(),
                ident: ident.clone(),
                record_store: Arc::clone(&record_store),
            }),
        );
        debug!(ns, ident = %ident, "database.create_collection");
        Ok(record_store)
    }

    /// Moves `from` to `to`, keeping the ident and flushing sizes first.
    pub fn rename_collection(
        &self,
        opctx: &mut OperationContext,
        from: &str,
        to: &str,
        stay_temp: bool,
    ) -> Result<()> {
        let original = {
            let collections = self.collections.lock();
            let Some(original) = collections.get(from).cloned() else {
                return Err(DuskError::NamespaceNotFound(from.to_string()));
            };
            if collections.contains_key(to) {
                return Err(DuskError::NamespaceExists(to.to_string()));
            }
            original
        };
        let ident_from = self.catalog.collection_ident(from)?;
        self.engine
            .ok_to_rename(from, to, &ident_from, &original.record_store)?;
        self.catalog.rename_collection(opctx, from, to, stay_temp)?;
        let ident_to = self.catalog.collection_ident(to)?;
        crate::invariant!(ident_from == ident_to, "rename changed ident of {from}");

        let record_store = Arc::clone(&original.record_store);
        record_store.set_ns(to);
        let reverted = Arc::clone(&record_store);
        let from_ns = from.to_string();
        opctx
            .recovery_unit_mut()
            .register_change(on_rollback(move || reverted.set_ns(&from_ns)));

        let removed = self.collections.lock().remove(from);
        if let Some(entry) = removed {
            self.remove_collection_change(opctx, from, entry, false);
        }
        self.add_collection_change(opctx, to, &ident_to, false);
        self.collections.lock().insert(
            to.to_string(),
            Arc::new(KvCollectionCatalogEntry {
                ns: to.to_string(),
                ident: ident_to,
                record_store,
            }),
        );
        debug!(from, to, "database.rename_collection");
        Ok(())
    }

    /// Removes `ns` and its indexes; the tables are dropped on commit.
    pub fn drop_collection(&self, opctx: &mut OperationContext, ns: &str) -> Result<()> {
        let Some(entry) = self.collection(ns) else {
            return Err(DuskError::NamespaceNotFound(ns.to_string()));
        };
        for name in self.catalog.index_names(ns)? {
            self.drop_index(opctx, ns, &name)?;
        }
        self.catalog.drop_collection(opctx, ns)?;
        self.collections.lock().remove(ns);
        self.remove_collection_change(opctx, ns, entry, true);
        debug!(ns, "database.drop_collection");
        Ok(())
    }

    /// Drops every temporary collection, one unit of work each. Returns the
    /// dropped namespaces.
    pub fn clear_tmp_collections(&self, opctx: &mut OperationContext) -> Result<Vec<String>> {
        let mut dropped = Vec::new();
        for ns in self.collection_namespaces() {
            if !self.catalog.metadata(&ns)?.options.temp {
                continue;
            }
            opctx.write_unit_of_work(|opctx| self.drop_collection(opctx, &ns))?;
            info!(ns = %ns, "database.drop_temp_collection");
            dropped.push(ns);
        }
        Ok(dropped)
    }

    /// Creates an empty index on `ns`; its table is dropped again on rollback.
    pub fn create_index(
        &self,
        opctx: &mut OperationContext,
        ns: &str,
        desc: &IndexDescriptor,
    ) -> Result<KvIndex> {
        if self.collection(ns).is_none() {
            return Err(DuskError::NamespaceNotFound(ns.to_string()));
        }
        let ident = self.catalog.add_index(opctx, ns, desc)?;
        self.engine.create_sorted_data_interface(&ident, desc)?;
        let engine = Arc::clone(&self.engine);
        let dropped = ident.clone();
        opctx
            .recovery_unit_mut()
            .register_change(on_rollback(move || {
                if let Err(err) = engine.drop_sorted_data_interface(&dropped) {
                    warn!(ident = %dropped, error = %err, "database.rollback_drop_failed");
                }
            }));
        debug!(ns, index = %desc.name, ident = %ident, "database.create_index");
        Ok(self.engine.get_sorted_data_interface(&ident, desc))
    }

    /// Removes index `name`; its table is dropped on commit.
    pub fn drop_index(&self, opctx: &mut OperationContext, ns: &str, name: &str) -> Result<()> {
        let ident = self.catalog.remove_index(opctx, ns, name)?;
        let engine = Arc::clone(&self.engine);
        opctx
            .recovery_unit_mut()
            .register_change(on_commit(move || {
                if let Err(err) = engine.drop_sorted_data_interface(&ident) {
                    warn!(ident = %ident, error = %err, "database.commit_drop_failed");
                }
            }));
        Ok(())
    }

    /// Opens the index `name` of `ns`.
    pub fn index(&self, ns: &str, name: &str) -> Result<KvIndex> {
        let entry = self.catalog.index(ns, name)?;
        Ok(self
            .engine
            .get_sorted_data_interface(&entry.ident, &entry.descriptor))
    }
}

impl std::fmt::Debug for KvDatabaseCatalogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvDatabaseCatalogEntry")
            .field("name", &self.name)
            .field("collections", &self.collections.lock().len())
            .finish()
    }
}
