//! Namespace → ident metadata kept in a reserved engine table.
//!
//! Every write goes through the operation's recovery unit; the in-memory copy
//! is updated eagerly and put back by a registered change on rollback.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::operation::OperationContext;
use crate::primitives::engine::{map_engine_error, Connection, EngineError};
use crate::storage::index::IndexDescriptor;
use crate::storage::recovery_unit::{on_rollback, KvCursor, KvRecoveryUnit};
use crate::types::{DuskError, Result};

/// Table holding one catalog row per collection.
pub const CATALOG_URI: &str = "table:_dusk_catalog";

/// Options a collection was created with.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOptions {
    /// Temporary collections are discarded at startup.
    #[serde(default)]
    pub temp: bool,
}

/// Catalog metadata of one index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Engine ident of the index table.
    pub ident: String,
    /// Key pattern and options of the index.
    pub descriptor: IndexDescriptor,
}

/// Catalog metadata of one collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Engine ident of the collection's table.
    pub ident: String,
    /// Collection creation options.
    #[serde(default)]
    pub options: CollectionOptions,
    /// Indexes keyed by name.
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexEntry>,
}

type Entries = Arc<RwLock<BTreeMap<String, CatalogEntry>>>;

/// Durable namespace catalog.
pub struct KvCatalog {
    table_id: u64,
    entries: Entries,
    next: AtomicU64,
}

impl KvCatalog {
    /// Creates the catalog table if needed and loads every entry.
    pub fn open(conn: &Connection, table_id: u64) -> Result<Self> {
        let session = conn.open_session().map_err(map_engine_error)?;
        match session.create(CATALOG_URI, "key_format=u,value_format=u") {
            Ok(()) | Err(EngineError::Exists(_)) => {}
            Err(err) => return Err(map_engine_error(err)),
        }
        let mut loaded = BTreeMap::new();
        let mut cursor = session.open_cursor(CATALOG_URI).map_err(map_engine_error)?;
        while cursor.next().map_err(map_engine_error)? {
            let (Some(key), Some(value)) = (cursor.key(), cursor.value()) else {
                continue;
            };
            let ns = String::from_utf8_lossy(key).into_owned();
            let entry: CatalogEntry = serde_json::from_slice(value).map_err(|err| {
                DuskError::TypeMismatch(format!("catalog entry for {ns}: {err}"))
            })?;
            loaded.insert(ns, entry);
        }
        debug!(collections = loaded.len(), "catalog.loaded");
        Ok(Self {
            table_id,
            entries: Arc::new(RwLock::new(loaded)),
            next: AtomicU64::new(0),
        })
    }

    fn new_ident(&self, kind: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let salt: u64 = rand::thread_rng().gen();
        format!("{kind}-{n}-{salt}")
    }

    fn write(&self, opctx: &mut OperationContext, ns: &str, entry: Option<&CatalogEntry>) -> Result<()> {
        let mut cursor = KvCursor::new(CATALOG_URI, self.table_id, KvRecoveryUnit::get(opctx))?;
        let raw = cursor.get();
        match entry {
            Some(entry) => {
                let value = serde_json::to_vec(entry).map_err(|err| {
                    DuskError::InvalidArgument(format!("catalog entry for {ns}: {err}"))
                })?;
                raw.put(ns.as_bytes(), &value).map_err(map_engine_error)
            }
            None => match raw.remove(ns.as_bytes()) {
                Ok(()) | Err(EngineError::NotFound(_)) => Ok(()),
                Err(err) => Err(map_engine_error(err)),
            },
        }
    }

    /// Stores `entry` (or removes `ns`) durably and in memory, restoring the
    /// previous in-memory value on rollback.
    fn set(&self, opctx: &mut OperationContext, ns: &str, entry: Option<CatalogEntry>) -> Result<()> {
        self.write(opctx, ns, entry.as_ref())?;
        let previous = {
            let mut entries = self.entries.write();
            match entry {
                Some(entry) => entries.insert(ns.to_string(), entry),
                None => entries.remove(ns),
            }
        };
        let entries = Arc::clone(&self.entries);
        let key = ns.to_string();
        opctx
            .recovery_unit_mut()
            .register_change(on_rollback(move || {
                let mut entries = entries.write();
                match previous {
                    Some(entry) => entries.insert(key, entry),
                    None => entries.remove(&key),
                };
            }));
        Ok(())
    }

    fn entry(&self, ns: &str) -> Result<CatalogEntry> {
        self.entries
            .read()
            .get(ns)
            .cloned()
            .ok_or_else(|| DuskError::NamespaceNotFound(ns.to_string()))
    }

    /// Registers `ns` with a fresh collection ident.
    pub fn new_collection(
        &self,
        opctx: &mut OperationContext,
        ns: &str,
        options: &CollectionOptions,
    ) -> Result<String> {
        if self.entries.read().contains_key(ns) {
            return Err(DuskError::NamespaceExists(ns.to_string()));
        }
        let ident = self.new_ident("collection");
        let entry = CatalogEntry {
            ident: ident.clone(),
            options: options.clone(),
            indexes: BTreeMap::new(),
        };
        self.set(opctx, ns, Some(entry))?;
        debug!(ns, ident = %ident, "catalog.new_collection");
        Ok(ident)
    }

    /// Engine ident of `ns`.
    pub fn collection_ident(&self, ns: &str) -> Result<String> {
        self.entry(ns).map(|e| e.ident)
    }

    /// Full catalog entry for `ns`.
    pub fn metadata(&self, ns: &str) -> Result<CatalogEntry> {
        self.entry(ns)
    }

    /// Moves `from` to `to`; the ident is unchanged.
    pub fn rename_collection(
        &self,
        opctx: &mut OperationContext,
        from: &str,
        to: &str,
        stay_temp: bool,
    ) -> Result<()> {
        let mut entry = self.entry(from)?;
        if self.entries.read().contains_key(to) {
            return Err(DuskError::NamespaceExists(to.to_string()));
        }
        if !stay_temp {
            entry.options.temp = false;
        }
        self.set(opctx, from, None)?;
        self.set(opctx, to, Some(entry))?;
        debug!(from, to, "catalog.rename_collection");
        Ok(())
    }

    /// Removes the catalog row for `ns`; the table drop is left to the caller.
    pub fn drop_collection(&self, opctx: &mut OperationContext, ns: &str) -> Result<()> {
        self.entry(ns)?;
        self.set(opctx, ns, None)
    }

    /// Records `desc` on `ns` with a fresh index ident.
    pub fn add_index(
        &self,
        opctx: &mut OperationContext,
        ns: &str,
        desc: &IndexDescriptor,
    ) -> Result<String> {
        let mut entry = self.entry(ns)?;
        if entry.indexes.contains_key(&desc.name) {
            return Err(DuskError::InvalidArgument(format!(
                "index {} already exists on {ns}",
                desc.name
            )));
        }
        let ident = self.new_ident("index");
        entry.indexes.insert(
            desc.name.clone(),
            IndexEntry {
                ident: ident.clone(),
                descriptor: desc.clone(),
            },
        );
        self.set(opctx, ns, Some(entry))?;
        Ok(ident)
    }

    /// Forgets index `name` on `ns`; returns its ident.
    pub fn remove_index(&self, opctx: &mut OperationContext, ns: &str, name: &str) -> Result<String> {
        let mut entry = self.entry(ns)?;
        let removed = entry
            .indexes
            .remove(name)
            .ok_or_else(|| DuskError::NotFound(format!("index {name} on {ns}")))?;
        self.set(opctx, ns, Some(entry))?;
        Ok(removed.ident)
    }

    /// Catalog entry of index `name` on `ns`.
    pub fn index(&self, ns: &str, name: &str) -> Result<IndexEntry> {
        self.entry(ns)?
            .indexes
            .get(name)
            .cloned()
            .ok_or_else(|| DuskError::NotFound(format!("index {name} on {ns}")))
    }

    /// Index names of `ns` in sorted order.
    pub fn index_names(&self, ns: &str) -> Result<Vec<String>> {
        Ok(self.entry(ns)?.indexes.into_keys().collect())
    }

    /// Every namespace, sorted.
    pub fn all_collections(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Every ident the catalog references.
    pub fn all_idents(&self) -> Vec<String> {
        let entries = self.entries.read();
        let mut idents = Vec::new();
        for entry in entries.values() {
            idents.push(entry.ident.clone());
            idents.extend(entry.indexes.values().map(|i| i.ident.clone()));
        }
        idents
    }
}

impl std::fmt::Debug for KvCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCatalog")
            .field("collections", &self.entries.read().len())
            .finish()
    }
}
