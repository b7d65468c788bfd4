//! The KV storage engine: the engine façade, the namespace catalog, database
//! catalog entries, and the storage engine trait with its factory registry.

mod catalog;
mod database;
mod engine;
mod options;
mod storage_engine;

pub use catalog::{CatalogEntry, CollectionOptions, IndexEntry, KvCatalog, CATALOG_URI};
pub use database::{KvCollectionCatalogEntry, KvDatabaseCatalogEntry};
pub use engine::DuskKvEngine;
pub use options::{cache_size_from_memory, ConfigError, StorageOptions};
pub use storage_engine::{
    database_of, KvStorageEngine, StorageEngine, StorageEngineFactory, StorageEngineRegistry,
};
