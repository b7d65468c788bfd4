//! Storage integration layer.
//!
//! Binds record stores and indexes to the embedded engine through pooled
//! sessions, per-operation recovery units, and a KV engine façade that owns
//! resource naming, deferred drops, and size metadata.

/// Sorted-data interface: order-preserving keys, cursors, and bulk loading.
pub mod index;

/// KV engine façade, catalog, and storage engine trait.
pub mod kv;

/// Record stores keyed by [`crate::types::RecordId`].
pub mod record_store;

/// Recovery units, registered changes, and operation-bound cursors.
pub mod recovery_unit;

/// Session pool with per-session cursor caches.
pub mod session_cache;

/// Persisted record counts and data sizes.
pub mod size_storer;

pub use index::{
    BulkBuilder, DupPolicy, IndexCursor, IndexDescriptor, IndexKey, KeyValue, KvIndex, SeekPoint,
};
pub use kv::{
    CollectionOptions, DuskKvEngine, KvCatalog, KvDatabaseCatalogEntry, KvStorageEngine,
    StorageEngine, StorageEngineRegistry, StorageOptions,
};
pub use record_store::{KvRecordStore, RecordCursor};
pub use recovery_unit::{Change, KvCursor, KvRecoveryUnit, RecoveryUnit};
pub use session_cache::{PooledSession, SessionCache, SessionLease};
pub use size_storer::{SizeInfo, SizeStorer, SyncTracker};
