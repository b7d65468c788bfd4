//! Storage-engine integration layer for a document database.
//!
//! Binds record stores and indexes to an embedded transactional key/value
//! engine through pooled sessions and per-operation recovery units, with
//! hierarchical locking, polled interruption, deferred resource drops, and
//! persisted size metadata.

#![warn(missing_docs)]

pub mod concurrency;
pub mod operation;
pub mod primitives;
pub mod repl;
pub mod storage;
pub mod types;

pub use operation::{Client, FaultInjection, OperationContext, ServiceContext};
pub use storage::{KvStorageEngine, StorageEngine, StorageOptions};
pub use types::{DuskError, InterruptReason, OpId, RecordId, Result};
