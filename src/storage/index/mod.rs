#![forbid(unsafe_code)]

//! Sorted-data interface: ordered `(key, record id)` entries over one engine
//! table, with forward and reverse cursors that survive transaction
//! boundaries.

mod bulk;
mod cursor;
mod key;

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::operation::OperationContext;
use crate::primitives::engine::{map_engine_error, EngineError, RawCursor};
use crate::storage::recovery_unit::{KvCursor, KvRecoveryUnit};
use crate::types::{DuskError, RecordId, Result};

pub use bulk::BulkBuilder;
pub use cursor::{IndexCursor, SeekPoint};
pub use key::{
    decode_entry, decode_key, encode_key, entry_key, entry_prefix, entry_record_id, key_prefix,
    IndexKey, KeyOrdering, KeyValue,
};

/// How an index treats two entries with equal keys.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DupPolicy {
    /// At most one record per key, unless duplicates are explicitly allowed.
    Unique,
    /// Any number of records per key.
    Standard,
}

/// Catalog description of one index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Index name, unique within its collection.
    pub name: String,
    /// `(field, direction)` pairs; a negative direction sorts descending.
    pub key_pattern: Vec<(String, i32)>,
    /// Reject a second record under an existing key.
    #[serde(default)]
    pub unique: bool,
}

impl IndexDescriptor {
    /// Builds a descriptor from `(field, direction)` pairs; a negative direction sorts descending.
    pub fn new(name: &str, key_pattern: &[(&str, i32)], unique: bool) -> Self {
        Self {
            name: name.to_string(),
            key_pattern: key_pattern
                .iter()
                .map(|(field, dir)| (field.to_string(), *dir))
                .collect(),
            unique,
        }
    }

    /// Per-field sort directions.
    pub fn ordering(&self) -> KeyOrdering {
        let directions: Vec<i32> = self.key_pattern.iter().map(|(_, d)| *d).collect();
        KeyOrdering::from_directions(&directions)
    }

    /// Duplicate handling implied by `unique`.
    pub fn policy(&self) -> DupPolicy {
        if self.unique {
            DupPolicy::Unique
        } else {
            DupPolicy::Standard
        }
    }

    /// Engine create configuration carrying the descriptor as metadata.
    pub fn create_config(&self, extra: &str) -> Result<String> {
        let info = serde_json::to_string(self)
            .map_err(|err| DuskError::InvalidArgument(format!("index {}: {err}", self.name)))?;
        let mut config = format!(
            "type=file,key_format=u,value_format=u,app_metadata=(formatVersion=1,infoObj={})",
            hex::encode(info)
        );
        if !extra.is_empty() {
            config.push(',');
            config.push_str(extra);
        }
        Ok(config)
    }
}

/// First record id other than `skip` stored under `prefix`, if any.
fn other_record_with_prefix(
    raw: &mut RawCursor,
    prefix: &[u8],
    skip: RecordId,
) -> Result<Option<RecordId>> {
    let landed = raw.search_near(prefix).map_err(map_engine_error)?;
    if !matches!(landed, Some(Ordering::Equal | Ordering::Greater)) {
        return Ok(None);
    }
    loop {
        let Some(entry) = raw.key() else {
            return Ok(None);
        };
        if !entry.starts_with(prefix) {
            return Ok(None);
        }
        let rid = entry_record_id(entry)?;
        if rid != skip {
            return Ok(Some(rid));
        }
        if !raw.next().map_err(map_engine_error)? {
            return Ok(None);
        }
    }
}

/// The sorted-data interface over one engine table.
#[derive(Debug)]
pub struct KvIndex {
    name: String,
    uri: String,
    table_id: u64,
    ordering: Arc<KeyOrdering>,
    policy: DupPolicy,
}

impl KvIndex {
    /// Index over the table `uri`.
    pub fn new(uri: &str, table_id: u64, desc: &IndexDescriptor) -> Self {
        Self {
            name: desc.name.clone(),
            uri: uri.to_string(),
            table_id,
            ordering: Arc::new(desc.ordering()),
            policy: desc.policy(),
        }
    }

    /// Index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Engine URI of the backing table.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Duplicate handling of this index.
    pub fn policy(&self) -> DupPolicy {
        self.policy
    }

    /// Per-field sort directions.
    pub fn ordering(&self) -> &KeyOrdering {
        &self.ordering
    }

    fn cursor(&self, opctx: &mut OperationContext) -> Result<KvCursor> {
        KvCursor::new(&self.uri, self.table_id, KvRecoveryUnit::get(opctx))
    }

    fn check_arity(&self, key: &IndexKey) -> Result<()> {
        if key.len() != self.ordering.len() {
            return Err(DuskError::InvalidArgument(format!(
                "index {} expects {} key fields, got {}",
                self.name,
                self.ordering.len(),
                key.len()
            )));
        }
        Ok(())
    }

    fn duplicate_error(&self, key: &IndexKey) -> DuskError {
        DuskError::DuplicateKey(format!("index {} dup key: {:?}", self.name, key.values()))
    }

    /// Adds `(key, rid)`. A unique index rejects a key already held by another
    /// record unless `dups_allowed`.
    pub fn insert(
        &self,
        opctx: &mut OperationContext,
        key: &IndexKey,
        rid: RecordId,
        dups_allowed: bool,
    ) -> Result<()> {
        self.check_arity(key)?;
        let prefix = key_prefix(key, &self.ordering);
        let mut cursor = self.cursor(opctx)?;
        let raw = cursor.get();
        if self.policy == DupPolicy::Unique && !dups_allowed {
            if other_record_with_prefix(raw, &prefix, rid)?.is_some() {
                return Err(self.duplicate_error(key));
            }
            // Writing the bare prefix makes concurrent inserts of this key
            // conflict with each other; it never stays visible.
            raw.put(&prefix, &[]).map_err(map_engine_error)?;
            raw.remove(&prefix).map_err(map_engine_error)?;
        }
        raw.put(&entry_key(&prefix, rid), &[])
            .map_err(map_engine_error)?;
        trace!(index = %self.name, rid = rid.0, "index.insert");
        Ok(())
    }

    /// Removes `(key, rid)`; returns `false` when it was not present.
    pub fn unindex(
        &self,
        opctx: &mut OperationContext,
        key: &IndexKey,
        rid: RecordId,
        _dups_allowed: bool,
    ) -> Result<bool> {
        self.check_arity(key)?;
        let entry = entry_key(&key_prefix(key, &self.ordering), rid);
        let mut cursor = self.cursor(opctx)?;
        match cursor.get().remove(&entry) {
            Ok(()) => Ok(true),
            Err(EngineError::NotFound(_)) => {
                debug!(index = %self.name, rid = rid.0, "index.unindex.missing");
                Ok(false)
            }
            Err(err) => Err(map_engine_error(err)),
        }
    }

    /// Fails with `DuplicateKey` if `key` is held by a record other than `rid`.
    pub fn dup_key_check(
        &self,
        opctx: &mut OperationContext,
        key: &IndexKey,
        rid: RecordId,
    ) -> Result<()> {
        self.check_arity(key)?;
        let prefix = key_prefix(key, &self.ordering);
        let mut cursor = self.cursor(opctx)?;
        match other_record_with_prefix(cursor.get(), &prefix, rid)? {
            Some(_) => Err(self.duplicate_error(key)),
            None => Ok(()),
        }
    }

    /// True when the index holds no entries visible to this operation.
    pub fn is_empty(&self, opctx: &mut OperationContext) -> Result<bool> {
        let mut cursor = self.cursor(opctx)?;
        Ok(!cursor.get().next().map_err(map_engine_error)?)
    }

    /// Decodes every entry and checks strict ordering; returns the entry count.
    pub fn full_validate(&self, opctx: &mut OperationContext) -> Result<u64> {
        let mut cursor = self.cursor(opctx)?;
        let raw = cursor.get();
        let mut count = 0u64;
        let mut previous: Option<Vec<u8>> = None;
        while raw.next().map_err(map_engine_error)? {
            let entry = raw.key().unwrap_or_default();
            decode_entry(entry, &self.ordering)?;
            if previous.as_deref().is_some_and(|p| p >= entry) {
                return Err(DuskError::Corruption(format!(
                    "index {} entries out of order",
                    self.name
                )));
            }
            previous = Some(entry.to_vec());
            count += 1;
        }
        Ok(count)
    }

    /// Bytes used by the backing table.
    pub fn space_used_bytes(&self, opctx: &mut OperationContext) -> Result<i64> {
        let session = KvRecoveryUnit::get(opctx).get_session()?;
        let size = session
            .session()
            .table_size(&self.uri)
            .map_err(map_engine_error)?;
        Ok(size as i64)
    }

    /// Reads every entry once.
    pub fn touch(&self, opctx: &mut OperationContext) -> Result<()> {
        let mut cursor = self.cursor(opctx)?;
        let raw = cursor.get();
        while raw.next().map_err(map_engine_error)? {}
        Ok(())
    }

    /// Removes every entry inside the caller's unit of work.
    pub fn init_as_empty(&self, opctx: &mut OperationContext) -> Result<()> {
        let mut cursor = self.cursor(opctx)?;
        let raw = cursor.get();
        let mut entries = Vec::new();
        while raw.next().map_err(map_engine_error)? {
            entries.extend(raw.key().map(<[u8]>::to_vec));
        }
        for entry in &entries {
            raw.remove(entry).map_err(map_engine_error)?;
        }
        Ok(())
    }

    /// Unpositioned cursor in the given direction.
    pub fn new_cursor(&self, forward: bool) -> IndexCursor {
        IndexCursor::new(
            self.uri.clone(),
            self.table_id,
            Arc::clone(&self.ordering),
            forward,
        )
    }

    /// Builder for loading entries in ascending order.
    pub fn bulk_builder(
        &self,
        opctx: &mut OperationContext,
        dups_allowed: bool,
    ) -> Result<BulkBuilder> {
        let cursor = self.cursor(opctx)?;
        Ok(BulkBuilder::new(
            self.name.clone(),
            Arc::clone(&self.ordering),
            self.policy,
            dups_allowed,
            cursor,
        ))
    }
}
