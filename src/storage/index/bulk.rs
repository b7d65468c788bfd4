use std::sync::Arc;

use tracing::debug;

use crate::operation::OperationContext;
use crate::primitives::engine::map_engine_error;
use crate::storage::recovery_unit::KvCursor;
use crate::types::{DuskError, RecordId, Result};

use super::key::{entry_key, key_prefix, IndexKey, KeyOrdering};
use super::DupPolicy;

/// Loads entries that arrive in ascending `(key, record id)` order.
pub struct BulkBuilder {
    name: String,
    ordering: Arc<KeyOrdering>,
    policy: DupPolicy,
    dups_allowed: bool,
    cursor: KvCursor,
    last: Option<(Vec<u8>, RecordId)>,
    added: u64,
}

impl BulkBuilder {
    pub(super) fn new(
        name: String,
        ordering: Arc<KeyOrdering>,
        policy: DupPolicy,
        dups_allowed: bool,
        cursor: KvCursor,
    ) -> Self {
        Self {
            name,
            ordering,
            policy,
            dups_allowed,
            cursor,
            last: None,
            added: 0,
        }
    }

    /// Adds the next key; keys must arrive in index order.
    pub fn add_key(&mut self, key: &IndexKey, rid: RecordId) -> Result<()> {
        if key.len() != self.ordering.len() {
            return Err(DuskError::InvalidArgument(format!(
                "index {} expects {} key fields, got {}",
                self.name,
                self.ordering.len(),
                key.len()
            )));
        }
        let prefix = key_prefix(key, &self.ordering);
        if let Some((last_prefix, last_rid)) = &self.last {
            match prefix.as_slice().cmp(last_prefix.as_slice()) {
                std::cmp::Ordering::Less => {
                    return Err(DuskError::InvalidArgument(format!(
                        "index {}: bulk keys must arrive in ascending order",
                        self.name
                    )));
                }
                std::cmp::Ordering::Equal => {
                    if self.policy == DupPolicy::Unique && !self.dups_allowed {
                        return Err(DuskError::DuplicateKey(format!(
                            "index {} dup key: {:?}",
                            self.name,
                            key.values()
                        )));
                    }
                    if rid <= *last_rid {
                        return Err(DuskError::InvalidArgument(format!(
                            "index {}: record ids for one key must ascend",
                            self.name
                        )));
                    }
                }
                std::cmp::Ordering::Greater => {}
            }
        }
        self.cursor
            .get()
            .put(&entry_key(&prefix, rid), &[])
            .map_err(map_engine_error)?;
        self.last = Some((prefix, rid));
        self.added += 1;
        Ok(())
    }

    /// Finishes the load; returns the number of entries added.
    pub fn commit(self, opctx: &mut OperationContext, may_interrupt: bool) -> Result<u64> {
        if may_interrupt {
            opctx.check_for_interrupt()?;
        }
        debug!(index = %self.name, entries = self.added, "index.bulk.commit");
        Ok(self.added)
    }
}
