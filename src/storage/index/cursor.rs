use std::cmp::Ordering;
use std::sync::Arc;

use crate::operation::OperationContext;
use crate::primitives::engine::{map_engine_error, EngineError};
use crate::storage::recovery_unit::{KvCursor, KvRecoveryUnit};
use crate::types::{DuskError, RecordId, Result};

use super::key::{
    decode_entry, encode_field, entry_key, entry_record_id, key_prefix, IndexKey, KeyOrdering,
    KeyValue,
};

/// Sorts after every continuation of an encoded prefix: no type tag, inverted
/// tag, or entry separator is `0xFF`.
const PAST_PREFIX: u8 = 0xFF;

/// Target of a bounded seek.
///
/// The first `key_begin_len` fields come from `key_begin`. With `after_key`
/// the seek skips every entry sharing those fields. Otherwise field `i` of the
/// remainder is `key_end[i]`, and an exclusive bound skips every entry equal to
/// it; fields after the first exclusive bound are ignored. `key_end` and
/// `key_end_inclusive` are indexed by field position.
#[derive(Clone, Copy, Debug)]
pub struct SeekPoint<'a> {
    /// Key whose leading fields form the seek prefix.
    pub key_begin: &'a IndexKey,
    /// How many leading fields of `key_begin` to use.
    pub key_begin_len: usize,
    /// Skip every entry sharing the prefix instead of landing on it.
    pub after_key: bool,
    /// Values for the fields after the prefix.
    pub key_end: &'a [KeyValue],
    /// Per-field inclusiveness of `key_end`.
    pub key_end_inclusive: &'a [bool],
}

impl<'a> SeekPoint<'a> {
    /// Skips past every entry whose leading `len` fields equal `key`'s.
    pub fn after(key: &'a IndexKey, len: usize) -> Self {
        Self {
            key_begin: key,
            key_begin_len: len,
            after_key: true,
            key_end: &[],
            key_end_inclusive: &[],
        }
    }

    /// Seeks to the leading `len` fields of `key`, then to `end` bounds.
    pub fn bounded(
        key: &'a IndexKey,
        len: usize,
        end: &'a [KeyValue],
        inclusive: &'a [bool],
    ) -> Self {
        Self {
            key_begin: key,
            key_begin_len: len,
            after_key: false,
            key_end: end,
            key_end_inclusive: inclusive,
        }
    }

    /// Engine key to seek to for a cursor moving `forward`.
    fn target(&self, ordering: &KeyOrdering, forward: bool) -> Result<Vec<u8>> {
        let fields = ordering.len();
        if self.key_begin_len > fields || self.key_begin_len > self.key_begin.len() {
            return Err(DuskError::InvalidArgument(format!(
                "seek uses {} leading fields of a {}-field key on a {fields}-field index",
                self.key_begin_len,
                self.key_begin.len()
            )));
        }
        let mut out = Vec::with_capacity(16 * fields);
        for (field, value) in self.key_begin.values()[..self.key_begin_len].iter().enumerate() {
            encode_field(value, ordering.is_descending(field), &mut out);
        }
        if self.after_key {
            if forward {
                out.push(PAST_PREFIX);
            }
            return Ok(out);
        }
        if self.key_end.len() < fields || self.key_end_inclusive.len() < fields {
            return Err(DuskError::InvalidArgument(format!(
                "seek end bounds cover {} of {fields} fields",
                self.key_end.len().min(self.key_end_inclusive.len())
            )));
        }
        for field in self.key_begin_len..fields {
            encode_field(&self.key_end[field], ordering.is_descending(field), &mut out);
            if !self.key_end_inclusive[field] {
                if forward {
                    out.push(PAST_PREFIX);
                }
                return Ok(out);
            }
        }
        if !forward {
            out.push(PAST_PREFIX);
        }
        Ok(out)
    }
}

/// Cursor over an index in one direction.
///
/// The position is the engine key of the current entry, never the engine
/// cursor itself, so it can be saved, carried across a commit or abort, and
/// restored by re-seeking.
pub struct IndexCursor {
    uri: String,
    table_id: u64,
    ordering: Arc<KeyOrdering>,
    forward: bool,
    cursor: Option<KvCursor>,
    current: Option<Vec<u8>>,
    eof: bool,
}

impl IndexCursor {
    pub(super) fn new(uri: String, table_id: u64, ordering: Arc<KeyOrdering>, forward: bool) -> Self {
        Self {
            uri,
            table_id,
            ordering,
            forward,
            cursor: None,
            current: None,
            eof: false,
        }
    }

    /// Whether the cursor moves toward larger keys.
    pub fn is_forward(&self) -> bool {
        self.forward
    }

    /// True once the cursor ran off its end.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    fn engine_cursor(&mut self, opctx: &mut OperationContext) -> Result<&mut KvCursor> {
        if self.cursor.is_none() {
            let ru = KvRecoveryUnit::get(opctx);
            self.cursor = Some(KvCursor::new(&self.uri, self.table_id, ru)?);
        }
        match self.cursor.as_mut() {
            Some(cursor) => Ok(cursor),
            None => crate::types::invariant_failure(
                "cursor.is_some()",
                format_args!("index cursor missing after open"),
            ),
        }
    }

    fn land(&mut self, entry: Option<Vec<u8>>) {
        self.eof = entry.is_none();
        self.current = entry;
    }

    /// Positions on the first entry at or after `target` in cursor direction.
    fn seek(&mut self, opctx: &mut OperationContext, target: &[u8]) -> Result<()> {
        let forward = self.forward;
        let raw = self.engine_cursor(opctx)?.get();
        let landed = raw.search_near(target).map_err(map_engine_error)?;
        let positioned = match landed {
            None => false,
            Some(Ordering::Equal) => true,
            Some(Ordering::Greater) if forward => true,
            Some(Ordering::Less) if !forward => true,
            Some(_) => {
                let stepped = if forward { raw.next() } else { raw.prev() };
                stepped.map_err(map_engine_error)?
            }
        };
        let entry = if positioned {
            raw.key().map(<[u8]>::to_vec)
        } else {
            None
        };
        self.land(entry);
        Ok(())
    }

    /// Seeks to `(key, rid)`; use [`RecordId::MIN`] (forward) or
    /// [`RecordId::MAX`] (reverse) to land on the first entry of `key`.
    ///
    /// Returns `true` when the cursor landed on an entry of `key`.
    pub fn locate(
        &mut self,
        opctx: &mut OperationContext,
        key: &IndexKey,
        rid: RecordId,
    ) -> Result<bool> {
        let prefix = key_prefix(key, &self.ordering);
        self.seek(opctx, &entry_key(&prefix, rid))?;
        Ok(self
            .current
            .as_deref()
            .is_some_and(|entry| entry.starts_with(&prefix)))
    }

    /// Positions on the first entry at or past `point` in cursor direction.
    pub fn custom_locate(&mut self, opctx: &mut OperationContext, point: &SeekPoint<'_>) -> Result<()> {
        let target = point.target(&self.ordering, self.forward)?;
        self.seek(opctx, &target)
    }

    /// Like [`Self::custom_locate`], but never moves the cursor backwards.
    pub fn advance_to(&mut self, opctx: &mut OperationContext, point: &SeekPoint<'_>) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        let target = point.target(&self.ordering, self.forward)?;
        if let Some(current) = self.current.as_deref() {
            let behind = if self.forward {
                target.as_slice() <= current
            } else {
                target.as_slice() >= current
            };
            if behind {
                return Ok(());
            }
        }
        self.seek(opctx, &target)
    }

    /// Moves one entry in cursor direction, setting end-of-stream when exhausted.
    pub fn advance(&mut self, opctx: &mut OperationContext) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        if self.cursor.is_none() {
            if let Some(current) = self.current.clone() {
                return self.step_past(opctx, &current);
            }
        }
        let forward = self.forward;
        let raw = self.engine_cursor(opctx)?.get();
        let stepped = if forward { raw.next() } else { raw.prev() };
        match stepped {
            Ok(true) => {
                let entry = raw.key().map(<[u8]>::to_vec);
                self.land(entry);
                Ok(())
            }
            Ok(false) => {
                self.land(None);
                Ok(())
            }
            Err(EngineError::CursorReset(_)) => {
                self.cursor = None;
                match self.current.clone() {
                    Some(current) => self.step_past(opctx, &current),
                    None => self.advance(opctx),
                }
            }
            Err(err) => Err(map_engine_error(err)),
        }
    }

    /// Re-seeks to `entry` and moves strictly past it.
    fn step_past(&mut self, opctx: &mut OperationContext, entry: &[u8]) -> Result<()> {
        self.seek(opctx, entry)?;
        if self.current.as_deref() == Some(entry) {
            let forward = self.forward;
            let raw = self.engine_cursor(opctx)?.get();
            let stepped = if forward { raw.next() } else { raw.prev() };
            let next = if stepped.map_err(map_engine_error)? {
                raw.key().map(<[u8]>::to_vec)
            } else {
                None
            };
            self.land(next);
        }
        Ok(())
    }

    /// Key at the current position.
    pub fn key(&self) -> Result<Option<IndexKey>> {
        match self.current.as_deref() {
            Some(entry) if !self.eof => Ok(Some(decode_entry(entry, &self.ordering)?.0)),
            _ => Ok(None),
        }
    }

    /// Record id at the current position.
    pub fn record_id(&self) -> Result<Option<RecordId>> {
        match self.current.as_deref() {
            Some(entry) if !self.eof => Ok(Some(entry_record_id(entry)?)),
            _ => Ok(None),
        }
    }

    /// True when both cursors are at the same entry or both exhausted.
    pub fn points_to_same_place_as(&self, other: &IndexCursor) -> bool {
        if self.eof || other.eof {
            return self.eof && other.eof;
        }
        self.current.is_some() && self.current == other.current
    }

    /// Releases the engine cursor, keeping the logical position.
    pub fn save_position(&mut self) {
        self.cursor = None;
    }

    /// Re-seeks to the saved entry, or to the next one in cursor direction if
    /// it was removed meanwhile.
    pub fn restore_position(&mut self, opctx: &mut OperationContext) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        match self.current.clone() {
            Some(entry) => self.seek(opctx, &entry),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for IndexCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCursor")
            .field("uri", &self.uri)
            .field("forward", &self.forward)
            .field("eof", &self.eof)
            .field("current", &self.current.as_deref().map(hex::encode))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::SeekPoint;
    use crate::storage::index::{IndexDescriptor, IndexKey, KeyValue, KvIndex};
    use crate::storage::kv::tests_support::{harness, Harness};
    use crate::operation::OperationContext;
    use crate::types::RecordId;

    fn filled(h: &Harness, opctx: &mut OperationContext, keys: &[i64]) -> KvIndex {
        let desc = IndexDescriptor::new("a_1", &[("a", 1)], false);
        let index = h.index(opctx, "test.c", &desc);
        opctx
            .write_unit_of_work(|opctx| {
                for (i, k) in keys.iter().enumerate() {
                    index.insert(opctx, &IndexKey::single(*k), RecordId(i as i64 + 1), false)?;
                }
                Ok(())
            })
            .unwrap();
        index
    }

    fn int_at(cursor: &super::IndexCursor) -> Option<i64> {
        match cursor.key().unwrap()?.values() {
            [crate::storage::index::KeyValue::Int(v)] => Some(*v),
            _ => None,
        }
    }

    #[test]
    fn forward_and_reverse_walks() {
        let h = harness();
        let mut opctx = h.opctx();
        let index = filled(&h, &mut opctx, &[10, 20, 30]);

        let mut fwd = index.new_cursor(true);
        assert!(!fwd.locate(&mut opctx, &IndexKey::single(15i64), RecordId::MIN).unwrap());
        assert_eq!(int_at(&fwd), Some(20));
        fwd.advance(&mut opctx).unwrap();
        assert_eq!(int_at(&fwd), Some(30));
        fwd.advance(&mut opctx).unwrap();
        assert!(fwd.is_eof());
        assert_eq!(fwd.key().unwrap(), None);

        let mut rev = index.new_cursor(false);
        assert!(!rev.locate(&mut opctx, &IndexKey::single(25i64), RecordId::MAX).unwrap());
        assert_eq!(int_at(&rev), Some(20));
        rev.advance(&mut opctx).unwrap();
        assert_eq!(int_at(&rev), Some(10));
        rev.advance(&mut opctx).unwrap();
        assert!(rev.is_eof());
    }

    #[test]
    fn save_commit_restore_returns_same_or_next_key() {
        let h = harness();
        let mut opctx = h.opctx();
        let index = filled(&h, &mut opctx, &[1, 2, 3]);

        let mut cursor = index.new_cursor(true);
        assert!(cursor.locate(&mut opctx, &IndexKey::single(2i64), RecordId::MIN).unwrap());
        cursor.save_position();
        opctx.recovery_unit_mut().abandon_snapshot();
        cursor.restore_position(&mut opctx).unwrap();
        assert_eq!(int_at(&cursor), Some(2));

        cursor.save_position();
        opctx
            .write_unit_of_work(|opctx| index.unindex(opctx, &IndexKey::single(2i64), RecordId(2), false))
            .unwrap();
        cursor.restore_position(&mut opctx).unwrap();
        assert_eq!(int_at(&cursor), Some(3));
    }

    #[test]
    fn advance_recovers_from_transaction_boundary() {
        let h = harness();
        let mut opctx = h.opctx();
        let index = filled(&h, &mut opctx, &[1, 2, 3]);
        let mut cursor = index.new_cursor(true);
        cursor.locate(&mut opctx, &IndexKey::single(1i64), RecordId::MIN).unwrap();
        opctx.recovery_unit_mut().commit_and_restart().unwrap();
        cursor.advance(&mut opctx).unwrap();
        assert_eq!(int_at(&cursor), Some(2));
    }

    #[test]
    fn cursors_compare_positions() {
        let h = harness();
        let mut opctx = h.opctx();
        let index = filled(&h, &mut opctx, &[5]);
        let mut a = index.new_cursor(true);
        let mut b = index.new_cursor(true);
        a.locate(&mut opctx, &IndexKey::single(5i64), RecordId::MIN).unwrap();
        b.locate(&mut opctx, &IndexKey::single(1i64), RecordId::MIN).unwrap();
        assert!(a.points_to_same_place_as(&b));
        a.advance(&mut opctx).unwrap();
        assert!(!a.points_to_same_place_as(&b));
        b.advance(&mut opctx).unwrap();
        assert!(a.points_to_same_place_as(&b));
    }

    const PAIRS: [(i64, i64); 6] = [(1, 1), (1, 2), (1, 3), (2, 1), (2, 2), (3, 1)];

    fn compound(h: &Harness, opctx: &mut OperationContext, directions: [i32; 2]) -> KvIndex {
        let desc = IndexDescriptor::new("a_b", &[("a", directions[0]), ("b", directions[1])], false);
        let index = h.index(opctx, "test.c", &desc);
        opctx
            .write_unit_of_work(|opctx| {
                for (i, (a, b)) in PAIRS.iter().enumerate() {
                    let key = IndexKey::new([KeyValue::Int(*a), KeyValue::Int(*b)]);
                    index.insert(opctx, &key, RecordId(i as i64 + 1), false)?;
                }
                Ok(())
            })
            .unwrap();
        index
    }

    fn pair(a: i64, b: i64) -> IndexKey {
        IndexKey::new([KeyValue::Int(a), KeyValue::Int(b)])
    }

    fn pair_at(cursor: &super::IndexCursor) -> Option<(i64, i64)> {
        match cursor.key().unwrap()?.values() {
            [KeyValue::Int(a), KeyValue::Int(b)] => Some((*a, *b)),
            _ => None,
        }
    }

    #[test]
    fn custom_locate_skips_prefixes_and_honours_end_bounds() {
        let h = harness();
        let mut opctx = h.opctx();
        let index = compound(&h, &mut opctx, [1, 1]);
        let mut cursor = index.new_cursor(true);

        let one = pair(1, 0);
        cursor.custom_locate(&mut opctx, &SeekPoint::after(&one, 1)).unwrap();
        assert_eq!(pair_at(&cursor), Some((2, 1)));

        let two = pair(2, 0);
        let end = [KeyValue::MinKey, KeyValue::Int(2)];
        cursor
            .custom_locate(&mut opctx, &SeekPoint::bounded(&two, 1, &end, &[true, true]))
            .unwrap();
        assert_eq!(pair_at(&cursor), Some((2, 2)));
        cursor
            .custom_locate(&mut opctx, &SeekPoint::bounded(&two, 1, &end, &[true, false]))
            .unwrap();
        assert_eq!(pair_at(&cursor), Some((3, 1)));

        let end = [KeyValue::Int(1), KeyValue::Int(3)];
        cursor
            .custom_locate(&mut opctx, &SeekPoint::bounded(&one, 0, &end, &[true, false]))
            .unwrap();
        assert_eq!(pair_at(&cursor), Some((2, 1)));

        let three = pair(3, 0);
        cursor.custom_locate(&mut opctx, &SeekPoint::after(&three, 1)).unwrap();
        assert!(cursor.is_eof());
    }

    #[test]
    fn reverse_custom_locate_lands_on_the_near_side() {
        let h = harness();
        let mut opctx = h.opctx();
        let index = compound(&h, &mut opctx, [1, 1]);
        let mut cursor = index.new_cursor(false);

        let two = pair(2, 0);
        cursor.custom_locate(&mut opctx, &SeekPoint::after(&two, 1)).unwrap();
        assert_eq!(pair_at(&cursor), Some((1, 3)));

        let end = [KeyValue::MaxKey, KeyValue::Int(1)];
        cursor
            .custom_locate(&mut opctx, &SeekPoint::bounded(&two, 1, &end, &[true, true]))
            .unwrap();
        assert_eq!(pair_at(&cursor), Some((2, 1)));
        cursor
            .custom_locate(&mut opctx, &SeekPoint::bounded(&two, 1, &end, &[true, false]))
            .unwrap();
        assert_eq!(pair_at(&cursor), Some((1, 3)));
        cursor.advance(&mut opctx).unwrap();
        assert_eq!(pair_at(&cursor), Some((1, 2)));
    }

    #[test]
    fn custom_locate_follows_descending_fields() {
        let h = harness();
        let mut opctx = h.opctx();
        let index = compound(&h, &mut opctx, [1, -1]);
        let mut cursor = index.new_cursor(true);

        let one = pair(1, 0);
        let end = [KeyValue::MinKey, KeyValue::Int(2)];
        cursor
            .custom_locate(&mut opctx, &SeekPoint::bounded(&one, 1, &end, &[true, false]))
            .unwrap();
        assert_eq!(pair_at(&cursor), Some((1, 1)));
        cursor.advance(&mut opctx).unwrap();
        assert_eq!(pair_at(&cursor), Some((2, 2)));
    }

    #[test]
    fn advance_to_never_moves_backwards() {
        let h = harness();
        let mut opctx = h.opctx();
        let index = compound(&h, &mut opctx, [1, 1]);
        let mut cursor = index.new_cursor(true);
        assert!(cursor.locate(&mut opctx, &pair(2, 2), RecordId::MIN).unwrap());

        let one = pair(1, 0);
        cursor.advance_to(&mut opctx, &SeekPoint::after(&one, 1)).unwrap();
        assert_eq!(pair_at(&cursor), Some((2, 2)));

        let two = pair(2, 0);
        cursor.advance_to(&mut opctx, &SeekPoint::after(&two, 1)).unwrap();
        assert_eq!(pair_at(&cursor), Some((3, 1)));

        let three = pair(3, 0);
        cursor.advance_to(&mut opctx, &SeekPoint::after(&three, 1)).unwrap();
        assert!(cursor.is_eof());
        cursor.advance_to(&mut opctx, &SeekPoint::after(&one, 1)).unwrap();
        assert!(cursor.is_eof());
    }

    #[test]
    fn short_end_bounds_are_rejected() {
        let h = harness();
        let mut opctx = h.opctx();
        let index = compound(&h, &mut opctx, [1, 1]);
        let mut cursor = index.new_cursor(true);
        let one = pair(1, 0);
        let end = [KeyValue::Int(1)];
        assert!(cursor
            .custom_locate(&mut opctx, &SeekPoint::bounded(&one, 1, &end, &[true]))
            .is_err());
        assert!(cursor
            .custom_locate(&mut opctx, &SeekPoint::after(&one, 3))
            .is_err());
    }
}
