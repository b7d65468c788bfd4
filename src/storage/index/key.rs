//! Order-preserving, prefix-free encoding of index keys.
//!
//! Each field starts with a type tag so values of different types compare by
//! type first. Descending fields have every byte of their encoding inverted.
//! An index entry is stored under `encode(key) ‖ 0x00 ‖ record_id`.
//!
//! Numbers compare by value regardless of representation: `Int(1)` and
//! `Double(1.0)` encode to the same bytes. A number is written as the largest
//! double not above it followed by the exact integer remainder, which is only
//! non-zero for integers a double cannot hold.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::primitives::bytes::ord;
use crate::types::{DuskError, RecordId, Result};

const TAG_MIN_KEY: u8 = 0x10;
const TAG_NULL: u8 = 0x20;
const TAG_FALSE: u8 = 0x30;
const TAG_TRUE: u8 = 0x31;
const TAG_NUMBER: u8 = 0x40;
const TAG_STRING: u8 = 0x50;
const TAG_MAX_KEY: u8 = 0xF0;


const STRING_ESCAPE: u8 = 0xFF;
const STRING_END: u8 = 0x01;

const ENTRY_SEPARATOR: u8 = 0x00;

/// One field of an index key.
///
/// Equality is by value: numbers of either representation are equal when
/// they denote the same number, and NaN equals NaN.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KeyValue {
    /// Sorts before every other value.
    MinKey,
    /// Null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer; equal to the [`KeyValue::Double`] of the same value.
    Int(i64),
    /// Floating point; NaN sorts after every other number.
    Double(f64),
    /// UTF-8 string, compared bytewise.
    Str(String),
    /// Sorts after every other value.
    MaxKey,
}

impl KeyValue {
    /// `(ordered double bits, remainder)` of a number; `None` for other types.
    fn number_parts(&self) -> Option<(u64, u16)> {
        match self {
            KeyValue::Int(v) => {
                let floor = floor_f64(*v);
                let rem = (i128::from(*v) - floor as i128) as u16;
                Some((ordered_bits(floor), rem))
            }
            KeyValue::Double(v) => Some((ordered_bits(*v), 0)),
            _ => None,
        }
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (KeyValue::MinKey, KeyValue::MinKey)
            | (KeyValue::Null, KeyValue::Null)
            | (KeyValue::MaxKey, KeyValue::MaxKey) => true,
            (KeyValue::Bool(a), KeyValue::Bool(b)) => a == b,
            (KeyValue::Str(a), KeyValue::Str(b)) => a == b,
            (a, b) => match (a.number_parts(), b.number_parts()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

/// Largest double not above `v`.
fn floor_f64(v: i64) -> f64 {
    let nearest = v as f64;
    if nearest as i128 <= i128::from(v) {
        return nearest;
    }
    let bits = nearest.to_bits();
    if nearest > 0.0 {
        f64::from_bits(bits - 1)
    } else {
        f64::from_bits(bits + 1)
    }
}

/// Bits of `v` as [`ord::push_f64`] writes them, with `-0.0` folded into `0.0`.
fn ordered_bits(v: f64) -> u64 {
    let v = if v == 0.0 { 0.0 } else { v };
    let mut buf = Vec::with_capacity(8);
    ord::push_f64(&mut buf, v);
    buf.iter().fold(0, |acc, b| (acc << 8) | u64::from(*b))
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<f64> for KeyValue {
    fn from(v: f64) -> Self {
        KeyValue::Double(v)
    }
}

impl From<bool> for KeyValue {
    fn from(v: bool) -> Self {
        KeyValue::Bool(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Str(v.to_string())
    }
}

/// A tuple of key fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexKey(pub SmallVec<[KeyValue; 4]>);

impl IndexKey {
    /// Key with the given field values.
    pub fn new(values: impl IntoIterator<Item = KeyValue>) -> Self {
        Self(values.into_iter().collect())
    }

    /// Single-field key.
    pub fn single(value: impl Into<KeyValue>) -> Self {
        Self::new([value.into()])
    }

    /// Field values in order.
    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the empty key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-field sort direction of an index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOrdering {
    descending: Vec<bool>,
}

impl KeyOrdering {
    /// All-ascending ordering over `fields` fields.
    pub fn ascending(fields: usize) -> Self {
        Self {
            descending: vec![false; fields],
        }
    }

    /// Ordering from key-pattern directions; negative means descending.
    pub fn from_directions(directions: &[i32]) -> Self {
        Self {
            descending: directions.iter().map(|d| *d < 0).collect(),
        }
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.descending.len()
    }

    /// True when no field is described.
    pub fn is_empty(&self) -> bool {
        self.descending.is_empty()
    }

    /// Whether `field` sorts high to low.
    pub fn is_descending(&self, field: usize) -> bool {
        self.descending.get(field).copied().unwrap_or(false)
    }
}

fn encode_value(value: &KeyValue, out: &mut Vec<u8>) {
    match value {
        KeyValue::MinKey => out.push(TAG_MIN_KEY),
        KeyValue::Null => out.push(TAG_NULL),
        KeyValue::Bool(false) => out.push(TAG_FALSE),
        KeyValue::Bool(true) => out.push(TAG_TRUE),
        KeyValue::Int(_) | KeyValue::Double(_) => {
            if let Some((bits, rem)) = value.number_parts() {
                out.push(TAG_NUMBER);
                ord::push_u64(out, bits);
                out.extend_from_slice(&rem.to_be_bytes());
            }
        }
        KeyValue::Str(s) => {
            out.push(TAG_STRING);
            for &b in s.as_bytes() {
                out.push(b);
                if b == 0 {
                    out.push(STRING_ESCAPE);
                }
            }
            out.push(0);
            out.push(STRING_END);
        }
        KeyValue::MaxKey => out.push(TAG_MAX_KEY),
    }
}

/// Encodes `key` under `ordering`.
pub fn encode_key(key: &IndexKey, ordering: &KeyOrdering) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 * key.len());
    for (field, value) in key.values().iter().enumerate() {
        encode_field(value, ordering.is_descending(field), &mut out);
    }
    out
}

/// Appends one field, inverted when the field sorts descending.
pub(crate) fn encode_field(value: &KeyValue, descending: bool, out: &mut Vec<u8>) {
    let start = out.len();
    encode_value(value, out);
    if descending {
        for b in &mut out[start..] {
            *b = !*b;
        }
    }
}

/// Prefix shared by every entry of `key`: `encode(key) ‖ 0x00`.
pub fn key_prefix(key: &IndexKey, ordering: &KeyOrdering) -> Vec<u8> {
    let mut out = encode_key(key, ordering);
    out.push(ENTRY_SEPARATOR);
    out
}

/// Full engine key of one entry given its prefix.
pub fn entry_key(prefix: &[u8], rid: RecordId) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 8);
    out.extend_from_slice(prefix);
    ord::push_i64(&mut out, rid.0);
    out
}

/// Record id stored in the last eight bytes of an entry key.
pub fn entry_record_id(entry: &[u8]) -> Result<RecordId> {
    let tail = entry
        .len()
        .checked_sub(8)
        .map(|at| &entry[at..])
        .ok_or_else(|| DuskError::Corruption("index entry shorter than a record id".into()))?;
    Ok(RecordId(ord::read_i64(tail)?))
}

/// Prefix part (`encode(key) ‖ 0x00`) of an entry key.
pub fn entry_prefix(entry: &[u8]) -> &[u8] {
    &entry[..entry.len().saturating_sub(8)]
}

struct FieldReader<'a> {
    src: &'a [u8],
    pos: usize,
    invert: bool,
}

impl FieldReader<'_> {
    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .src
            .get(self.pos)
            .ok_or_else(|| DuskError::Corruption("index key truncated".into()))?;
        self.pos += 1;
        Ok(if self.invert { !b } else { b })
    }

    fn word(&mut self) -> Result<[u8; 8]> {
        let mut buf = [0u8; 8];
        for slot in &mut buf {
            *slot = self.byte()?;
        }
        Ok(buf)
    }

    fn value(&mut self) -> Result<KeyValue> {
        let tag = self.byte()?;
        Ok(match tag {
            TAG_MIN_KEY => KeyValue::MinKey,
            TAG_NULL => KeyValue::Null,
            TAG_FALSE => KeyValue::Bool(false),
            TAG_TRUE => KeyValue::Bool(true),
            TAG_NUMBER => {
                let floor = ord::read_f64(&self.word()?)?;
                let rem = u16::from_be_bytes([self.byte()?, self.byte()?]);
                number_from_parts(floor, rem)?
            }
            TAG_STRING => {
                let mut bytes = Vec::new();
                loop {
                    match self.byte()? {
                        0 => match self.byte()? {
                            STRING_ESCAPE => bytes.push(0),
                            STRING_END => break,
                            other => {
                                return Err(DuskError::Corruption(format!(
                                    "bad string escape {other:#04x}"
                                )))
                            }
                        },
                        b => bytes.push(b),
                    }
                }
                KeyValue::Str(String::from_utf8(bytes).map_err(|_| {
                    DuskError::Corruption("index string is not valid UTF-8".into())
                })?)
            }
            TAG_MAX_KEY => KeyValue::MaxKey,
            other => {
                return Err(DuskError::Corruption(format!(
                    "unknown key type tag {other:#04x}"
                )))
            }
        })
    }
}

/// Integral values in `i64` range decode as `Int`, everything else as `Double`.
fn number_from_parts(floor: f64, rem: u16) -> Result<KeyValue> {
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    let integral = floor.fract() == 0.0 && (-TWO_POW_63..TWO_POW_63).contains(&floor);
    if rem == 0 {
        return Ok(if integral {
            KeyValue::Int(floor as i64)
        } else {
            KeyValue::Double(floor)
        });
    }
    if !integral {
        return Err(DuskError::Corruption(format!(
            "number remainder {rem} after non-integral {floor}"
        )));
    }
    (floor as i64)
        .checked_add(i64::from(rem))
        .map(KeyValue::Int)
        .ok_or_else(|| DuskError::Corruption("number remainder overflows i64".into()))
}

/// Decodes an encoded key with `ordering.len()` fields; returns the key and
/// the number of bytes consumed.
pub fn decode_key(bytes: &[u8], ordering: &KeyOrdering) -> Result<(IndexKey, usize)> {
    let mut pos = 0;
    let mut values = SmallVec::new();
    for field in 0..ordering.len() {
        let mut reader = FieldReader {
            src: bytes,
            pos,
            invert: ordering.is_descending(field),
        };
        values.push(reader.value()?);
        pos = reader.pos;
    }
    Ok((IndexKey(values), pos))
}

/// Splits an entry key into its key and record id.
pub fn decode_entry(entry: &[u8], ordering: &KeyOrdering) -> Result<(IndexKey, RecordId)> {
    let (key, used) = decode_key(entry, ordering)?;
    if entry.len() != used + 1 + 8 || entry[used] != ENTRY_SEPARATOR {
        return Err(DuskError::Corruption(format!(
            "index entry of {} bytes has a malformed tail",
            entry.len()
        )));
    }
    Ok((key, entry_record_id(entry)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn enc(values: Vec<KeyValue>) -> Vec<u8> {
        encode_key(&IndexKey::new(values), &KeyOrdering::ascending(1))
    }

    #[test]
    fn types_sort_by_tag_then_value() {
        let ordered = [
            KeyValue::MinKey,
            KeyValue::Null,
            KeyValue::Bool(false),
            KeyValue::Bool(true),
            KeyValue::Int(-5),
            KeyValue::Double(-0.5),
            KeyValue::Int(0),
            KeyValue::Double(2.5),
            KeyValue::Int(3),
            KeyValue::Str(String::new()),
            KeyValue::Str("a".into()),
            KeyValue::Str("a\0".into()),
            KeyValue::Str("ab".into()),
            KeyValue::MaxKey,
        ];
        for pair in ordered.windows(2) {
            assert!(
                enc(vec![pair[0].clone()]) < enc(vec![pair[1].clone()]),
                "{:?} !< {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn descending_field_reverses_order_and_decodes() {
        let ordering = KeyOrdering::from_directions(&[1, -1]);
        let a = IndexKey::new([KeyValue::Int(1), KeyValue::Str("x".into())]);
        let b = IndexKey::new([KeyValue::Int(1), KeyValue::Str("y".into())]);
        assert!(encode_key(&a, &ordering) > encode_key(&b, &ordering));
        let entry = entry_key(&key_prefix(&b, &ordering), RecordId(9));
        assert_eq!(decode_entry(&entry, &ordering).unwrap(), (b, RecordId(9)));
    }

    #[test]
    fn entries_of_one_key_share_the_prefix() {
        let ordering = KeyOrdering::ascending(1);
        let key = IndexKey::single("k");
        let prefix = key_prefix(&key, &ordering);
        let low = entry_key(&prefix, RecordId(1));
        let high = entry_key(&prefix, RecordId(2));
        assert!(low < high);
        assert_eq!(entry_prefix(&high), prefix.as_slice());
        assert_eq!(entry_record_id(&high).unwrap(), RecordId(2));
        let next = key_prefix(&IndexKey::single("k\0"), &ordering);
        assert!(!next.starts_with(&prefix));
    }

    #[test]
    fn corrupt_entries_are_rejected() {
        let ordering = KeyOrdering::ascending(1);
        assert!(matches!(
            decode_entry(&[0x99, 0, 0, 0, 0, 0, 0, 0, 0, 0], &ordering),
            Err(DuskError::Corruption(_))
        ));
        assert!(decode_entry(&[TAG_NULL], &ordering).is_err());
    }

    #[test]
    fn equal_numbers_share_one_encoding() {
        assert_eq!(enc(vec![KeyValue::Int(1)]), enc(vec![KeyValue::Double(1.0)]));
        assert_eq!(enc(vec![KeyValue::Double(-0.0)]), enc(vec![KeyValue::Int(0)]));
        assert_eq!(KeyValue::Int(7), KeyValue::Double(7.0));
        assert_ne!(KeyValue::Int(7), KeyValue::Double(7.5));
        assert_eq!(KeyValue::Double(f64::NAN), KeyValue::Double(f64::NAN));
        assert_ne!(KeyValue::Int(1), KeyValue::Bool(true));
    }

    #[test]
    fn integers_beyond_double_precision_keep_exact_order() {
        let two_53 = 1i64 << 53;
        let ordered = [
            KeyValue::Double(f64::NEG_INFINITY),
            KeyValue::Int(i64::MIN),
            KeyValue::Int(-two_53 - 1),
            KeyValue::Double(-(two_53 as f64)),
            KeyValue::Double(two_53 as f64),
            KeyValue::Int(two_53 + 1),
            KeyValue::Double((two_53 + 2) as f64),
            KeyValue::Int(i64::MAX - 1),
            KeyValue::Int(i64::MAX),
            KeyValue::Double(9_223_372_036_854_775_808.0),
            KeyValue::Double(f64::INFINITY),
            KeyValue::Double(f64::NAN),
        ];
        for pair in ordered.windows(2) {
            assert!(
                enc(vec![pair[0].clone()]) < enc(vec![pair[1].clone()]),
                "{:?} !< {:?}",
                pair[0],
                pair[1]
            );
        }
        let ordering = KeyOrdering::ascending(1);
        for value in ordered {
            let key = IndexKey::single(value);
            let bytes = encode_key(&key, &ordering);
            assert_eq!(decode_key(&bytes, &ordering).unwrap(), (key, bytes.len()));
        }
    }

    /// Numbers whose doubled value is an exact integer, clustered around the
    /// edge of double precision.
    fn number() -> impl Strategy<Value = KeyValue> {
        let edge = 1i64 << 53;
        prop_oneof![
            any::<i64>().prop_map(KeyValue::Int),
            (-edge - 8..edge + 8).prop_map(KeyValue::Int),
            (-8i64..8).prop_map(move |d| KeyValue::Int(edge + d)),
            (-(1i64 << 52)..(1i64 << 52)).prop_map(|k| KeyValue::Double(k as f64 / 2.0)),
            (-8i64..8).prop_map(move |d| KeyValue::Double((edge + d) as f64)),
        ]
    }

    fn doubled(v: &KeyValue) -> i128 {
        match v {
            KeyValue::Int(i) => i128::from(*i) * 2,
            KeyValue::Double(d) => (d * 2.0) as i128,
            other => unreachable!("not a number: {other:?}"),
        }
    }

    fn key_value() -> impl Strategy<Value = KeyValue> {
        prop_oneof![
            Just(KeyValue::Null),
            any::<bool>().prop_map(KeyValue::Bool),
            any::<i64>().prop_map(KeyValue::Int),
            "[a-c\\x00]{0,4}".prop_map(KeyValue::Str),
        ]
    }

    fn rank(v: &KeyValue) -> u8 {
        match v {
            KeyValue::MinKey => 0,
            KeyValue::Null => 1,
            KeyValue::Bool(_) => 2,
            KeyValue::Int(_) | KeyValue::Double(_) => 3,
            KeyValue::Str(_) => 4,
            KeyValue::MaxKey => 5,
        }
    }

    fn cmp_values(a: &KeyValue, b: &KeyValue) -> std::cmp::Ordering {
        match (a, b) {
            (KeyValue::Bool(x), KeyValue::Bool(y)) => x.cmp(y),
            (KeyValue::Int(x), KeyValue::Int(y)) => x.cmp(y),
            (KeyValue::Str(x), KeyValue::Str(y)) => x.as_bytes().cmp(y.as_bytes()),
            _ => rank(a).cmp(&rank(b)),
        }
    }

    proptest! {
        #[test]
        fn byte_order_matches_value_order(
            a in proptest::collection::vec(key_value(), 2),
            b in proptest::collection::vec(key_value(), 2),
            desc in any::<bool>(),
        ) {
            let ordering = KeyOrdering::from_directions(&[1, if desc { -1 } else { 1 }]);
            let expected = cmp_values(&a[0], &b[0]).then_with(|| {
                let second = cmp_values(&a[1], &b[1]);
                if desc { second.reverse() } else { second }
            });
            let (ka, kb) = (IndexKey::new(a.clone()), IndexKey::new(b.clone()));
            let (ea, eb) = (encode_key(&ka, &ordering), encode_key(&kb, &ordering));
            prop_assert_eq!(ea.cmp(&eb), expected);
            prop_assert_eq!(decode_key(&ea, &ordering).unwrap(), (ka, ea.len()));
        }

        #[test]
        fn number_bytes_order_by_exact_value(a in number(), b in number()) {
            let (ea, eb) = (enc(vec![a.clone()]), enc(vec![b.clone()]));
            prop_assert_eq!(ea.cmp(&eb), doubled(&a).cmp(&doubled(&b)));
            prop_assert_eq!(a == b, doubled(&a) == doubled(&b));
        }
    }
}
