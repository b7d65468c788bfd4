//! Checkpoint image and journal.
//!
//! The checkpoint (`<home>/dusk.ckpt`) holds every table's live rows as of one
//! commit timestamp:
//!
//! ```text
//! magic "DUSKCKPT" | version u16 BE | payload | crc32 u32 BE
//! payload = ts | next_table_id | table_count | { id | uri | config | rows | { key | value }* }*
//! ```
//!
//! Integers in the payload are varints and strings/byte strings are
//! varint-length-prefixed. A checkpoint is written to a temporary file,
//! fsynced, then renamed over the previous one.
//!
//! The journal (`<home>/<log.path>/dusk.log`) is a sequence of frames
//! `kind u8 | len u32 BE | crc32 u32 BE | payload`. Replay stops at the first
//! torn or corrupt frame and truncates the file there.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::session::TxnWrites;
use super::table::{PendingWrites, Table};
use super::{EngineError, EngineResult};
use crate::primitives::bytes::{buf::Reader, var};
use crate::types::frame_crc32;

const CHECKPOINT_FILE: &str = "dusk.ckpt";
const CHECKPOINT_TMP: &str = "dusk.ckpt.tmp";
const CHECKPOINT_MAGIC: [u8; 8] = *b"DUSKCKPT";
const CHECKPOINT_VERSION: u16 = 1;
const CHECKPOINT_KIND: u8 = 0xC0;
const JOURNAL_FILE: &str = "dusk.log";
const FRAME_HEADER_LEN: usize = 9;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RecordKind {
    Commit = 1,
    Create = 2,
    Drop = 3,
}

impl RecordKind {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(RecordKind::Commit),
            2 => Some(RecordKind::Create),
            3 => Some(RecordKind::Drop),
            _ => None,
        }
    }
}

/// Decoded journal record.
#[derive(Debug, PartialEq)]
pub(crate) enum Record {
    Commit {
        ts: u64,
        ops: Vec<(String, Vec<u8>, Option<Vec<u8>>)>,
    },
    Create {
        ts: u64,
        id: u64,
        uri: String,
        config: String,
    },
    Drop {
        ts: u64,
        uri: String,
    },
}

impl Record {
    fn ts(&self) -> u64 {
        match self {
            Record::Commit { ts, .. } | Record::Create { ts, .. } | Record::Drop { ts, .. } => *ts,
        }
    }
}

pub(crate) fn encode_commit(ts: u64, writes: &BTreeMap<u64, TxnWrites>) -> Vec<u8> {
    let mut out = Vec::new();
    var::encode_u64(ts, &mut out);
    let count: usize = writes.values().map(|w| w.entries.len()).sum();
    var::encode_u64(count as u64, &mut out);
    for batch in writes.values() {
        for (key, value) in &batch.entries {
            var::encode_bytes(batch.table.uri.as_bytes(), &mut out);
            var::encode_bytes(key, &mut out);
            match value {
                Some(value) => {
                    out.push(1);
                    var::encode_bytes(value, &mut out);
                }
                None => out.push(0),
            }
        }
    }
    out
}

pub(crate) fn encode_create(ts: u64, id: u64, uri: &str, config: &str) -> Vec<u8> {
    let mut out = Vec::new();
    var::encode_u64(ts, &mut out);
    var::encode_u64(id, &mut out);
    var::encode_bytes(uri.as_bytes(), &mut out);
    var::encode_bytes(config.as_bytes(), &mut out);
    out
}

pub(crate) fn encode_drop(ts: u64, uri: &str) -> Vec<u8> {
    let mut out = Vec::new();
    var::encode_u64(ts, &mut out);
    var::encode_bytes(uri.as_bytes(), &mut out);
    out
}

fn decode_record(kind: RecordKind, payload: &[u8]) -> EngineResult<Record> {
    let mut r = Reader::new(payload);
    let ts = r.varint()?;
    let record = match kind {
        RecordKind::Commit => {
            let count = r.varint()? as usize;
            let mut ops = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let uri = r.string()?;
                let key = r.bytes()?.to_vec();
                let value = match r.u8()? {
                    0 => None,
                    1 => Some(r.bytes()?.to_vec()),
                    other => {
                        return Err(EngineError::Corruption(format!(
                            "journal value tag {other}"
                        )))
                    }
                };
                ops.push((uri, key, value));
            }
            Record::Commit { ts, ops }
        }
        RecordKind::Create => Record::Create {
            ts,
            id: r.varint()?,
            uri: r.string()?,
            config: r.string()?,
        },
        RecordKind::Drop => Record::Drop {
            ts,
            uri: r.string()?,
        },
    };
    if !r.is_empty() {
        return Err(EngineError::Corruption("trailing bytes in journal record".into()));
    }
    Ok(record)
}

/// Replays one journal record on top of a checkpoint taken at `checkpoint_ts`.
pub(crate) fn apply_record(
    record: Record,
    checkpoint_ts: u64,
    tables: &mut HashMap<String, Arc<Table>>,
    next_table_id: &mut u64,
    clock: &mut u64,
) {
    let ts = record.ts();
    if ts <= checkpoint_ts {
        return;
    }
    match record {
        Record::Commit { ops, .. } => {
            let mut grouped: HashMap<String, PendingWrites> = HashMap::new();
            for (uri, key, value) in ops {
                grouped.entry(uri).or_default().insert(key, value);
            }
            for (uri, writes) in grouped {
                match tables.get(&uri) {
                    Some(table) => table.install(writes, ts, ts),
                    None => debug!(uri = %uri, ts, "engine.journal.skip_missing_table"),
                }
            }
        }
        Record::Create { id, uri, config, .. } => {
            *next_table_id = (*next_table_id).max(id + 1);
            tables
                .entry(uri.clone())
                .or_insert_with(|| Arc::new(Table::new(id, uri, config)));
        }
        Record::Drop { uri, .. } => {
            tables.remove(&uri);
        }
    }
    *clock = (*clock).max(ts);
}

/// Append-only commit journal.
pub(crate) struct Journal {
    file: File,
    path: PathBuf,
    len: u64,
}

impl Journal {
    /// Opens the journal in `dir`, returning the intact records it holds.
    pub(crate) fn open(dir: &Path) -> EngineResult<(Self, Vec<Record>)> {
        let path = dir.join(JOURNAL_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut records = Vec::new();
        let mut off = 0usize;
        while off < bytes.len() {
            match read_frame(&bytes[off..]) {
                Some((kind, payload)) => match decode_record(kind, payload) {
                    Ok(record) => {
                        records.push(record);
                        off += FRAME_HEADER_LEN + payload.len();
                    }
                    Err(err) => {
                        warn!(offset = off, error = %err, "engine.journal.bad_record");
                        break;
                    }
                },
                None => break,
            }
        }
        if off < bytes.len() {
            warn!(
                path = %path.display(),
                offset = off,
                discarded = bytes.len() - off,
                "engine.journal.torn_tail"
            );
            file.set_len(off as u64)?;
            file.sync_all()?;
        }
        Ok((
            Self {
                file,
                path,
                len: off as u64,
            },
            records,
        ))
    }

    pub(crate) fn append(&mut self, kind: RecordKind, payload: &[u8]) -> EngineResult<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| EngineError::Invalid("journal record larger than 4GiB".into()))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.push(kind as u8);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&frame_crc32(kind as u8, payload).to_be_bytes());
        frame.extend_from_slice(payload);
        self.file.write_all(&frame)?;
        self.len += frame.len() as u64;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> EngineResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Empties the journal once a checkpoint covers everything in it.
    pub(crate) fn truncate(&mut self) -> EngineResult<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.len = 0;
        debug!(path = %self.path.display(), "engine.journal.archived");
        Ok(())
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }
}

fn read_frame(src: &[u8]) -> Option<(RecordKind, &[u8])> {
    let header = src.get(..FRAME_HEADER_LEN)?;
    let kind = RecordKind::from_u8(header[0])?;
    let len = u32::from_be_bytes(header[1..5].try_into().ok()?) as usize;
    let crc = u32::from_be_bytes(header[5..9].try_into().ok()?);
    let payload = src.get(FRAME_HEADER_LEN..FRAME_HEADER_LEN.checked_add(len)?)?;
    if frame_crc32(kind as u8, payload) != crc {
        return None;
    }
    Some((kind, payload))
}

/// Tables restored from a checkpoint file.
pub(crate) struct CheckpointImage {
    pub(crate) ts: u64,
    pub(crate) next_table_id: u64,
    pub(crate) tables: Vec<Table>,
}

pub(crate) fn write_checkpoint(
    dir: &Path,
    ts: u64,
    next_table_id: u64,
    tables: &[Arc<Table>],
) -> EngineResult<()> {
    let mut payload = Vec::new();
    var::encode_u64(ts, &mut payload);
    var::encode_u64(next_table_id, &mut payload);
    var::encode_u64(tables.len() as u64, &mut payload);
    for table in tables {
        let rows = table.rows_at(ts);
        var::encode_u64(table.id, &mut payload);
        var::encode_bytes(table.uri.as_bytes(), &mut payload);
        var::encode_bytes(table.config.as_bytes(), &mut payload);
        var::encode_u64(rows.len() as u64, &mut payload);
        for (key, value) in &rows {
            var::encode_bytes(key, &mut payload);
            var::encode_bytes(value, &mut payload);
        }
    }

    let mut image = Vec::with_capacity(payload.len() + 14);
    image.extend_from_slice(&CHECKPOINT_MAGIC);
    image.extend_from_slice(&CHECKPOINT_VERSION.to_be_bytes());
    image.extend_from_slice(&payload);
    image.extend_from_slice(&frame_crc32(CHECKPOINT_KIND, &payload).to_be_bytes());

    let tmp = dir.join(CHECKPOINT_TMP);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&image)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(CHECKPOINT_FILE))?;
    if let Ok(handle) = File::open(dir) {
        // Directory fsync is unsupported on some platforms.
        let _ = handle.sync_all();
    }
    Ok(())
}

pub(crate) fn read_checkpoint(dir: &Path) -> EngineResult<Option<CheckpointImage>> {
    let path = dir.join(CHECKPOINT_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let header_len = CHECKPOINT_MAGIC.len() + 2;
    if bytes.len() < header_len + 4 || bytes[..8] != CHECKPOINT_MAGIC {
        return Err(EngineError::Corruption(format!(
            "{} is not a checkpoint file",
            path.display()
        )));
    }
    let version = u16::from_be_bytes([bytes[8], bytes[9]]);
    if version != CHECKPOINT_VERSION {
        return Err(EngineError::Corruption(format!(
            "checkpoint version {version} unsupported"
        )));
    }
    let (body, footer) = bytes.split_at(bytes.len() - 4);
    let payload = &body[header_len..];
    let stored = u32::from_be_bytes([footer[0], footer[1], footer[2], footer[3]]);
    if frame_crc32(CHECKPOINT_KIND, payload) != stored {
        return Err(EngineError::Corruption(format!(
            "checkpoint crc mismatch in {}",
            path.display()
        )));
    }

    let mut r = Reader::new(payload);
    let ts = r.varint()?;
    let next_table_id = r.varint()?;
    let count = r.varint()? as usize;
    let mut tables = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let id = r.varint()?;
        let uri = r.string()?;
        let config = r.string()?;
        let rows_len = r.varint()? as usize;
        let mut rows = Vec::with_capacity(rows_len.min(1 << 16));
        for _ in 0..rows_len {
            let key = r.bytes()?.to_vec();
            let value = r.bytes()?.to_vec();
            rows.push((key, value));
        }
        tables.push(Table::with_rows(id, uri, config, rows, ts));
    }
    debug!(ts, tables = tables.len(), "engine.checkpoint.loaded");
    Ok(Some(CheckpointImage {
        ts,
        next_table_id,
        tables,
    }))
}
