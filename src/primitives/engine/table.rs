use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::{EngineError, EngineResult};

/// One committed value of a key; `None` marks a delete.
#[derive(Clone, Debug)]
pub(crate) struct Version {
    pub(crate) ts: u64,
    pub(crate) value: Option<Vec<u8>>,
}

/// Versions of one key, oldest first.
pub(crate) type Chain = SmallVec<[Version; 2]>;

/// Uncommitted writes of one transaction against one table.
pub(crate) type PendingWrites = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

fn visible_at(chain: &Chain, ts: u64) -> Option<&[u8]> {
    chain
        .iter()
        .rev()
        .find(|v| v.ts <= ts)
        .and_then(|v| v.value.as_deref())
}

fn prune(chain: &mut Chain, oldest: u64) {
    if let Some(keep_from) = chain.iter().rposition(|v| v.ts <= oldest) {
        if keep_from > 0 {
            chain.drain(..keep_from);
        }
    }
}

fn fully_deleted(chain: &Chain, oldest: u64) -> bool {
    chain.len() == 1 && chain[0].value.is_none() && chain[0].ts <= oldest
}

/// Ordered multi-version table.
pub(crate) struct Table {
    pub(crate) id: u64,
    pub(crate) uri: String,
    pub(crate) config: String,
    rows: RwLock<BTreeMap<Vec<u8>, Chain>>,
    /// Keys claimed by in-flight transactions, with the claiming txn id.
    intents: Mutex<FxHashMap<Vec<u8>, u64>>,
    open_cursors: AtomicUsize,
}

impl Table {
    pub(crate) fn new(id: u64, uri: String, config: String) -> Self {
        Self {
            id,
            uri,
            config,
            rows: RwLock::new(BTreeMap::new()),
            intents: Mutex::new(FxHashMap::default()),
            open_cursors: AtomicUsize::new(0),
        }
    }

    /// Builds a table whose rows were all committed at `ts`.
    pub(crate) fn with_rows(
        id: u64,
        uri: String,
        config: String,
        rows: Vec<(Vec<u8>, Vec<u8>)>,
        ts: u64,
    ) -> Self {
        let table = Self::new(id, uri, config);
        {
            let mut map = table.rows.write();
            for (key, value) in rows {
                let mut chain = Chain::new();
                chain.push(Version {
                    ts,
                    value: Some(value),
                });
                map.insert(key, chain);
            }
        }
        table
    }

    pub(crate) fn cursor_opened(&self) {
        self.open_cursors.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn cursor_closed(&self) {
        self.open_cursors.fetch_sub(1, Ordering::AcqRel);
    }

    /// A table with open cursors or pending writes cannot be dropped.
    pub(crate) fn is_busy(&self) -> bool {
        self.open_cursors.load(Ordering::Acquire) > 0 || !self.intents.lock().is_empty()
    }

    /// Reads `key` as seen by a reader at `snapshot` with its own `pending` writes.
    /// `None` for the snapshot reads the newest committed state.
    pub(crate) fn get(
        &self,
        pending: Option<&PendingWrites>,
        snapshot: Option<u64>,
        clock: &std::sync::atomic::AtomicU64,
        key: &[u8],
    ) -> Option<Vec<u8>> {
        if let Some(own) = pending.and_then(|p| p.get(key)) {
            return own.clone();
        }
        let rows = self.rows.read();
        let ts = snapshot.unwrap_or_else(|| clock.load(Ordering::Acquire));
        rows.get(key)
            .and_then(|chain| visible_at(chain, ts))
            .map(<[u8]>::to_vec)
    }

    /// Finds the first visible entry strictly past `from` in the given direction.
    pub(crate) fn step(
        &self,
        pending: Option<&PendingWrites>,
        snapshot: Option<u64>,
        clock: &std::sync::atomic::AtomicU64,
        from: Bound<&[u8]>,
        forward: bool,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let rows = self.rows.read();
        let ts = snapshot.unwrap_or_else(|| clock.load(Ordering::Acquire));
        let empty = PendingWrites::new();
        let own = pending.unwrap_or(&empty);

        let mut committed: Box<dyn Iterator<Item = (&Vec<u8>, &Chain)>> = if forward {
            Box::new(rows.range::<[u8], _>((from, Bound::Unbounded)))
        } else {
            Box::new(rows.range::<[u8], _>((Bound::Unbounded, from)).rev())
        };
        let mut mine: Box<dyn Iterator<Item = (&Vec<u8>, &Option<Vec<u8>>)>> = if forward {
            Box::new(own.range::<[u8], _>((from, Bound::Unbounded)))
        } else {
            Box::new(own.range::<[u8], _>((Bound::Unbounded, from)).rev())
        };

        let mut c = committed.next();
        let mut m = mine.next();
        loop {
            match (c, m) {
                (None, None) => return None,
                (Some((key, chain)), None) => {
                    if let Some(value) = visible_at(chain, ts) {
                        return Some((key.clone(), value.to_vec()));
                    }
                    c = committed.next();
                }
                (None, Some((key, value))) => {
                    if let Some(value) = value {
                        return Some((key.clone(), value.clone()));
                    }
                    m = mine.next();
                }
                (Some((ckey, chain)), Some((mkey, value))) => {
                    let mut order = ckey.cmp(mkey);
                    if !forward {
                        order = order.reverse();
                    }
                    match order {
                        std::cmp::Ordering::Less => {
                            if let Some(v) = visible_at(chain, ts) {
                                return Some((ckey.clone(), v.to_vec()));
                            }
                            c = committed.next();
                        }
                        std::cmp::Ordering::Greater => {
                            if let Some(v) = value {
                                return Some((mkey.clone(), v.clone()));
                            }
                            m = mine.next();
                        }
                        std::cmp::Ordering::Equal => {
                            if let Some(v) = value {
                                return Some((mkey.clone(), v.clone()));
                            }
                            c = committed.next();
                            m = mine.next();
                        }
                    }
                }
            }
        }
    }

    /// Claims `key` for transaction `txn`, failing on a concurrent or newer writer.
    pub(crate) fn claim(&self, key: &[u8], txn: u64, snapshot: u64) -> EngineResult<()> {
        let mut intents = self.intents.lock();
        if let Some(&holder) = intents.get(key) {
            if holder != txn {
                return Err(EngineError::WriteConflict(self.uri.clone()));
            }
            return Ok(());
        }
        let newest = self
            .rows
            .read()
            .get(key)
            .and_then(|chain| chain.last().map(|v| v.ts));
        if newest.is_some_and(|ts| ts > snapshot) {
            return Err(EngineError::WriteConflict(self.uri.clone()));
        }
        intents.insert(key.to_vec(), txn);
        Ok(())
    }

    /// Releases every claim held by `txn` on `keys`.
    pub(crate) fn release<'a>(&self, keys: impl Iterator<Item = &'a Vec<u8>>, txn: u64) {
        let mut intents = self.intents.lock();
        for key in keys {
            if intents.get(key.as_slice()) == Some(&txn) {
                intents.remove(key.as_slice());
            }
        }
    }

    /// Installs committed writes at `ts`, pruning versions no reader at `oldest` needs.
    pub(crate) fn install(&self, writes: PendingWrites, ts: u64, oldest: u64) {
        let mut rows = self.rows.write();
        for (key, value) in writes {
            let chain = rows.entry(key.clone()).or_default();
            chain.push(Version { ts, value });
            prune(chain, oldest);
            if fully_deleted(chain, oldest) {
                rows.remove(&key);
            }
        }
    }

    /// Drops every version older than the oldest live snapshot.
    pub(crate) fn compact(&self, oldest: u64) -> usize {
        let mut rows = self.rows.write();
        let before: usize = rows.values().map(|c| c.len()).sum();
        rows.retain(|_, chain| {
            prune(chain, oldest);
            !fully_deleted(chain, oldest)
        });
        let after: usize = rows.values().map(|c| c.len()).sum();
        before - after
    }

    /// Live rows as of `ts`, in key order.
    pub(crate) fn rows_at(&self, ts: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.rows
            .read()
            .iter()
            .filter_map(|(k, chain)| visible_at(chain, ts).map(|v| (k.clone(), v.to_vec())))
            .collect()
    }

    /// Bytes held by the newest committed version of every key.
    pub(crate) fn data_size(&self) -> u64 {
        self.rows
            .read()
            .iter()
            .filter_map(|(k, chain)| {
                chain
                    .last()
                    .and_then(|v| v.value.as_ref())
                    .map(|v| (k.len() + v.len()) as u64)
            })
            .sum()
    }

    /// Checks version chains are non-empty and ordered by timestamp.
    pub(crate) fn verify(&self) -> EngineResult<()> {
        for (key, chain) in self.rows.read().iter() {
            if chain.is_empty() {
                return Err(EngineError::Corruption(format!(
                    "{}: empty version chain for key {}",
                    self.uri,
                    hex::encode(key)
                )));
            }
            if chain.windows(2).any(|w| w[0].ts >= w[1].ts) {
                return Err(EngineError::Corruption(format!(
                    "{}: versions out of order for key {}",
                    self.uri,
                    hex::encode(key)
                )));
            }
        }
        Ok(())
    }
}
