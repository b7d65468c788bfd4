use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use super::session::WriteMode;
use super::table::Table;
use super::{EngineError, EngineResult, Session};

/// Ordered cursor over one table, bound to the session that opened it.
///
/// A positioned cursor belongs to the transaction it was positioned in. Once
/// that transaction ends, `next`/`prev` report [`EngineError::CursorReset`]
/// until the cursor is repositioned with a search or `reset`.
pub struct RawCursor {
    session: Session,
    table: Arc<Table>,
    position: Option<(Vec<u8>, Vec<u8>)>,
    generation: u64,
}

impl RawCursor {
    pub(crate) fn new(session: Session, table: Arc<Table>) -> Self {
        table.cursor_opened();
        Self {
            session,
            table,
            position: None,
            generation: 0,
        }
    }

    /// Table this cursor reads.
    pub fn uri(&self) -> &str {
        &self.table.uri
    }

    /// Engine id of the table, stable for the table's lifetime.
    pub fn table_id(&self) -> u64 {
        self.table.id
    }

    /// Session that opened this cursor.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Key at the current position.
    pub fn key(&self) -> Option<&[u8]> {
        self.position.as_ref().map(|(k, _)| k.as_slice())
    }

    /// Value at the current position.
    pub fn value(&self) -> Option<&[u8]> {
        self.position.as_ref().map(|(_, v)| v.as_slice())
    }

    /// Whether the cursor currently sits on an entry.
    pub fn is_positioned(&self) -> bool {
        self.position.is_some()
    }

    /// Clears the position.
    pub fn reset(&mut self) {
        self.position = None;
    }

    fn place(&mut self, entry: Option<(Vec<u8>, Vec<u8>)>) -> bool {
        self.generation = self.session.generation();
        self.position = entry;
        self.position.is_some()
    }

    fn check_position(&self) -> EngineResult<()> {
        if self.position.is_some() && self.generation != self.session.generation() {
            return Err(EngineError::CursorReset(self.table.uri.clone()));
        }
        Ok(())
    }

    /// Exact lookup. Positions the cursor on a hit and clears it on a miss.
    pub fn search(&mut self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        let found = self.session.read(&self.table, key);
        let entry = found.clone().map(|v| (key.to_vec(), v));
        self.place(entry);
        Ok(found)
    }

    /// Positions on `key`, else the next larger key, else the next smaller key.
    /// Returns how the landed key compares to `key`, or `None` when the table
    /// has no visible entries.
    pub fn search_near(&mut self, key: &[u8]) -> EngineResult<Option<Ordering>> {
        if let Some(value) = self.session.read(&self.table, key) {
            self.place(Some((key.to_vec(), value)));
            return Ok(Some(Ordering::Equal));
        }
        if let Some(entry) = self.session.step(&self.table, Bound::Excluded(key), true) {
            self.place(Some(entry));
            return Ok(Some(Ordering::Greater));
        }
        if let Some(entry) = self.session.step(&self.table, Bound::Excluded(key), false) {
            self.place(Some(entry));
            return Ok(Some(Ordering::Less));
        }
        self.place(None);
        Ok(None)
    }

    /// Advances; an unpositioned cursor moves to the first entry.
    /// Returns `false` at the end, leaving the cursor unpositioned.
    pub fn next(&mut self) -> EngineResult<bool> {
        self.advance(true)
    }

    /// Moves backwards; an unpositioned cursor moves to the last entry.
    pub fn prev(&mut self) -> EngineResult<bool> {
        self.advance(false)
    }

    fn advance(&mut self, forward: bool) -> EngineResult<bool> {
        self.check_position()?;
        let entry = match &self.position {
            Some((key, _)) => self
                .session
                .step(&self.table, Bound::Excluded(key.as_slice()), forward),
            None => self.session.step(&self.table, Bound::Unbounded, forward),
        };
        Ok(self.place(entry))
    }

    /// Inserts a new key; fails with [`EngineError::Exists`] if it is visible.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.write(key, Some(value.to_vec()), WriteMode::Insert)
    }

    /// Inserts or replaces.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.write(key, Some(value.to_vec()), WriteMode::Overwrite)
    }

    /// Replaces an existing key; fails with [`EngineError::NotFound`] if absent.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.write(key, Some(value.to_vec()), WriteMode::Update)
    }

    /// Removes an existing key; fails with [`EngineError::NotFound`] if absent.
    pub fn remove(&mut self, key: &[u8]) -> EngineResult<()> {
        self.write(key, None, WriteMode::Remove)
    }

    fn write(&mut self, key: &[u8], value: Option<Vec<u8>>, mode: WriteMode) -> EngineResult<()> {
        self.position = None;
        self.session.write(&self.table, key, value, mode)
    }
}

impl Drop for RawCursor {
    fn drop(&mut self) {
        self.table.cursor_closed();
    }
}

impl std::fmt::Debug for RawCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawCursor")
            .field("uri", &self.table.uri)
            .field("positioned", &self.position.is_some())
            .finish()
    }
}
