//! Database and cursor handles.
//!
//! A database is a named ordered multi-map inside an environment; a
//! cursor walks the merged view of its committed index and the
//! pending operations of its transaction. Both are thin handles: the
//! state lives in the environment and every call goes through its
//! lock.

use crate::common::types::{ApproxMode, CloseFlags, CursorMove, InsertFlags};
use crate::env::{DbParameters, Environment, Transaction};
use crate::errors::Result;

///
/// A named sub-store of an environment.
///
pub struct Database {
    env: Environment,
    name: u16,
}

impl Database {
    pub(crate) fn new(env: Environment, name: u16) -> Database {
        Database { env, name }
    }

    /// The numeric name of this database.
    pub fn name(&self) -> u16 {
        self.name
    }

    /// Inserts `key` -> `record`. Returns the key actually stored,
    /// which differs from `key` only for record-number databases.
    pub fn insert(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<Vec<u8>> {
        self.env
            .core()
            .write()
            .api_insert(self.name, txn.map(|t| t.id), key, record, flags)
    }

    /// Looks `key` up and returns its (first) record.
    pub fn find(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<Vec<u8>> {
        self.env
            .core()
            .write()
            .api_find(self.name, txn.map(|t| t.id), key, ApproxMode::Exact)
            .map(|(_, record)| record)
    }

    /// Looks `key` up under an approximate-match mode and returns the
    /// key that satisfied the request together with its record.
    pub fn find_approx(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        approx: ApproxMode,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        self.env
            .core()
            .write()
            .api_find(self.name, txn.map(|t| t.id), key, approx)
    }

    /// Erases `key` with every duplicate it carries.
    pub fn erase(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<()> {
        self.env
            .core()
            .write()
            .api_erase(self.name, txn.map(|t| t.id), key)
    }

    /// Reads the window `[offset, offset+size)` of the record of
    /// `key`. Not available when transactions are enabled.
    pub fn find_partial(&self, key: &[u8], offset: u64, size: u64) -> Result<Vec<u8>> {
        self.env
            .core()
            .write()
            .api_find_partial(self.name, key, offset, size)
    }

    /// Writes only the window `[offset, offset+data.len())` of the
    /// record of `key` and sets its size to `total_size`. Not
    /// available when transactions are enabled.
    pub fn insert_partial(
        &self,
        key: &[u8],
        data: &[u8],
        offset: u64,
        total_size: u64,
    ) -> Result<()> {
        self.env
            .core()
            .write()
            .api_insert_partial(self.name, key, data, offset, total_size)
    }

    /// Number of records visible to `txn`, duplicates included.
    pub fn key_count(&self, txn: Option<&Transaction>) -> Result<u64> {
        self.env
            .core()
            .write()
            .api_key_count(self.name, txn.map(|t| t.id))
    }

    /// Walks the whole index and verifies its invariants.
    pub fn check_integrity(&self) -> Result<()> {
        self.env.core().write().api_check_integrity(self.name)
    }

    pub fn get_parameters(&self) -> Result<DbParameters> {
        self.env.core().read().api_db_parameters(self.name)
    }

    /// Opens a cursor over this database.
    pub fn cursor(&self, txn: Option<&Transaction>) -> Result<Cursor> {
        let id = self
            .env
            .core()
            .write()
            .api_cursor_create(self.name, txn.map(|t| t.id))?;
        Ok(Cursor {
            env: self.env.clone(),
            id,
        })
    }

    /// Closes the database. Open cursors refuse the close unless
    /// `AUTO_CLEANUP` is set.
    pub fn close(self, flags: CloseFlags) -> Result<()> {
        self.env.core().write().api_close_db(self.name, flags)
    }
}

///
/// An iterator over the merged ordered view of one database.
///
pub struct Cursor {
    env: Environment,
    id: u64,
}

impl Cursor {
    /// Positions the cursor and returns the key/record pair it then
    /// points at. `Next`/`Previous` on a fresh cursor start at the
    /// matching end of the database.
    pub fn move_to(&self, step: CursorMove) -> Result<(Vec<u8>, Vec<u8>)> {
        self.env.core().write().api_cursor_move(self.id, step)
    }

    /// Positions the cursor at `key` (or a neighbour under an
    /// approximate-match mode) and returns the pair found.
    pub fn find(&self, key: &[u8], approx: ApproxMode) -> Result<(Vec<u8>, Vec<u8>)> {
        self.env.core().write().api_cursor_find(self.id, key, approx)
    }

    /// Inserts through the cursor and couples it to the new entry.
    pub fn insert(&self, key: &[u8], record: &[u8], flags: InsertFlags) -> Result<()> {
        self.env
            .core()
            .write()
            .api_cursor_insert(self.id, key, record, flags)
    }

    /// Replaces the record of the current duplicate.
    pub fn overwrite(&self, record: &[u8]) -> Result<()> {
        self.env.core().write().api_cursor_overwrite(self.id, record)
    }

    /// Erases the current duplicate (the whole key when it has only
    /// one). The cursor becomes nil.
    pub fn erase(&self) -> Result<()> {
        self.env.core().write().api_cursor_erase(self.id)
    }

    /// Number of duplicates of the current key.
    pub fn duplicate_count(&self) -> Result<usize> {
        self.env.core().write().api_cursor_dup_count(self.id)
    }

    /// Size of the current record without copying it out.
    pub fn record_size(&self) -> Result<u64> {
        self.env.core().write().api_cursor_record_size(self.id)
    }

    /// Clones the cursor including its position.
    pub fn try_clone(&self) -> Result<Cursor> {
        let id = self.env.core().write().api_cursor_clone(self.id)?;
        Ok(Cursor {
            env: self.env.clone(),
            id,
        })
    }

    /// Closes the cursor.
    pub fn close(self) {
        // Drop does the work
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.env.core().write().api_cursor_close(self.id);
    }
}
