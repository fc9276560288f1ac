//! Cursor coordination
//!
//! Presents a single ordered view merging the committed B-tree state
//! with the transaction tree. A cursor's logical position is its
//! current key plus the side that supplied it; stepping compares the
//! next candidate of both sides under the database comparator and
//! skips keys whose visible operation is an erase. Positions are held
//! as saved keys (the uncoupled form); the B-tree side recouples by
//! key search on use, so structural changes can never leave a cursor
//! pointing into a stale page.

use crate::btree::BtreeIndex;
use crate::btree::node::Slot;
use crate::blob::DupTable;
use crate::common::types::{ApproxMode, KeyType, TxnId};
use crate::errors::{HamError, Result};
use crate::page_manager::PageManager;
use crate::txn::{KeyPresence, OpIndex, TxnManager, denormalize_key, normalize_key};

/// Which side of the merged view supplied the current record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ActiveSide {
    Btree,
    Txn,
}

/// The logical position of a cursor.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Position {
    /// the current key, in user form
    pub(crate) key: Vec<u8>,
    pub(crate) side: ActiveSide,
    /// index into the combined duplicate list of the key
    pub(crate) dup_index: usize,
    /// set when the position came from an approximate match
    pub(crate) is_approximate: bool,
}

/// One cursor registered with the environment.
#[derive(Debug)]
pub(crate) struct CursorState {
    pub(crate) db: u16,
    pub(crate) txn: Option<TxnId>,
    pub(crate) pos: Option<Position>,
}

impl CursorState {
    pub(crate) fn new(db: u16, txn: Option<TxnId>) -> CursorState {
        CursorState { db, txn, pos: None }
    }

    pub(crate) fn position(&self) -> Result<&Position> {
        self.pos.as_ref().ok_or(HamError::CursorIsNil)
    }
}

/// Everything a cursor step needs to look at, borrowed for one call.
pub(crate) struct MergeView<'a> {
    pub(crate) pm: &'a mut PageManager,
    pub(crate) index: &'a mut BtreeIndex,
    pub(crate) txns: &'a TxnManager,
    pub(crate) db: u16,
    pub(crate) key_type: KeyType,
    pub(crate) viewer: Option<TxnId>,
}

/// The combined duplicate list of one key: pending insert operations
/// in insertion order, then the stored duplicates unless a pending
/// erase or overwrite shadows them.
#[derive(Debug, Default)]
pub(crate) struct DupView {
    pub(crate) ops: Vec<OpIndex>,
    pub(crate) stored: usize,
}

impl DupView {
    pub(crate) fn total(&self) -> usize {
        self.ops.len() + self.stored
    }
}

impl<'a> MergeView<'a> {
    fn norm(&self, key: &[u8]) -> Vec<u8> {
        normalize_key(self.key_type, key)
    }

    /// The raw key of the B-tree neighbour of `from` (or the edge
    /// entry when `from` is `None`).
    fn btree_candidate(
        &mut self,
        from: Option<&[u8]>,
        forward: bool,
        include_equal: bool,
    ) -> Result<Option<Vec<u8>>> {
        let found = match from {
            None => {
                let leaf = if forward {
                    self.index.first_leaf(self.pm)?
                } else {
                    self.index.last_leaf(self.pm)?
                };
                let mut page = self.index.fetch_node_page(self.pm, leaf)?;
                let node = crate::btree::node::Node::attach(&mut page);
                let count = node.count();
                drop(page);
                if count == 0 {
                    // an empty edge leaf still has filled siblings
                    if forward {
                        self.index.next_slot(self.pm, leaf, 0)?
                    } else {
                        self.index.previous_slot(self.pm, leaf, 0)?
                    }
                } else if forward {
                    Some((leaf, 0))
                } else {
                    Some((leaf, count - 1))
                }
            }
            Some(from) => {
                let mode = match (forward, include_equal) {
                    (true, true) => ApproxMode::Geq,
                    (true, false) => ApproxMode::Gt,
                    (false, true) => ApproxMode::Leq,
                    (false, false) => ApproxMode::Lt,
                };
                self.index
                    .find(self.pm, from, mode)?
                    .map(|m| (m.leaf, m.slot))
            }
        };

        match found {
            Some((leaf, slot)) => {
                let (key, _) = self.index.entry_at(self.pm, leaf, slot)?;
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    /// The transaction-tree neighbour of `from` with a decided
    /// presence.
    fn txn_candidate(
        &self,
        from: Option<&[u8]>,
        forward: bool,
        include_equal: bool,
    ) -> Option<(Vec<u8>, KeyPresence)> {
        match from {
            None => self
                .txns
                .edge_key(self.db, !forward, self.viewer)
                .map(|(norm, presence)| (denormalize_key(self.key_type, &norm), presence)),
            Some(from) => {
                let norm = self.norm(from);
                if include_equal {
                    let presence = self.txns.key_presence(self.db, &norm, self.viewer);
                    if presence != KeyPresence::Unknown {
                        return Some((from.to_vec(), presence));
                    }
                }
                self.txns
                    .neighbour_key(self.db, &norm, forward, self.viewer)
                    .map(|(norm, presence)| (denormalize_key(self.key_type, &norm), presence))
            }
        }
    }

    /// One step of the merged scan: the nearest key of either side in
    /// the given direction, with erased keys skipped.
    pub(crate) fn scan(
        &mut self,
        from: Option<&[u8]>,
        forward: bool,
        include_equal: bool,
    ) -> Result<Option<Position>> {
        let mut from = from.map(|k| k.to_vec());
        let mut include_equal = include_equal;

        loop {
            let btree = self.btree_candidate(from.as_deref(), forward, include_equal)?;
            let txn = self.txn_candidate(from.as_deref(), forward, include_equal);

            // pick the nearer candidate; on a tie the txn side wins so
            // a pending insert-before-first is visible
            let (key, from_txn, presence) = match (btree, txn) {
                (None, None) => return Ok(None),
                (Some(b), None) => (b, false, KeyPresence::Unknown),
                (None, Some((t, presence))) => (t, true, presence),
                (Some(b), Some((t, presence))) => {
                    let bn = self.norm(&b);
                    let tn = self.norm(&t);
                    let txn_wins = if forward { tn <= bn } else { tn >= bn };
                    if txn_wins {
                        (t, true, presence)
                    } else {
                        (b, false, KeyPresence::Unknown)
                    }
                }
            };

            // the visible operation on a key decides for both sides
            let presence = if from_txn {
                presence
            } else {
                self.txns
                    .key_presence(self.db, &self.norm(&key), self.viewer)
            };

            match presence {
                KeyPresence::Erased => {
                    // skip and continue the scan behind the erased key
                    from = Some(key);
                    include_equal = false;
                }
                KeyPresence::Present(_) => {
                    let dup_index = if forward {
                        0
                    } else {
                        self.dup_view(&key)?.total().saturating_sub(1)
                    };
                    return Ok(Some(Position {
                        key,
                        side: ActiveSide::Txn,
                        dup_index,
                        is_approximate: false,
                    }));
                }
                KeyPresence::Unknown => {
                    let dup_index = if forward {
                        0
                    } else {
                        self.dup_view(&key)?.total().saturating_sub(1)
                    };
                    return Ok(Some(Position {
                        key,
                        side: if from_txn {
                            ActiveSide::Txn
                        } else {
                            ActiveSide::Btree
                        },
                        dup_index,
                        is_approximate: false,
                    }));
                }
            }
        }
    }

    /// Positions at `key` under an approximate-match mode.
    pub(crate) fn find(&mut self, key: &[u8], approx: ApproxMode) -> Result<Option<Position>> {
        // exact phase
        if approx.accepts_exact() {
            match self.txns.key_presence(self.db, &self.norm(key), self.viewer) {
                KeyPresence::Present(_) => {
                    return Ok(Some(Position {
                        key: key.to_vec(),
                        side: ActiveSide::Txn,
                        dup_index: 0,
                        is_approximate: false,
                    }));
                }
                KeyPresence::Erased => {
                    if approx == ApproxMode::Exact {
                        return Ok(None);
                    }
                    // fall through to the neighbour scan
                }
                KeyPresence::Unknown => {
                    if self.index.find(self.pm, key, ApproxMode::Exact)?.is_some() {
                        return Ok(Some(Position {
                            key: key.to_vec(),
                            side: ActiveSide::Btree,
                            dup_index: 0,
                            is_approximate: false,
                        }));
                    }
                    if approx == ApproxMode::Exact {
                        return Ok(None);
                    }
                }
            }
        }

        // neighbour phase; an exact hit was either absent or excluded
        let forward = approx.is_forward();
        let position = self.scan(Some(key), forward, false)?;
        Ok(position.map(|mut p| {
            p.is_approximate = true;
            p
        }))
    }

    ///////////////////////////////////////////////////////////////////////////
    // Duplicates and record access
    ///////////////////////////////////////////////////////////////////////////

    /// The combined duplicate list of `key`.
    pub(crate) fn dup_view(&mut self, key: &[u8]) -> Result<DupView> {
        let norm = self.norm(key);
        let (ops, shadowed) = self.txns.visible_inserts(self.db, &norm, self.viewer);

        let mut stored = 0usize;
        if !shadowed {
            if let Some(found) = self.index.find(self.pm, key, ApproxMode::Exact)? {
                let (_, slot) = self.index.entry_at(self.pm, found.leaf, found.slot)?;
                stored = if slot.has_dup_table() {
                    DupTable::read(self.pm, slot.rid)?.count()
                } else {
                    1
                };
            }
        }
        Ok(DupView { ops, stored })
    }

    /// The stored slot of `key`, if the B-tree holds it.
    fn stored_slot(&mut self, key: &[u8]) -> Result<Option<Slot>> {
        match self.index.find(self.pm, key, ApproxMode::Exact)? {
            Some(found) => {
                let (_, slot) = self.index.entry_at(self.pm, found.leaf, found.slot)?;
                Ok(Some(slot))
            }
            None => Ok(None),
        }
    }

    /// Reads the record at a logical position.
    pub(crate) fn record_at(&mut self, pos: &Position) -> Result<Vec<u8>> {
        let view = self.dup_view(&pos.key)?;
        if pos.dup_index >= view.total() {
            return Err(HamError::KeyNotFound);
        }

        if pos.dup_index < view.ops.len() {
            return Ok(self.txns.op(view.ops[pos.dup_index]).record.clone());
        }

        let stored_index = pos.dup_index - view.ops.len();
        let slot = self
            .stored_slot(&pos.key)?
            .ok_or(HamError::KeyNotFound)?;
        if slot.has_dup_table() {
            let table = DupTable::read(self.pm, slot.rid)?;
            if stored_index >= table.count() {
                return Err(HamError::KeyNotFound);
            }
            table.entries[stored_index].record(self.pm)
        } else {
            if stored_index != 0 {
                return Err(HamError::KeyNotFound);
            }
            BtreeIndex::slot_record(self.pm, &slot)
        }
    }

    /// Size of the record at a logical position, without copying it.
    pub(crate) fn record_size_at(&mut self, pos: &Position) -> Result<u64> {
        let view = self.dup_view(&pos.key)?;
        if pos.dup_index >= view.total() {
            return Err(HamError::KeyNotFound);
        }

        if pos.dup_index < view.ops.len() {
            return Ok(self.txns.op(view.ops[pos.dup_index]).record.len() as u64);
        }

        let stored_index = pos.dup_index - view.ops.len();
        let slot = self
            .stored_slot(&pos.key)?
            .ok_or(HamError::KeyNotFound)?;
        if slot.has_dup_table() {
            let table = DupTable::read(self.pm, slot.rid)?;
            if stored_index >= table.count() {
                return Err(HamError::KeyNotFound);
            }
            table.entries[stored_index].record_size(self.pm)
        } else {
            match crate::btree::RecordRef::from_slot(&slot) {
                crate::btree::RecordRef::Inline(data) => Ok(data.len() as u64),
                crate::btree::RecordRef::Blob(id) => {
                    crate::blob::BlobManager::size(self.pm, id)
                }
                crate::btree::RecordRef::DupTable(_) => unreachable!(),
            }
        }
    }

    /// Steps within the duplicate list of the current key.
    pub(crate) fn move_duplicate(
        &mut self,
        pos: &Position,
        forward: bool,
    ) -> Result<Position> {
        let view = self.dup_view(&pos.key)?;
        let total = view.total();
        if total == 0 {
            return Err(HamError::KeyNotFound);
        }

        let next = if forward {
            if pos.dup_index + 1 >= total {
                return Err(HamError::KeyNotFound);
            }
            pos.dup_index + 1
        } else {
            if pos.dup_index == 0 {
                return Err(HamError::KeyNotFound);
            }
            pos.dup_index - 1
        };

        Ok(Position {
            key: pos.key.clone(),
            side: if next < view.ops.len() {
                ActiveSide::Txn
            } else {
                ActiveSide::Btree
            },
            dup_index: next,
            is_approximate: false,
        })
    }
}
