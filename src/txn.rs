//! Transaction layer
//!
//! Isolates readers and writers with snapshot semantics and
//! deterministic conflict reporting, without ever blocking a reader.
//! Every key any active or not-yet-flushed transaction has touched
//! owns a node in the per-database transaction tree; the node chains
//! the pending operations on that key ordered by lsn. Operations live
//! in an arena and are addressed by stable indices, so transactions,
//! nodes and cursors never hold pointers into each other.

use std::collections::{BTreeMap, VecDeque};

use fnv::FnvHashMap;
use log::trace;

use crate::common::types::{InsertFlags, KeyType, Lsn, TxnId};
use crate::errors::{HamError, Result};

/// Stable index of an operation in the arena.
pub(crate) type OpIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum OpKind {
    Insert,
    InsertOverwrite,
    InsertDuplicate,
    Erase,
    /// A spent operation; skipped by every walk.
    Nop,
}

impl OpKind {
    fn is_insert(self) -> bool {
        matches!(
            self,
            OpKind::Insert | OpKind::InsertOverwrite | OpKind::InsertDuplicate
        )
    }
}

/// One pending operation on one key.
#[derive(Debug, Clone)]
pub(crate) struct TxnOperation {
    pub(crate) kind: OpKind,
    pub(crate) flags: InsertFlags,
    pub(crate) lsn: Lsn,
    pub(crate) txn_id: TxnId,
    pub(crate) db: u16,
    /// the user key, as passed in
    pub(crate) key: Vec<u8>,
    /// the key under the tree ordering; filled in by append_op
    pub(crate) norm_key: Vec<u8>,
    /// the referenced record (insert kinds)
    pub(crate) record: Vec<u8>,
    /// duplicate position an erase or overwrite refers to, if any
    pub(crate) dup_ref: Option<usize>,
}

#[derive(Debug, Default)]
struct OpArena {
    slots: Vec<Option<TxnOperation>>,
    free: Vec<OpIndex>,
}

impl OpArena {
    fn alloc(&mut self, op: TxnOperation) -> OpIndex {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(op);
                idx
            }
            None => {
                self.slots.push(Some(op));
                self.slots.len() - 1
            }
        }
    }

    fn get(&self, idx: OpIndex) -> &TxnOperation {
        self.slots[idx].as_ref().expect("op index out of date")
    }

    fn get_mut(&mut self, idx: OpIndex) -> &mut TxnOperation {
        self.slots[idx].as_mut().expect("op index out of date")
    }

    fn release(&mut self, idx: OpIndex) {
        debug_assert!(self.slots[idx].is_some());
        self.slots[idx] = None;
        self.free.push(idx);
    }
}

/// Per-key entry of a transaction tree: the pending operations on
/// that key, ordered by lsn.
#[derive(Debug, Default)]
pub(crate) struct OpNode {
    ops: Vec<OpIndex>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum TxnState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug)]
pub(crate) struct TxnRecord {
    pub(crate) id: TxnId,
    pub(crate) state: TxnState,
    pub(crate) begin_lsn: Lsn,
    pub(crate) commit_lsn: Option<Lsn>,
    pub(crate) read_only: bool,
    /// created implicitly around a single top-level call
    pub(crate) temporary: bool,
    /// op indices in creation order
    pub(crate) ops: Vec<OpIndex>,
    pub(crate) cursor_refcount: u32,
}

/// Visibility of a key under a transaction tree walk.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum KeyPresence {
    /// No pending operation decides; consult the B-tree.
    Unknown,
    /// The newest visible operation inserts this record.
    Present(OpIndex),
    /// The newest visible operation erases the key.
    Erased,
}

/// Encodes a key so that plain byte ordering of the transaction tree
/// matches the database comparator.
pub(crate) fn normalize_key(key_type: KeyType, key: &[u8]) -> Vec<u8> {
    match key_type {
        KeyType::Binary => key.to_vec(),
        KeyType::U32 => {
            let mut bytes = [0u8; 4];
            bytes[..key.len().min(4)].copy_from_slice(&key[..key.len().min(4)]);
            u32::from_le_bytes(bytes).to_be_bytes().to_vec()
        }
        KeyType::U64 => {
            let mut bytes = [0u8; 8];
            bytes[..key.len().min(8)].copy_from_slice(&key[..key.len().min(8)]);
            u64::from_le_bytes(bytes).to_be_bytes().to_vec()
        }
    }
}

/// Inverse of [`normalize_key`]: recovers the user form of a tree key.
pub(crate) fn denormalize_key(key_type: KeyType, norm: &[u8]) -> Vec<u8> {
    match key_type {
        KeyType::Binary => norm.to_vec(),
        KeyType::U32 => {
            let mut bytes = [0u8; 4];
            bytes[..norm.len().min(4)].copy_from_slice(&norm[..norm.len().min(4)]);
            u32::from_be_bytes(bytes).to_le_bytes().to_vec()
        }
        KeyType::U64 => {
            let mut bytes = [0u8; 8];
            bytes[..norm.len().min(8)].copy_from_slice(&norm[..norm.len().min(8)]);
            u64::from_be_bytes(bytes).to_le_bytes().to_vec()
        }
    }
}

///
/// Environment-wide transaction bookkeeping: the id-ordered list of
/// transactions, the operation arena and the per-database trees.
///
#[derive(Debug, Default)]
pub(crate) struct TxnManager {
    /// transaction ids, oldest first
    order: VecDeque<TxnId>,
    records: FnvHashMap<TxnId, TxnRecord>,
    arena: OpArena,
    /// db name -> transaction tree (normalized key -> op node)
    trees: FnvHashMap<u16, BTreeMap<Vec<u8>, OpNode>>,
    next_txn_id: TxnId,
    next_lsn: Lsn,
}

impl TxnManager {
    pub(crate) fn new() -> TxnManager {
        TxnManager {
            next_txn_id: 1,
            next_lsn: 1,
            ..Default::default()
        }
    }

    /// Hands out the next log sequence number.
    pub(crate) fn next_lsn(&mut self) -> Lsn {
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        lsn
    }

    /// Fast-forwards the lsn clock past a recovered journal.
    pub(crate) fn observe_lsn(&mut self, lsn: Lsn) {
        if lsn >= self.next_lsn {
            self.next_lsn = lsn + 1;
        }
    }

    pub(crate) fn begin(&mut self, read_only: bool, temporary: bool) -> TxnId {
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        let begin_lsn = self.next_lsn();

        self.order.push_back(id);
        self.records.insert(
            id,
            TxnRecord {
                id,
                state: TxnState::Active,
                begin_lsn,
                commit_lsn: None,
                read_only,
                temporary,
                ops: Vec::new(),
                cursor_refcount: 0,
            },
        );
        trace!("txn {} begins at lsn {}", id, begin_lsn);
        id
    }

    pub(crate) fn record(&self, id: TxnId) -> Result<&TxnRecord> {
        self.records.get(&id).ok_or(HamError::InvParameter(
            "transaction is not alive in this environment",
        ))
    }

    fn record_mut(&mut self, id: TxnId) -> Result<&mut TxnRecord> {
        self.records.get_mut(&id).ok_or(HamError::InvParameter(
            "transaction is not alive in this environment",
        ))
    }

    pub(crate) fn is_active(&self, id: TxnId) -> bool {
        self.records
            .get(&id)
            .map(|r| r.state == TxnState::Active)
            .unwrap_or(false)
    }

    /// Every still-active transaction id, oldest first.
    pub(crate) fn active_txns(&self) -> Vec<TxnId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.is_active(*id))
            .collect()
    }

    pub(crate) fn op(&self, idx: OpIndex) -> &TxnOperation {
        self.arena.get(idx)
    }

    /// Turns an operation into a nop; walks skip it from now on.
    pub(crate) fn nullify_op(&mut self, idx: OpIndex) {
        let op = self.arena.get_mut(idx);
        op.kind = OpKind::Nop;
        op.record.clear();
    }

    /// True when the database has any pending tree entries.
    pub(crate) fn has_tree_entries(&self, db: u16) -> bool {
        self.trees.get(&db).map(|t| !t.is_empty()).unwrap_or(false)
    }

    pub(crate) fn add_cursor_ref(&mut self, id: TxnId) {
        if let Some(r) = self.records.get_mut(&id) {
            r.cursor_refcount += 1;
        }
    }

    pub(crate) fn release_cursor_ref(&mut self, id: TxnId) {
        if let Some(r) = self.records.get_mut(&id) {
            r.cursor_refcount = r.cursor_refcount.saturating_sub(1);
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Write path
    ///////////////////////////////////////////////////////////////////////////

    /// Decides whether `txn_id` may write `key`, walking the pending
    /// operations newest to oldest. Returns the visible presence of
    /// the key so the caller can enforce duplicate/missing-key rules
    /// against it (falling through to the B-tree on `Unknown`).
    pub(crate) fn check_write_conflict(
        &self,
        db: u16,
        norm_key: &[u8],
        txn_id: TxnId,
    ) -> Result<KeyPresence> {
        let Some(node) = self.trees.get(&db).and_then(|t| t.get(norm_key)) else {
            return Ok(KeyPresence::Unknown);
        };

        for &idx in node.ops.iter().rev() {
            let op = self.arena.get(idx);
            if op.kind == OpKind::Nop {
                continue;
            }
            let state = self.records.get(&op.txn_id).map(|r| r.state);
            match state {
                Some(TxnState::Active) if op.txn_id == txn_id => {
                    // our own latest op decides
                    return Ok(if op.kind.is_insert() {
                        KeyPresence::Present(idx)
                    } else {
                        KeyPresence::Erased
                    });
                }
                Some(TxnState::Active) => return Err(HamError::TxnConflict),
                Some(TxnState::Committed) => {
                    return Ok(if op.kind.is_insert() {
                        KeyPresence::Present(idx)
                    } else {
                        KeyPresence::Erased
                    });
                }
                Some(TxnState::Aborted) | None => continue,
            }
        }
        Ok(KeyPresence::Unknown)
    }

    /// Appends an operation to its key node and its transaction,
    /// stamping a fresh lsn.
    pub(crate) fn append_op(
        &mut self,
        db: u16,
        key_type: KeyType,
        mut op: TxnOperation,
    ) -> Result<(OpIndex, Lsn)> {
        let record = self.record(op.txn_id)?;
        if record.state != TxnState::Active {
            return Err(HamError::InvParameter("transaction is closed"));
        }
        if record.read_only {
            return Err(HamError::AccessDenied);
        }

        let lsn = self.next_lsn();
        op.lsn = lsn;
        op.db = db;
        op.norm_key = normalize_key(key_type, &op.key);
        let norm = op.norm_key.clone();
        let txn_id = op.txn_id;
        let idx = self.arena.alloc(op);

        self.trees
            .entry(db)
            .or_default()
            .entry(norm)
            .or_default()
            .ops
            .push(idx);
        self.record_mut(txn_id)?.ops.push(idx);
        Ok((idx, lsn))
    }

    ///////////////////////////////////////////////////////////////////////////
    // Read path
    ///////////////////////////////////////////////////////////////////////////

    /// True when `op` is visible to a reader inside `viewer` (or an
    /// autocommit reader when `viewer` is `None`).
    fn op_visible(&self, op: &TxnOperation, viewer: Option<TxnId>) -> bool {
        if Some(op.txn_id) == viewer {
            return true;
        }
        match self.records.get(&op.txn_id) {
            Some(r) if r.state == TxnState::Committed => match viewer {
                None => true,
                Some(viewer_id) => match self.records.get(&viewer_id) {
                    Some(v) => r.commit_lsn.unwrap_or(Lsn::MAX) < v.begin_lsn,
                    None => true,
                },
            },
            _ => false,
        }
    }

    /// Presence of `key` under the snapshot of `viewer`.
    pub(crate) fn key_presence(
        &self,
        db: u16,
        norm_key: &[u8],
        viewer: Option<TxnId>,
    ) -> KeyPresence {
        let Some(node) = self.trees.get(&db).and_then(|t| t.get(norm_key)) else {
            return KeyPresence::Unknown;
        };
        self.node_presence(node, viewer)
    }

    fn node_presence(&self, node: &OpNode, viewer: Option<TxnId>) -> KeyPresence {
        for &idx in node.ops.iter().rev() {
            let op = self.arena.get(idx);
            if op.kind == OpKind::Nop || !self.op_visible(op, viewer) {
                continue;
            }
            return if op.kind.is_insert() {
                KeyPresence::Present(idx)
            } else {
                KeyPresence::Erased
            };
        }
        KeyPresence::Unknown
    }

    /// The visible insert operations on `key`, oldest first, plus
    /// whether a visible erase or overwrite shadows whatever the
    /// B-tree stores under the key. Used for the duplicate walk of
    /// cursors.
    pub(crate) fn visible_inserts(
        &self,
        db: u16,
        norm_key: &[u8],
        viewer: Option<TxnId>,
    ) -> (Vec<OpIndex>, bool) {
        let Some(node) = self.trees.get(&db).and_then(|t| t.get(norm_key)) else {
            return (Vec::new(), false);
        };

        // the newest erase/overwrite visible resets the older list
        let mut inserts = Vec::new();
        let mut shadowed = false;
        for &idx in node.ops.iter() {
            let op = self.arena.get(idx);
            if op.kind == OpKind::Nop || !self.op_visible(op, viewer) {
                continue;
            }
            match op.kind {
                OpKind::Erase => {
                    inserts.clear();
                    shadowed = true;
                }
                OpKind::InsertOverwrite => {
                    inserts.clear();
                    inserts.push(idx);
                    shadowed = true;
                }
                OpKind::Insert | OpKind::InsertDuplicate => inserts.push(idx),
                OpKind::Nop => {}
            }
        }
        (inserts, shadowed)
    }

    /// The nearest tree key strictly greater (`forward`) or smaller
    /// than `norm_key` that carries any visible operation; erased
    /// keys are reported too so the caller can skip the matching
    /// B-tree entries.
    pub(crate) fn neighbour_key(
        &self,
        db: u16,
        norm_key: &[u8],
        forward: bool,
        viewer: Option<TxnId>,
    ) -> Option<(Vec<u8>, KeyPresence)> {
        let tree = self.trees.get(&db)?;
        let mut iter: Box<dyn Iterator<Item = (&Vec<u8>, &OpNode)>> = if forward {
            Box::new(
                tree.range::<Vec<u8>, _>((
                    std::ops::Bound::Excluded(norm_key.to_vec()),
                    std::ops::Bound::Unbounded,
                )),
            )
        } else {
            Box::new(
                tree.range::<Vec<u8>, _>((
                    std::ops::Bound::Unbounded,
                    std::ops::Bound::Excluded(norm_key.to_vec()),
                ))
                .rev(),
            )
        };

        iter.find_map(|(key, node)| {
            let presence = self.node_presence(node, viewer);
            (presence != KeyPresence::Unknown).then(|| (key.clone(), presence))
        })
    }

    /// The smallest (or largest) tree key with any visible operation.
    pub(crate) fn edge_key(
        &self,
        db: u16,
        last: bool,
        viewer: Option<TxnId>,
    ) -> Option<(Vec<u8>, KeyPresence)> {
        let tree = self.trees.get(&db)?;
        let mut iter: Box<dyn Iterator<Item = (&Vec<u8>, &OpNode)>> = if last {
            Box::new(tree.iter().rev())
        } else {
            Box::new(tree.iter())
        };
        iter.find_map(|(key, node)| {
            let presence = self.node_presence(node, viewer);
            (presence != KeyPresence::Unknown).then(|| (key.clone(), presence))
        })
    }

    ///////////////////////////////////////////////////////////////////////////
    // Commit / abort / flush
    ///////////////////////////////////////////////////////////////////////////

    /// Marks the transaction committed. The caller then drains
    /// [`TxnManager::next_flushable`] to apply the leading committed
    /// transactions to the B-tree.
    pub(crate) fn commit(&mut self, id: TxnId) -> Result<Lsn> {
        let lsn = self.next_lsn();
        let record = self.record_mut(id)?;
        if record.state != TxnState::Active {
            return Err(HamError::InvParameter("transaction is closed"));
        }
        record.state = TxnState::Committed;
        record.commit_lsn = Some(lsn);
        trace!("txn {} committed at lsn {}", id, lsn);
        Ok(lsn)
    }

    /// Marks the transaction aborted and drops its operations.
    pub(crate) fn abort(&mut self, id: TxnId) -> Result<()> {
        let record = self.record_mut(id)?;
        if record.state != TxnState::Active {
            return Err(HamError::InvParameter("transaction is closed"));
        }
        record.state = TxnState::Aborted;
        trace!("txn {} aborted", id);
        self.sweep();
        Ok(())
    }

    /// The leading run of committed transactions, ready to be applied
    /// to the B-tree. Aborted transactions inside the run are swept
    /// away; the run ends at the oldest still-active transaction.
    /// Their operations must be applied in lsn order across the whole
    /// batch so that later writes win on overlapping keys.
    pub(crate) fn flushable_batch(&mut self) -> Vec<(TxnId, Vec<OpIndex>)> {
        self.sweep();

        let mut batch = Vec::new();
        let mut i = 0;
        while i < self.order.len() {
            let id = self.order[i];
            match self.records.get(&id).map(|r| r.state) {
                Some(TxnState::Aborted) => self.retire(id),
                Some(TxnState::Committed) => {
                    let ops = self.records[&id].ops.clone();
                    batch.push((id, ops));
                    i += 1;
                }
                _ => break,
            }
        }
        batch
    }

    /// Unlinks a flushed transaction: its ops leave their nodes and
    /// the arena, empty nodes disappear.
    pub(crate) fn retire(&mut self, id: TxnId) {
        let Some(record) = self.records.remove(&id) else {
            return;
        };
        self.order.retain(|&t| t != id);
        for idx in record.ops {
            let (db, norm) = {
                let op = self.arena.get(idx);
                (op.db, op.norm_key.clone())
            };
            if let Some(tree) = self.trees.get_mut(&db) {
                if let Some(node) = tree.get_mut(&norm) {
                    node.ops.retain(|&o| o != idx);
                    if node.ops.is_empty() {
                        tree.remove(&norm);
                    }
                }
            }
            self.arena.release(idx);
        }
    }

    /// Removes aborted transactions from the head of the list.
    fn sweep(&mut self) {
        while let Some(&id) = self.order.front() {
            let state = self.records.get(&id).map(|r| r.state);
            match state {
                Some(TxnState::Aborted) => self.retire(id),
                _ => break,
            }
        }
        // aborted transactions behind the head retire as well once no
        // cursor holds on to them
        let aborted: Vec<TxnId> = self
            .records
            .values()
            .filter(|r| r.state == TxnState::Aborted && r.cursor_refcount == 0)
            .map(|r| r.id)
            .collect();
        for id in aborted {
            self.retire(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_op(txn_id: TxnId, key: &[u8], record: &[u8]) -> TxnOperation {
        TxnOperation {
            kind: OpKind::Insert,
            flags: InsertFlags::empty(),
            lsn: 0,
            txn_id,
            db: 1,
            key: key.to_vec(),
            norm_key: Vec::new(),
            record: record.to_vec(),
            dup_ref: None,
        }
    }

    fn erase_op(txn_id: TxnId, key: &[u8]) -> TxnOperation {
        TxnOperation {
            kind: OpKind::Erase,
            flags: InsertFlags::empty(),
            lsn: 0,
            txn_id,
            db: 1,
            key: key.to_vec(),
            norm_key: Vec::new(),
            record: Vec::new(),
            dup_ref: None,
        }
    }

    #[test]
    fn test_ops_are_lsn_ordered_within_node() {
        let mut mgr = TxnManager::new();
        let t1 = mgr.begin(false, false);

        mgr.append_op(1, KeyType::Binary, insert_op(t1, b"k", b"a")).unwrap();
        mgr.append_op(1, KeyType::Binary, insert_op(t1, b"k", b"b")).unwrap();
        mgr.append_op(1, KeyType::Binary, insert_op(t1, b"k", b"c")).unwrap();

        let node = mgr.trees.get(&1).unwrap().get(b"k".as_slice()).unwrap();
        let lsns: Vec<Lsn> = node.ops.iter().map(|&i| mgr.op(i).lsn).collect();
        assert!(lsns.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_write_write_conflict() {
        let mut mgr = TxnManager::new();
        let t1 = mgr.begin(false, false);
        let t2 = mgr.begin(false, false);

        mgr.append_op(1, KeyType::Binary, insert_op(t1, b"k", b"v")).unwrap();

        // t2 collides with t1's uncommitted insert
        assert_eq!(
            mgr.check_write_conflict(1, b"k", t2),
            Err(HamError::TxnConflict)
        );
        // t1 sees its own op
        assert!(matches!(
            mgr.check_write_conflict(1, b"k", t1),
            Ok(KeyPresence::Present(_))
        ));

        // after commit the op no longer conflicts
        mgr.commit(t1).unwrap();
        assert!(matches!(
            mgr.check_write_conflict(1, b"k", t2),
            Ok(KeyPresence::Present(_))
        ));
    }

    #[test]
    fn test_snapshot_visibility() {
        let mut mgr = TxnManager::new();
        let t1 = mgr.begin(false, false);
        mgr.append_op(1, KeyType::Binary, insert_op(t1, b"k", b"v")).unwrap();

        let t2 = mgr.begin(false, false);
        // uncommitted op of another txn is invisible
        assert_eq!(mgr.key_presence(1, b"k", Some(t2)), KeyPresence::Unknown);
        // an autocommit reader does not see it either
        assert_eq!(mgr.key_presence(1, b"k", None), KeyPresence::Unknown);

        mgr.commit(t1).unwrap();
        // t2 began before the commit: still invisible in the tree
        assert_eq!(mgr.key_presence(1, b"k", Some(t2)), KeyPresence::Unknown);
        // a fresh reader sees it
        assert!(matches!(
            mgr.key_presence(1, b"k", None),
            KeyPresence::Present(_)
        ));
        let t3 = mgr.begin(false, false);
        assert!(matches!(
            mgr.key_presence(1, b"k", Some(t3)),
            KeyPresence::Present(_)
        ));
    }

    #[test]
    fn test_erase_shadows_key() {
        let mut mgr = TxnManager::new();
        let t1 = mgr.begin(false, false);
        mgr.append_op(1, KeyType::Binary, insert_op(t1, b"k", b"v")).unwrap();
        mgr.append_op(1, KeyType::Binary, erase_op(t1, b"k")).unwrap();

        assert_eq!(mgr.key_presence(1, b"k", Some(t1)), KeyPresence::Erased);
    }

    #[test]
    fn test_abort_drops_ops() {
        let mut mgr = TxnManager::new();
        let t1 = mgr.begin(false, false);
        mgr.append_op(1, KeyType::Binary, insert_op(t1, b"k", b"v")).unwrap();
        mgr.abort(t1).unwrap();

        assert_eq!(mgr.key_presence(1, b"k", None), KeyPresence::Unknown);
        assert!(mgr.trees.get(&1).map(|t| t.is_empty()).unwrap_or(true));
    }

    #[test]
    fn test_flushable_batch_waits_for_the_oldest() {
        let mut mgr = TxnManager::new();
        let t1 = mgr.begin(false, false);
        let t2 = mgr.begin(false, false);
        mgr.append_op(1, KeyType::Binary, insert_op(t1, b"a", b"1")).unwrap();
        mgr.append_op(1, KeyType::Binary, insert_op(t2, b"b", b"2")).unwrap();

        // t2 commits first but t1 still blocks the flush
        mgr.commit(t2).unwrap();
        assert!(mgr.flushable_batch().is_empty());

        // once t1 commits, both flush together, oldest first
        mgr.commit(t1).unwrap();
        let batch = mgr.flushable_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].0, t1);
        assert_eq!(batch[1].0, t2);

        // op lsns order the merged application across the batch
        let mut lsns: Vec<Lsn> = batch
            .iter()
            .flat_map(|(_, ops)| ops.iter().map(|&i| mgr.op(i).lsn))
            .collect();
        lsns.sort();
        assert!(lsns.windows(2).all(|w| w[0] < w[1]));

        for (id, _) in batch {
            mgr.retire(id);
        }
        assert!(mgr.flushable_batch().is_empty());
    }

    #[test]
    fn test_read_only_txn_cannot_write() {
        let mut mgr = TxnManager::new();
        let t1 = mgr.begin(true, false);
        assert_eq!(
            mgr.append_op(1, KeyType::Binary, insert_op(t1, b"k", b"v")),
            Err(HamError::AccessDenied)
        );
    }

    #[test]
    fn test_neighbour_walk() {
        let mut mgr = TxnManager::new();
        let t1 = mgr.begin(false, false);
        mgr.append_op(1, KeyType::Binary, insert_op(t1, b"b", b"1")).unwrap();
        mgr.append_op(1, KeyType::Binary, insert_op(t1, b"d", b"2")).unwrap();

        let (key, presence) = mgr.neighbour_key(1, b"a", true, Some(t1)).unwrap();
        assert_eq!(key, b"b");
        assert!(matches!(presence, KeyPresence::Present(_)));

        let (key, _) = mgr.neighbour_key(1, b"c", true, Some(t1)).unwrap();
        assert_eq!(key, b"d");
        assert_eq!(mgr.neighbour_key(1, b"d", true, Some(t1)), None);

        let (key, _) = mgr.neighbour_key(1, b"c", false, Some(t1)).unwrap();
        assert_eq!(key, b"b");

        let (key, _) = mgr.edge_key(1, false, Some(t1)).unwrap();
        assert_eq!(key, b"b");
        let (key, _) = mgr.edge_key(1, true, Some(t1)).unwrap();
        assert_eq!(key, b"d");
    }
}
