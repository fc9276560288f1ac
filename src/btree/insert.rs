//! B-tree insert with pre-splitting.
//!
//! The descent splits every full node on the way down, so the target
//! leaf always has room for the new entry and no split ever has to
//! propagate back up. The split pivot sits at the median; when the
//! new key is the highest of a full leaf (an append workload), the
//! pivot is biased so sequential insertion leaves pages ~90% full.

use std::cmp::Ordering;

use log::trace;

use crate::blob::{DupEntry, DupTable};
use crate::common::page::PageType;
use crate::common::types::{InsertFlags, PageAddr};
use crate::errors::{HamError, Result};
use crate::page_manager::PageManager;

use super::node::{KEY_FLAG_DUP_TABLE, KEY_FLAG_EXTENDED, Node};
use super::{BtreeIndex, RecordRef};

/// Where a new duplicate lands inside the entry list of its key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum DupPosition {
    First,
    Last,
    Before(usize),
    After(usize),
}

impl DupPosition {
    /// Entry index a new duplicate lands at, given the current count.
    pub(crate) fn index(self, count: usize) -> usize {
        match self {
            DupPosition::First => 0,
            DupPosition::Last => count,
            DupPosition::Before(i) => i.min(count),
            DupPosition::After(i) => (i + 1).min(count),
        }
    }
}

/// Position of a freshly inserted entry, used to couple cursors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct InsertResult {
    pub(crate) leaf: PageAddr,
    pub(crate) slot: usize,
    pub(crate) dup_index: usize,
}

impl BtreeIndex {
    /// Inserts `key` -> `record`. Flags decide the behaviour on an
    /// existing key: overwrite, append a duplicate, or fail.
    pub(crate) fn insert(
        &mut self,
        pm: &mut PageManager,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        dup_pos: DupPosition,
    ) -> Result<InsertResult> {
        let capacity = Node::capacity(pm.page_size());

        let root_full = {
            let mut page = self.fetch_node_page(pm, self.root())?;
            Node::attach(&mut page).count() >= capacity
        };
        if root_full {
            self.split_root(pm, key)?;
        }

        let mut addr = self.root();
        loop {
            let is_leaf = {
                let mut page = self.fetch_node_page(pm, addr)?;
                Node::attach(&mut page).is_leaf()
            };
            if is_leaf {
                return self.leaf_insert(pm, addr, key, record, flags, dup_pos);
            }

            self.bump_fence(pm, addr, key)?;
            let mut idx = self.child_index(pm, addr, key)?;
            let child = {
                let mut page = self.fetch_node_page(pm, addr)?;
                Node::attach(&mut page).slot(idx).rid
            };

            let child_full = {
                let mut page = self.fetch_node_page(pm, child)?;
                Node::attach(&mut page).count() >= capacity
            };
            if child_full {
                self.split_child(pm, addr, idx, key)?;
                idx = self.child_index(pm, addr, key)?;
            }

            addr = {
                let mut page = self.fetch_node_page(pm, addr)?;
                Node::attach(&mut page).slot(idx).rid
            };
        }
    }

    /// Raises the rightmost separator when `key` exceeds it, so the
    /// subtree bound of the descent stays valid.
    fn bump_fence(&mut self, pm: &mut PageManager, addr: PageAddr, key: &[u8]) -> Result<()> {
        let (count, last) = {
            let mut page = self.fetch_node_page(pm, addr)?;
            let node = Node::attach(&mut page);
            (node.count(), node.slot(node.count() - 1))
        };

        if self.compare_to_slot(pm, key, &last)? != Ordering::Greater {
            return Ok(());
        }

        self.release_slot_key(pm, &last)?;
        let sep = self.make_slot(pm, key, last.rid, 0, 0)?;
        let mut page = self.fetch_node_page(pm, addr)?;
        let mut node = Node::attach(&mut page);
        node.set_slot(count - 1, &sep);
        pm.store_page(addr, page);
        Ok(())
    }

    /// Splits the child at `parent[idx]`. Afterwards the parent holds
    /// `(left max, left)` at `idx` and the old separator pointing at
    /// the new right node at `idx + 1`.
    fn split_child(
        &mut self,
        pm: &mut PageManager,
        parent: PageAddr,
        idx: usize,
        insert_key: &[u8],
    ) -> Result<()> {
        let child = {
            let mut page = self.fetch_node_page(pm, parent)?;
            Node::attach(&mut page).slot(idx).rid
        };

        let right = self.split_node(pm, child, insert_key)?;

        let left_max = self.node_max_key(pm, child)?;
        let left_sep = self.make_slot(pm, &left_max, child, 0, 0)?;

        let mut page = self.fetch_node_page(pm, parent)?;
        let mut node = Node::attach(&mut page);
        let mut old_sep = node.slot(idx);
        old_sep.rid = right;
        node.set_slot(idx, &old_sep);
        node.insert_slot(idx, &left_sep);
        pm.store_page(parent, page);
        Ok(())
    }

    /// Splits a full root and grows the tree height by one.
    fn split_root(&mut self, pm: &mut PageManager, insert_key: &[u8]) -> Result<()> {
        let old_root = self.root();
        let right = self.split_node(pm, old_root, insert_key)?;

        let left_max = self.node_max_key(pm, old_root)?;
        let right_max = self.node_max_key(pm, right)?;
        let left_sep = self.make_slot(pm, &left_max, old_root, 0, 0)?;
        let right_sep = self.make_slot(pm, &right_max, right, 0, 0)?;

        let mut root_page = pm.alloc_page(PageType::BtreeRoot)?;
        let new_root = root_page.header().address();
        let mut node = Node::init(&mut root_page, false);
        node.insert_slot(0, &left_sep);
        node.insert_slot(1, &right_sep);
        pm.store_page(new_root, root_page);

        // the old root becomes an ordinary node
        let mut page = self.fetch_node_page(pm, old_root)?;
        page.header_mut().set_typ(PageType::Btree);
        pm.store_page(old_root, page);

        trace!("root split, new root {}", new_root);
        self.set_root(pm, new_root)
    }

    /// Moves the upper slots of the node at `addr` into a fresh right
    /// sibling and returns its address.
    fn split_node(
        &mut self,
        pm: &mut PageManager,
        addr: PageAddr,
        insert_key: &[u8],
    ) -> Result<PageAddr> {
        let (count, is_leaf, old_right, last) = {
            let mut page = self.fetch_node_page(pm, addr)?;
            let node = Node::attach(&mut page);
            (
                node.count(),
                node.is_leaf(),
                node.ptr_right(),
                node.slot(node.count() - 1),
            )
        };

        // append bias: sequential loads keep the left page ~90% full
        let appending =
            is_leaf && self.compare_to_slot(pm, insert_key, &last)? == Ordering::Greater;
        let pivot = if appending { count - 2 } else { count / 2 };

        let mut right_page = pm.alloc_page(PageType::Btree)?;
        let right_addr = right_page.header().address();
        let mut right = Node::init(&mut right_page, is_leaf);

        let mut page = self.fetch_node_page(pm, addr)?;
        let mut node = Node::attach(&mut page);
        node.move_tail_to(pivot, &mut right);

        node.set_ptr_right(right_addr);
        right.set_ptr_left(addr);
        right.set_ptr_right(old_right);
        pm.store_page(right_addr, right_page);
        pm.store_page(addr, page);

        if old_right != 0 {
            let mut page = self.fetch_node_page(pm, old_right)?;
            Node::attach(&mut page).set_ptr_left(right_addr);
            pm.store_page(old_right, page);
        }

        trace!("split node {} at {} of {}", addr, pivot, count);
        Ok(right_addr)
    }

    fn leaf_insert(
        &mut self,
        pm: &mut PageManager,
        leaf: PageAddr,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        dup_pos: DupPosition,
    ) -> Result<InsertResult> {
        match self.search_node(pm, leaf, key)? {
            Ok(i) => {
                if flags.contains(InsertFlags::OVERWRITE) {
                    self.overwrite_slot(pm, leaf, i, record)?;
                    Ok(InsertResult {
                        leaf,
                        slot: i,
                        dup_index: 0,
                    })
                } else if flags.contains(InsertFlags::DUPLICATE) {
                    if !self.duplicates_enabled() {
                        return Err(HamError::InvParameter(
                            "database was created without duplicate support",
                        ));
                    }
                    let dup_index = self.append_duplicate(pm, leaf, i, record, dup_pos)?;
                    pm.header_mut().descriptor_mut(self.descriptor).record_count += 1;
                    Ok(InsertResult {
                        leaf,
                        slot: i,
                        dup_index,
                    })
                } else {
                    Err(HamError::DuplicateKey)
                }
            }
            Err(ins) => {
                let record_ref = RecordRef::for_record(pm, record)?;
                let slot = self.make_record_slot(pm, key, &record_ref)?;

                let mut page = self.fetch_node_page(pm, leaf)?;
                let mut node = Node::attach(&mut page);
                debug_assert!(node.count() < Node::capacity(pm.page_size()));
                node.insert_slot(ins, &slot);
                pm.store_page(leaf, page);

                pm.header_mut().descriptor_mut(self.descriptor).record_count += 1;
                Ok(InsertResult {
                    leaf,
                    slot: ins,
                    dup_index: 0,
                })
            }
        }
    }

    /// Replaces the record of an existing key, releasing whatever the
    /// slot pointed at before (including a whole duplicate table).
    fn overwrite_slot(
        &mut self,
        pm: &mut PageManager,
        leaf: PageAddr,
        idx: usize,
        record: &[u8],
    ) -> Result<()> {
        let mut slot = {
            let mut page = self.fetch_node_page(pm, leaf)?;
            Node::attach(&mut page).slot(idx)
        };

        Self::release_slot_record(pm, &slot)?;
        let record_ref = RecordRef::for_record(pm, record)?;
        let (rid, rflags, inline_size) = record_ref.encode();
        slot.key_flags = (slot.key_flags & KEY_FLAG_EXTENDED) | rflags;
        slot.inline_size = inline_size;
        slot.rid = rid;

        let mut page = self.fetch_node_page(pm, leaf)?;
        Node::attach(&mut page).set_slot(idx, &slot);
        pm.store_page(leaf, page);
        Ok(())
    }

    /// Overwrites one duplicate of an existing key in place.
    pub(crate) fn overwrite_duplicate(
        &mut self,
        pm: &mut PageManager,
        key: &[u8],
        dup_index: usize,
        record: &[u8],
    ) -> Result<()> {
        let (leaf, _) = self.descend(pm, key)?;
        let idx = match self.search_node(pm, leaf, key)? {
            Ok(i) => i,
            Err(_) => return Err(HamError::KeyNotFound),
        };
        let mut slot = {
            let mut page = self.fetch_node_page(pm, leaf)?;
            Node::attach(&mut page).slot(idx)
        };

        if !slot.has_dup_table() {
            if dup_index != 0 {
                return Err(HamError::KeyNotFound);
            }
            return self.overwrite_slot(pm, leaf, idx, record);
        }

        let mut table = DupTable::read(pm, slot.rid)?;
        if dup_index >= table.count() {
            return Err(HamError::KeyNotFound);
        }
        table.erase(dup_index).release(pm)?;
        table.insert(dup_index, DupEntry::for_record(pm, record)?);
        slot.rid = table.write(pm, slot.rid)?;

        let mut page = self.fetch_node_page(pm, leaf)?;
        Node::attach(&mut page).set_slot(idx, &slot);
        pm.store_page(leaf, page);
        Ok(())
    }

    /// Adds a duplicate record to an existing key, converting the
    /// slot to a duplicate table on the second record.
    fn append_duplicate(
        &mut self,
        pm: &mut PageManager,
        leaf: PageAddr,
        idx: usize,
        record: &[u8],
        dup_pos: DupPosition,
    ) -> Result<usize> {
        let mut slot = {
            let mut page = self.fetch_node_page(pm, leaf)?;
            Node::attach(&mut page).slot(idx)
        };
        let entry = DupEntry::for_record(pm, record)?;

        let dup_index = if slot.has_dup_table() {
            let mut table = DupTable::read(pm, slot.rid)?;
            let pos = dup_pos.index(table.count());
            table.insert(pos, entry);
            slot.rid = table.write(pm, slot.rid)?;
            pos
        } else {
            let existing = match RecordRef::from_slot(&slot) {
                RecordRef::Inline(data) => DupEntry::Inline(data),
                RecordRef::Blob(id) => DupEntry::Blob(id),
                RecordRef::DupTable(_) => unreachable!(),
            };
            let pos = dup_pos.index(1);
            let (first, second) = if pos == 0 {
                (entry, existing)
            } else {
                (existing, entry)
            };
            slot.rid = DupTable::create(pm, first, second)?;
            slot.key_flags = (slot.key_flags & KEY_FLAG_EXTENDED) | KEY_FLAG_DUP_TABLE;
            slot.inline_size = 0;
            pos.min(1)
        };

        let mut page = self.fetch_node_page(pm, leaf)?;
        Node::attach(&mut page).set_slot(idx, &slot);
        pm.store_page(leaf, page);
        Ok(dup_index)
    }
}
