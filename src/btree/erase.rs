//! B-tree erase with rebalancing.
//!
//! Removing a slot may leave its leaf under-occupied; the node then
//! borrows a slot from the right sibling, then from the left, and
//! merges with one of them when neither can spare. A merge that
//! empties an internal root collapses the tree height by one.

use log::trace;

use crate::blob::{BlobManager, DupTable};
use crate::common::page::PageType;
use crate::common::types::PageAddr;
use crate::errors::{HamError, Result};
use crate::page_manager::PageManager;

use super::node::{KEY_FLAG_EXTENDED, Node};
use super::{BtreeIndex, RecordRef};

/// What an erase call removes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum EraseMode {
    /// The key with every duplicate it carries.
    WholeKey,
    /// One duplicate, identified by its position within the key.
    Duplicate(usize),
}

impl BtreeIndex {
    /// Erases `key` (or one of its duplicates).
    pub(crate) fn erase(
        &mut self,
        pm: &mut PageManager,
        key: &[u8],
        mode: EraseMode,
    ) -> Result<()> {
        let (leaf, path) = self.descend(pm, key)?;
        let idx = match self.search_node(pm, leaf, key)? {
            Ok(i) => i,
            Err(_) => return Err(HamError::KeyNotFound),
        };
        self.erase_at(pm, leaf, idx, path, mode)
    }

    /// Erases the entry at a known leaf position.
    pub(crate) fn erase_at(
        &mut self,
        pm: &mut PageManager,
        leaf: PageAddr,
        idx: usize,
        path: Vec<(PageAddr, usize)>,
        mode: EraseMode,
    ) -> Result<()> {
        let mut slot = {
            let mut page = self.fetch_node_page(pm, leaf)?;
            let node = Node::attach(&mut page);
            if idx >= node.count() {
                return Err(HamError::KeyNotFound);
            }
            node.slot(idx)
        };

        if let EraseMode::Duplicate(di) = mode {
            if slot.has_dup_table() {
                let mut table = DupTable::read(pm, slot.rid)?;
                if di >= table.count() {
                    return Err(HamError::KeyNotFound);
                }
                let entry = table.erase(di);
                entry.release(pm)?;

                if table.count() == 1 {
                    // collapse the table back to a single slot value
                    let remaining = table.entries.pop().unwrap();
                    BlobManager::free(pm, slot.rid)?;
                    let record_ref = match remaining {
                        crate::blob::DupEntry::Inline(data) => RecordRef::Inline(data),
                        crate::blob::DupEntry::Blob(id) => RecordRef::Blob(id),
                    };
                    let (rid, rflags, inline_size) = record_ref.encode();
                    slot.key_flags = (slot.key_flags & KEY_FLAG_EXTENDED) | rflags;
                    slot.inline_size = inline_size;
                    slot.rid = rid;
                } else {
                    slot.rid = table.write(pm, slot.rid)?;
                }

                let mut page = self.fetch_node_page(pm, leaf)?;
                Node::attach(&mut page).set_slot(idx, &slot);
                pm.store_page(leaf, page);
                pm.header_mut().descriptor_mut(self.descriptor).record_count -= 1;
                return Ok(());
            }
            if di > 0 {
                return Err(HamError::KeyNotFound);
            }
            // a key without a table has exactly one duplicate
        }

        let removed = if slot.has_dup_table() {
            DupTable::read(pm, slot.rid)?.count() as u64
        } else {
            1
        };
        self.release_slot_key(pm, &slot)?;
        Self::release_slot_record(pm, &slot)?;

        let mut page = self.fetch_node_page(pm, leaf)?;
        Node::attach(&mut page).remove_slot(idx);
        pm.store_page(leaf, page);
        pm.header_mut().descriptor_mut(self.descriptor).record_count -= removed;

        self.rebalance(pm, leaf, path)
    }

    /// Restores the fill invariant from `addr` upwards.
    fn rebalance(
        &mut self,
        pm: &mut PageManager,
        addr: PageAddr,
        mut path: Vec<(PageAddr, usize)>,
    ) -> Result<()> {
        let capacity = Node::capacity(pm.page_size());
        let min = capacity.div_ceil(3);
        let mut addr = addr;

        loop {
            if addr == self.root() {
                // an internal root with one child shrinks the height
                let (is_leaf, count, only_child, sep) = {
                    let mut page = self.fetch_node_page(pm, addr)?;
                    let node = Node::attach(&mut page);
                    let sep = if node.count() > 0 { Some(node.slot(0)) } else { None };
                    (node.is_leaf(), node.count(), sep.as_ref().map(|s| s.rid), sep)
                };
                if !is_leaf && count == 1 {
                    let child = only_child.unwrap();
                    self.release_slot_key(pm, &sep.unwrap())?;
                    pm.free_page(addr)?;

                    let mut page = self.fetch_node_page(pm, child)?;
                    page.header_mut().set_typ(PageType::BtreeRoot);
                    pm.store_page(child, page);

                    trace!("root collapsed into {}", child);
                    self.set_root(pm, child)?;
                    addr = child;
                    continue;
                }
                return Ok(());
            }

            let count = {
                let mut page = self.fetch_node_page(pm, addr)?;
                Node::attach(&mut page).count()
            };
            if count >= min {
                return Ok(());
            }

            let (parent, pidx) = *path.last().expect("non-root node without a path");
            let parent_count = {
                let mut page = self.fetch_node_page(pm, parent)?;
                Node::attach(&mut page).count()
            };

            if pidx + 1 < parent_count && self.shift_from_right(pm, parent, pidx, min)? {
                return Ok(());
            }
            if pidx > 0 && self.shift_from_left(pm, parent, pidx, min)? {
                return Ok(());
            }

            debug_assert!(parent_count >= 2);
            if pidx > 0 {
                self.merge_into_left(pm, parent, pidx)?;
            } else {
                self.merge_right_into(pm, parent, pidx)?;
            }

            path.pop();
            addr = parent;
        }
    }

    /// Moves the first slot of the right sibling to the tail of the
    /// node at `parent[pidx]`. Fails (false) when the right sibling
    /// cannot spare a slot.
    fn shift_from_right(
        &mut self,
        pm: &mut PageManager,
        parent: PageAddr,
        pidx: usize,
        min: usize,
    ) -> Result<bool> {
        let (addr, right) = {
            let mut page = self.fetch_node_page(pm, parent)?;
            let node = Node::attach(&mut page);
            (node.slot(pidx).rid, node.slot(pidx + 1).rid)
        };

        let moved = {
            let mut page = self.fetch_node_page(pm, right)?;
            let mut node = Node::attach(&mut page);
            if node.count() <= min {
                return Ok(false);
            }
            let moved = node.slot(0);
            node.remove_slot(0);
            pm.store_page(right, page);
            moved
        };

        {
            let mut page = self.fetch_node_page(pm, addr)?;
            let mut node = Node::attach(&mut page);
            let count = node.count();
            node.insert_slot(count, &moved);
            pm.store_page(addr, page);
        }

        // the moved key is the node's new maximum
        let new_max = self.slot_key(pm, &moved)?;
        self.replace_separator(pm, parent, pidx, &new_max, addr)?;
        Ok(true)
    }

    /// Moves the last slot of the left sibling to the front of the
    /// node at `parent[pidx]`.
    fn shift_from_left(
        &mut self,
        pm: &mut PageManager,
        parent: PageAddr,
        pidx: usize,
        min: usize,
    ) -> Result<bool> {
        let (addr, left) = {
            let mut page = self.fetch_node_page(pm, parent)?;
            let node = Node::attach(&mut page);
            (node.slot(pidx).rid, node.slot(pidx - 1).rid)
        };

        let moved = {
            let mut page = self.fetch_node_page(pm, left)?;
            let mut node = Node::attach(&mut page);
            if node.count() <= min {
                return Ok(false);
            }
            let moved = node.slot(node.count() - 1);
            node.remove_slot(node.count() - 1);
            pm.store_page(left, page);
            moved
        };

        {
            let mut page = self.fetch_node_page(pm, addr)?;
            let mut node = Node::attach(&mut page);
            node.insert_slot(0, &moved);
            pm.store_page(addr, page);
        }

        let left_max = self.node_max_key(pm, left)?;
        self.replace_separator(pm, parent, pidx - 1, &left_max, left)?;
        Ok(true)
    }

    /// Merges the node at `parent[pidx]` into its left sibling and
    /// drops its parent slot.
    fn merge_into_left(&mut self, pm: &mut PageManager, parent: PageAddr, pidx: usize) -> Result<()> {
        let (addr, left) = {
            let mut page = self.fetch_node_page(pm, parent)?;
            let node = Node::attach(&mut page);
            (node.slot(pidx).rid, node.slot(pidx - 1).rid)
        };
        self.merge_nodes(pm, left, addr)?;

        // the left separator inherits the merged fence
        let mut page = self.fetch_node_page(pm, parent)?;
        let mut node = Node::attach(&mut page);
        let old_sep = node.slot(pidx - 1);
        let mut fence = node.slot(pidx);
        fence.rid = left;
        node.set_slot(pidx - 1, &fence);
        node.remove_slot(pidx);
        pm.store_page(parent, page);
        self.release_slot_key(pm, &old_sep)?;

        pm.free_page(addr)?;
        trace!("merged node {} into {}", addr, left);
        Ok(())
    }

    /// Merges the right sibling into the node at `parent[pidx]`.
    fn merge_right_into(&mut self, pm: &mut PageManager, parent: PageAddr, pidx: usize) -> Result<()> {
        let (addr, right) = {
            let mut page = self.fetch_node_page(pm, parent)?;
            let node = Node::attach(&mut page);
            (node.slot(pidx).rid, node.slot(pidx + 1).rid)
        };
        self.merge_nodes(pm, addr, right)?;

        let mut page = self.fetch_node_page(pm, parent)?;
        let mut node = Node::attach(&mut page);
        let old_sep = node.slot(pidx);
        let mut fence = node.slot(pidx + 1);
        fence.rid = addr;
        node.set_slot(pidx, &fence);
        node.remove_slot(pidx + 1);
        pm.store_page(parent, page);
        self.release_slot_key(pm, &old_sep)?;

        pm.free_page(right)?;
        trace!("merged node {} into {}", right, addr);
        Ok(())
    }

    /// Appends every slot of `right` to `left` and unlinks `right`
    /// from the sibling chain.
    fn merge_nodes(&mut self, pm: &mut PageManager, left: PageAddr, right: PageAddr) -> Result<()> {
        let mut left_page = self.fetch_node_page(pm, left)?;
        let mut right_page = self.fetch_node_page(pm, right)?;
        let mut left_node = Node::attach(&mut left_page);
        let mut right_node = Node::attach(&mut right_page);
        debug_assert!(
            left_node.count() + right_node.count() <= Node::capacity(pm.page_size())
        );

        right_node.move_tail_to(0, &mut left_node);
        let new_right = right_node.ptr_right();
        left_node.set_ptr_right(new_right);
        pm.store_page(left, left_page);

        if new_right != 0 {
            let mut page = self.fetch_node_page(pm, new_right)?;
            Node::attach(&mut page).set_ptr_left(left);
            pm.store_page(new_right, page);
        }
        Ok(())
    }

    /// Replaces the separator key at `parent[pidx]` with `key`,
    /// keeping `child` as its target.
    fn replace_separator(
        &mut self,
        pm: &mut PageManager,
        parent: PageAddr,
        pidx: usize,
        key: &[u8],
        child: PageAddr,
    ) -> Result<()> {
        let old = {
            let mut page = self.fetch_node_page(pm, parent)?;
            Node::attach(&mut page).slot(pidx)
        };
        self.release_slot_key(pm, &old)?;
        let sep = self.make_slot(pm, key, child, 0, 0)?;

        let mut page = self.fetch_node_page(pm, parent)?;
        Node::attach(&mut page).set_slot(pidx, &sep);
        pm.store_page(parent, page);
        Ok(())
    }
}
