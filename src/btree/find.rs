//! B-tree descent and approximate match.

use std::cmp::Ordering;

use crate::common::types::{ApproxMode, PageAddr};
use crate::errors::{HamError, Result};
use crate::page_manager::PageManager;

use super::BtreeIndex;
use super::node::Node;

/// A match delivered by [`BtreeIndex::find`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Match {
    pub(crate) leaf: PageAddr,
    pub(crate) slot: usize,
    /// set when the slot holds a neighbour instead of the requested key
    pub(crate) is_approximate: bool,
}

impl BtreeIndex {
    /// Binary search for `key` inside the node at `addr`. `Ok(i)` is
    /// an exact hit, `Err(i)` the insertion point.
    pub(crate) fn search_node(
        &mut self,
        pm: &mut PageManager,
        addr: PageAddr,
        key: &[u8],
    ) -> Result<std::result::Result<usize, usize>> {
        let mut page = self.fetch_node_page(pm, addr)?;
        let node = Node::attach(&mut page);

        let mut lo = 0usize;
        let mut hi = node.count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let slot = node.slot(mid);
            match self.compare_to_slot(pm, key, &slot)? {
                Ordering::Equal => return Ok(Ok(mid)),
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
            }
        }
        Ok(Err(lo))
    }

    /// Child index to follow for `key`: the first slot whose
    /// separator is not smaller, or the rightmost slot when the key
    /// exceeds every separator.
    pub(crate) fn child_index(
        &mut self,
        pm: &mut PageManager,
        addr: PageAddr,
        key: &[u8],
    ) -> Result<usize> {
        let count = {
            let mut page = self.fetch_node_page(pm, addr)?;
            Node::attach(&mut page).count()
        };
        if count == 0 {
            return Err(HamError::IntegrityViolated);
        }
        Ok(match self.search_node(pm, addr, key)? {
            Ok(i) => i,
            Err(i) => i.min(count - 1),
        })
    }

    /// Walks from the root to the leaf responsible for `key`,
    /// recording the descent as `(node address, child index)` pairs.
    pub(crate) fn descend(
        &mut self,
        pm: &mut PageManager,
        key: &[u8],
    ) -> Result<(PageAddr, Vec<(PageAddr, usize)>)> {
        let mut addr = self.root();
        let mut path = Vec::new();

        loop {
            let is_leaf = {
                let mut page = self.fetch_node_page(pm, addr)?;
                Node::attach(&mut page).is_leaf()
            };
            if is_leaf {
                return Ok((addr, path));
            }

            let idx = self.child_index(pm, addr, key)?;
            let child = {
                let mut page = self.fetch_node_page(pm, addr)?;
                Node::attach(&mut page).slot(idx).rid
            };
            path.push((addr, idx));
            addr = child;
        }
    }

    /// Locates `key` with the given approximate-match mode. Returns
    /// `None` when nothing satisfies the request.
    pub(crate) fn find(
        &mut self,
        pm: &mut PageManager,
        key: &[u8],
        approx: ApproxMode,
    ) -> Result<Option<Match>> {
        let (leaf, _) = self.descend(pm, key)?;
        let count = {
            let mut page = self.fetch_node_page(pm, leaf)?;
            Node::attach(&mut page).count()
        };

        match self.search_node(pm, leaf, key)? {
            Ok(i) => {
                if approx.accepts_exact() {
                    return Ok(Some(Match {
                        leaf,
                        slot: i,
                        is_approximate: false,
                    }));
                }
                // lt/gt on an exact hit step once in scan direction
                let neighbour = if approx.is_backward() {
                    self.previous_slot(pm, leaf, i)?
                } else {
                    self.next_slot(pm, leaf, i)?
                };
                Ok(neighbour.map(|(leaf, slot)| Match {
                    leaf,
                    slot,
                    is_approximate: true,
                }))
            }
            Err(ins) => {
                if approx == ApproxMode::Exact {
                    return Ok(None);
                }
                let neighbour = if approx.is_backward() {
                    if ins > 0 {
                        Some((leaf, ins - 1))
                    } else {
                        self.previous_slot(pm, leaf, 0)?
                    }
                } else if ins < count {
                    Some((leaf, ins))
                } else {
                    self.next_slot(pm, leaf, count.saturating_sub(1))?
                };
                Ok(neighbour.map(|(leaf, slot)| Match {
                    leaf,
                    slot,
                    is_approximate: true,
                }))
            }
        }
    }

    /// Key and record at a leaf position.
    pub(crate) fn entry_at(
        &mut self,
        pm: &mut PageManager,
        leaf: PageAddr,
        slot: usize,
    ) -> Result<(Vec<u8>, super::node::Slot)> {
        let mut page = self.fetch_node_page(pm, leaf)?;
        let node = Node::attach(&mut page);
        if slot >= node.count() {
            return Err(HamError::CursorIsNil);
        }
        let s = node.slot(slot);
        drop(page);
        let key = self.slot_key(pm, &s)?;
        Ok((key, s))
    }
}
