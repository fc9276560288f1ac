//! B-tree index
//!
//! An ordered multi-map from keys to records or blob ids with
//! logarithmic point lookup, range scans in both directions,
//! approximate match and auto-incrementing record numbers. Nodes are
//! laid out by [`node`]; the descent, split and merge live in
//! [`find`], [`insert`] and [`erase`].

pub(crate) mod erase;
pub(crate) mod extkeys;
pub(crate) mod find;
pub(crate) mod insert;
pub(crate) mod node;

use std::cmp::Ordering;

use log::warn;

use crate::blob::{BlobManager, DupTable};
use crate::common::page::{PageBuf, PageType};
use crate::common::types::{BlobId, KeyType, MAX_INLINE_RECORD_SIZE, PageAddr};
use crate::errors::{HamError, Result};
use crate::page_manager::PageManager;

use self::extkeys::ExtKeyCache;
use self::node::{
    KEY_FLAG_DUP_TABLE, KEY_FLAG_EXTENDED, KEY_FLAG_RECORD_INLINE, KEY_INLINE_CAPACITY,
    KEY_PREFIX_LEN, Node, Slot,
};

/// What a leaf slot points at.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RecordRef {
    /// Record of up to 8 bytes stored in the slot itself.
    Inline(Vec<u8>),
    /// Record stored as a blob.
    Blob(BlobId),
    /// Key carries multiple records in a duplicate table.
    DupTable(BlobId),
}

impl RecordRef {
    /// Builds the reference for `data`, spilling past the inline limit.
    pub(crate) fn for_record(pm: &mut PageManager, data: &[u8]) -> Result<RecordRef> {
        if data.len() <= MAX_INLINE_RECORD_SIZE {
            Ok(RecordRef::Inline(data.to_vec()))
        } else {
            Ok(RecordRef::Blob(BlobManager::alloc(pm, data)?))
        }
    }

    pub(crate) fn from_slot(slot: &Slot) -> RecordRef {
        if slot.has_dup_table() {
            RecordRef::DupTable(slot.rid)
        } else if slot.has_inline_record() {
            RecordRef::Inline(slot.inline_record())
        } else {
            RecordRef::Blob(slot.rid)
        }
    }

    /// (rid, key_flags bits, inline_size) of this reference.
    fn encode(&self) -> (u64, u8, u8) {
        match self {
            RecordRef::Inline(data) => {
                let mut bytes = [0u8; 8];
                bytes[..data.len()].copy_from_slice(data);
                (
                    u64::from_le_bytes(bytes),
                    KEY_FLAG_RECORD_INLINE,
                    data.len() as u8,
                )
            }
            RecordRef::Blob(id) => (*id, 0, 0),
            RecordRef::DupTable(id) => (*id, KEY_FLAG_DUP_TABLE, 0),
        }
    }
}

/// Key ordering capability of one database, passed into every B-tree
/// operation instead of living in ambient state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeyOps {
    key_type: KeyType,
}

impl KeyOps {
    pub(crate) fn new(key_type: KeyType) -> KeyOps {
        KeyOps { key_type }
    }

    /// Full compare over reconstructed keys.
    pub(crate) fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.key_type {
            KeyType::Binary => a.cmp(b),
            KeyType::U32 => le_u32(a).cmp(&le_u32(b)),
            KeyType::U64 => le_u64(a).cmp(&le_u64(b)),
        }
    }

    /// Prefix compare against the inline portion of a stored key.
    /// Returns `None` ("do not know") when the prefix cannot decide
    /// and the full key must be fetched.
    fn compare_prefix(&self, search: &[u8], prefix: &[u8], full_size: usize) -> Option<Ordering> {
        // fixed-size numeric keys are never extended
        if self.key_type != KeyType::Binary {
            return Some(self.compare(search, prefix));
        }
        if prefix.len() == full_size {
            return Some(search.cmp(prefix));
        }

        let head = search.len().min(prefix.len());
        match search[..head].cmp(&prefix[..head]) {
            Ordering::Equal if search.len() <= prefix.len() => {
                // the search key is a prefix of the stored key
                Some(if search.len() == full_size {
                    Ordering::Equal
                } else {
                    Ordering::Less
                })
            }
            Ordering::Equal => None,
            decided => Some(decided),
        }
    }
}

fn le_u32(buf: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes[..buf.len().min(4)].copy_from_slice(&buf[..buf.len().min(4)]);
    u32::from_le_bytes(bytes)
}

fn le_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..buf.len().min(8)].copy_from_slice(&buf[..buf.len().min(8)]);
    u64::from_le_bytes(bytes)
}

/// The index of one database.
pub(crate) struct BtreeIndex {
    /// descriptor slot in the environment header
    descriptor: usize,
    root: PageAddr,
    key_ops: KeyOps,
    duplicates: bool,
    extkeys: ExtKeyCache,
}

impl BtreeIndex {
    /// Creates the index of a fresh database with an empty root leaf.
    pub(crate) fn create(
        pm: &mut PageManager,
        descriptor: usize,
        key_type: KeyType,
        duplicates: bool,
    ) -> Result<BtreeIndex> {
        let mut page = pm.alloc_page(PageType::BtreeRoot)?;
        let root = page.header().address();
        Node::init(&mut page, true);
        pm.store_page(root, page);

        pm.header_mut().descriptor_mut(descriptor).root_page = root;
        pm.write_header()?;

        Ok(BtreeIndex {
            descriptor,
            root,
            key_ops: KeyOps::new(key_type),
            duplicates,
            extkeys: ExtKeyCache::new(),
        })
    }

    /// Attaches to the index of an existing database.
    pub(crate) fn open(
        descriptor: usize,
        root: PageAddr,
        key_type: KeyType,
        duplicates: bool,
    ) -> BtreeIndex {
        BtreeIndex {
            descriptor,
            root,
            key_ops: KeyOps::new(key_type),
            duplicates,
            extkeys: ExtKeyCache::new(),
        }
    }

    pub(crate) fn root(&self) -> PageAddr {
        self.root
    }

    pub(crate) fn duplicates_enabled(&self) -> bool {
        self.duplicates
    }

    fn set_root(&mut self, pm: &mut PageManager, root: PageAddr) -> Result<()> {
        self.root = root;
        pm.header_mut().descriptor_mut(self.descriptor).root_page = root;
        pm.write_header()
    }

    /// Fetches a node page and validates its type.
    pub(crate) fn fetch_node_page(&self, pm: &mut PageManager, addr: PageAddr) -> Result<PageBuf> {
        let page = pm.fetch_page(addr, false)?;
        match page.header().typ() {
            PageType::Btree | PageType::BtreeRoot => Ok(page),
            typ => {
                warn!("page {} is a {} page, expected a node", addr, typ);
                Err(HamError::IntegrityViolated)
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Key reconstruction and slot building
    ///////////////////////////////////////////////////////////////////////////

    /// Reconstructs the full key of a slot, fetching the extended
    /// blob on demand.
    pub(crate) fn slot_key(&mut self, pm: &mut PageManager, slot: &Slot) -> Result<Vec<u8>> {
        if !slot.is_extended() {
            return Ok(slot.key_prefix().to_vec());
        }

        let id = slot.extended_id();
        if let Some(key) = self.extkeys.get(id) {
            return Ok(key.to_vec());
        }
        let key = BlobManager::read(pm, id)?;
        if key.len() != slot.key_size as usize {
            return Err(HamError::IntegrityViolated);
        }
        self.extkeys.put(id, key.clone());
        Ok(key)
    }

    /// Compares `search` against the key stored in `slot`, using the
    /// inline prefix to skip the extended-key fetch when possible.
    pub(crate) fn compare_to_slot(
        &mut self,
        pm: &mut PageManager,
        search: &[u8],
        slot: &Slot,
    ) -> Result<Ordering> {
        if let Some(decided) =
            self.key_ops
                .compare_prefix(search, slot.key_prefix(), slot.key_size as usize)
        {
            return Ok(decided);
        }
        let stored = self.slot_key(pm, slot)?;
        Ok(self.key_ops.compare(search, &stored))
    }

    /// Builds a slot for `key`, spilling long keys into an extended
    /// blob.
    pub(crate) fn make_slot(
        &mut self,
        pm: &mut PageManager,
        key: &[u8],
        rid: u64,
        key_flags: u8,
        inline_size: u8,
    ) -> Result<Slot> {
        if key.len() <= KEY_INLINE_CAPACITY {
            return Ok(node::inline_slot(key, rid, key_flags, inline_size));
        }
        if key.len() > u16::MAX as usize {
            return Err(HamError::InvParameter("key exceeds 64k"));
        }

        let ext_id = BlobManager::alloc(pm, key)?;
        self.extkeys.put(ext_id, key.to_vec());

        let mut key_data = [0u8; KEY_INLINE_CAPACITY];
        key_data[..KEY_PREFIX_LEN].copy_from_slice(&key[..KEY_PREFIX_LEN]);
        key_data[KEY_PREFIX_LEN..].copy_from_slice(&ext_id.to_le_bytes());
        Ok(Slot {
            key_size: key.len() as u16,
            key_flags: key_flags | KEY_FLAG_EXTENDED,
            inline_size,
            rid,
            key_data,
        })
    }

    /// Builds a slot carrying `key` and pointing at `record`.
    pub(crate) fn make_record_slot(
        &mut self,
        pm: &mut PageManager,
        key: &[u8],
        record: &RecordRef,
    ) -> Result<Slot> {
        let (rid, flags, inline_size) = record.encode();
        self.make_slot(pm, key, rid, flags, inline_size)
    }

    /// Releases the extended-key blob of a slot, if any.
    pub(crate) fn release_slot_key(&mut self, pm: &mut PageManager, slot: &Slot) -> Result<()> {
        if slot.is_extended() {
            let id = slot.extended_id();
            self.extkeys.remove(id);
            BlobManager::free(pm, id)?;
        }
        Ok(())
    }

    /// Releases the record storage a leaf slot points at.
    pub(crate) fn release_slot_record(pm: &mut PageManager, slot: &Slot) -> Result<()> {
        match RecordRef::from_slot(slot) {
            RecordRef::Inline(_) => Ok(()),
            RecordRef::Blob(id) => BlobManager::free(pm, id),
            RecordRef::DupTable(id) => {
                let table = DupTable::read(pm, id)?;
                for entry in &table.entries {
                    entry.release(pm)?;
                }
                BlobManager::free(pm, id)
            }
        }
    }

    /// Reads the record a leaf slot points at; for duplicate keys the
    /// first duplicate.
    pub(crate) fn slot_record(pm: &mut PageManager, slot: &Slot) -> Result<Vec<u8>> {
        match RecordRef::from_slot(slot) {
            RecordRef::Inline(data) => Ok(data),
            RecordRef::Blob(id) => BlobManager::read(pm, id),
            RecordRef::DupTable(id) => {
                let table = DupTable::read(pm, id)?;
                match table.entries.first() {
                    Some(entry) => entry.record(pm),
                    None => Err(HamError::IntegrityViolated),
                }
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Navigation
    ///////////////////////////////////////////////////////////////////////////

    /// Address of the leftmost leaf.
    pub(crate) fn first_leaf(&mut self, pm: &mut PageManager) -> Result<PageAddr> {
        self.edge_leaf(pm, false)
    }

    /// Address of the rightmost leaf.
    pub(crate) fn last_leaf(&mut self, pm: &mut PageManager) -> Result<PageAddr> {
        self.edge_leaf(pm, true)
    }

    fn edge_leaf(&mut self, pm: &mut PageManager, rightmost: bool) -> Result<PageAddr> {
        let mut addr = self.root;
        loop {
            let mut page = self.fetch_node_page(pm, addr)?;
            let node = Node::attach(&mut page);
            if node.is_leaf() {
                return Ok(addr);
            }
            if node.count() == 0 {
                return Err(HamError::IntegrityViolated);
            }
            let idx = if rightmost { node.count() - 1 } else { 0 };
            addr = node.slot(idx).rid;
        }
    }

    /// The slot after `(leaf, slot)` in key order, following the
    /// sibling chain.
    pub(crate) fn next_slot(
        &mut self,
        pm: &mut PageManager,
        leaf: PageAddr,
        slot: usize,
    ) -> Result<Option<(PageAddr, usize)>> {
        let mut page = self.fetch_node_page(pm, leaf)?;
        let node = Node::attach(&mut page);
        if slot + 1 < node.count() {
            return Ok(Some((leaf, slot + 1)));
        }

        let mut next = node.ptr_right();
        while next != 0 {
            let mut page = self.fetch_node_page(pm, next)?;
            let node = Node::attach(&mut page);
            if node.count() > 0 {
                return Ok(Some((next, 0)));
            }
            next = node.ptr_right();
        }
        Ok(None)
    }

    /// The slot before `(leaf, slot)` in key order.
    pub(crate) fn previous_slot(
        &mut self,
        pm: &mut PageManager,
        leaf: PageAddr,
        slot: usize,
    ) -> Result<Option<(PageAddr, usize)>> {
        if slot > 0 {
            return Ok(Some((leaf, slot - 1)));
        }

        let mut page = self.fetch_node_page(pm, leaf)?;
        let node = Node::attach(&mut page);
        let mut prev = node.ptr_left();
        while prev != 0 {
            let mut page = self.fetch_node_page(pm, prev)?;
            let node = Node::attach(&mut page);
            if node.count() > 0 {
                return Ok(Some((prev, node.count() - 1)));
            }
            prev = node.ptr_left();
        }
        Ok(None)
    }

    /// The full key of the largest entry below `addr`.
    pub(crate) fn node_max_key(&mut self, pm: &mut PageManager, addr: PageAddr) -> Result<Vec<u8>> {
        let mut page = self.fetch_node_page(pm, addr)?;
        let node = Node::attach(&mut page);
        if node.count() == 0 {
            return Err(HamError::IntegrityViolated);
        }
        let slot = node.slot(node.count() - 1);
        self.slot_key(pm, &slot)
    }

    /// Releases every page, extended key and record blob of the tree.
    /// The index is unusable afterwards; used by database erase.
    pub(crate) fn drop_tree(&mut self, pm: &mut PageManager) -> Result<()> {
        self.drop_subtree(pm, self.root)?;
        self.extkeys.clear();
        Ok(())
    }

    fn drop_subtree(&mut self, pm: &mut PageManager, addr: PageAddr) -> Result<()> {
        let (is_leaf, slots) = {
            let mut page = self.fetch_node_page(pm, addr)?;
            let node = Node::attach(&mut page);
            let slots: Vec<Slot> = (0..node.count()).map(|i| node.slot(i)).collect();
            (node.is_leaf(), slots)
        };

        for slot in &slots {
            if !is_leaf {
                self.drop_subtree(pm, slot.rid)?;
            } else {
                Self::release_slot_record(pm, slot)?;
            }
            self.release_slot_key(pm, slot)?;
        }
        pm.free_page(addr)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Integrity
    ///////////////////////////////////////////////////////////////////////////

    /// Walks the whole tree and validates node fill, key order and
    /// separator bounds.
    pub(crate) fn check_integrity(&mut self, pm: &mut PageManager) -> Result<()> {
        self.check_subtree(pm, self.root, None, true)?;
        Ok(())
    }

    /// Returns the number of keys, counting each duplicate when
    /// `include_duplicates` is set.
    pub(crate) fn key_count(
        &mut self,
        pm: &mut PageManager,
        include_duplicates: bool,
    ) -> Result<u64> {
        let mut count = 0u64;
        let mut leaf = self.first_leaf(pm)?;
        while leaf != 0 {
            let mut page = self.fetch_node_page(pm, leaf)?;
            let node = Node::attach(&mut page);
            let slots = node.count();
            let right = node.ptr_right();
            for i in 0..slots {
                let slot = node.slot(i);
                if include_duplicates && slot.has_dup_table() {
                    count += DupTable::read(pm, slot.rid)?.count() as u64;
                } else {
                    count += 1;
                }
            }
            leaf = right;
        }
        Ok(count)
    }

    fn check_subtree(
        &mut self,
        pm: &mut PageManager,
        addr: PageAddr,
        upper_bound: Option<Vec<u8>>,
        is_root: bool,
    ) -> Result<usize> {
        let mut page = self.fetch_node_page(pm, addr)?;
        let node = Node::attach(&mut page);
        let count = node.count();
        let capacity = Node::capacity(pm.page_size());
        let is_leaf = node.is_leaf();

        // the rightmost node of a level is the append edge and may
        // still be filling up
        let is_append_edge = node.ptr_right() == 0;
        if !is_root && !is_append_edge && count < capacity.div_ceil(3) {
            warn!("node {} under-occupied: {} of {}", addr, count, capacity);
            return Err(HamError::IntegrityViolated);
        }

        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            slots.push(node.slot(i));
        }
        drop(page);

        let mut prev: Option<Vec<u8>> = None;
        for slot in &slots {
            let key = self.slot_key(pm, slot)?;
            if let Some(prev) = &prev {
                if self.key_ops.compare(prev, &key) != Ordering::Less {
                    warn!("key order violated in node {}", addr);
                    return Err(HamError::IntegrityViolated);
                }
            }
            if let Some(bound) = &upper_bound {
                if self.key_ops.compare(&key, bound) == Ordering::Greater {
                    warn!("separator bound violated in node {}", addr);
                    return Err(HamError::IntegrityViolated);
                }
            }
            prev = Some(key);
        }

        let mut depth = 1;
        if !is_leaf {
            let mut child_depth = None;
            for slot in &slots {
                let bound = self.slot_key(pm, slot)?;
                let d = self.check_subtree(pm, slot.rid, Some(bound), false)?;
                if let Some(expect) = child_depth {
                    if d != expect {
                        warn!("uneven subtree depth under node {}", addr);
                        return Err(HamError::IntegrityViolated);
                    }
                }
                child_depth = Some(d);
            }
            depth += child_depth.unwrap_or(0);
        }
        Ok(depth)
    }
}
