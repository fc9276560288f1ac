//! Page manager
//!
//! Owns the device, the page cache, the environment header and the
//! freelist. Every component above this layer allocates, fetches and
//! frees pages exclusively through the page manager, which keeps the
//! freelist and the file tail consistent and reclaims trailing free
//! space by truncating the file.
//!
//! Free space is tracked at two grains: whole pages, and byte areas
//! inside blob pages. Area ranges never cross a page boundary and
//! never cover a page header; when the areas of one page coalesce
//! back into its full payload, the page is promoted to the page list.

use std::collections::BTreeMap;

use log::{trace, warn};

use crate::cache::PageCache;
use crate::common::header::EnvHeader;
use crate::common::page::{PAGE_HEADER_SIZE, PageBuf, PageType};
use crate::common::types::{FREELIST_CHUNK_SIZE, FreelistPolicy, PageAddr};
use crate::common::{read_u32, read_u64, write_u32, write_u64};
use crate::device::Device;
use crate::errors::{HamError, Result};

/// Chain header inside a freelist page payload:
///   |page_bytes(u32)|area_bytes(u32)|reserved(u64)|next(u64)|
const FREELIST_PAGE_HEADER: usize = 24;

/// Blob space inside a page starts at this offset so that every area
/// stays aligned to the 32-byte freelist chunk. The 8 bytes between
/// the page header and the first chunk are unused.
pub(crate) const BLOB_AREA_OFFSET: usize = 32;

///
/// Free byte ranges, kept normalized (coalesced, sorted).
///
#[derive(Debug, Default)]
pub(crate) struct Freelist {
    /// address -> run length in bytes
    ranges: BTreeMap<u64, u64>,
}

impl Freelist {
    pub(crate) fn new() -> Freelist {
        Freelist::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub(crate) fn free_bytes(&self) -> u64 {
        self.ranges.values().sum()
    }

    /// Hands a byte range back. Ranges never overlap; a double free
    /// corrupts the store and is reported as such.
    pub(crate) fn free(&mut self, addr: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }

        if let Some((&prev_addr, &prev_len)) = self.ranges.range(..=addr).next_back() {
            if prev_addr + prev_len > addr {
                warn!("double free of range {}+{}", addr, len);
                return Err(HamError::IntegrityViolated);
            }
        }
        if let Some((&next_addr, _)) = self.ranges.range(addr..).next() {
            if addr + len > next_addr {
                warn!("freed range {}+{} overlaps {}", addr, len, next_addr);
                return Err(HamError::IntegrityViolated);
            }
        }

        let mut addr = addr;
        let mut len = len;

        // merge with the left neighbour
        if let Some((&prev_addr, &prev_len)) = self.ranges.range(..addr).next_back() {
            if prev_addr + prev_len == addr {
                self.ranges.remove(&prev_addr);
                addr = prev_addr;
                len += prev_len;
            }
        }
        // merge with the right neighbour
        if let Some(&next_len) = self.ranges.get(&(addr + len)) {
            self.ranges.remove(&(addr + len));
            len += next_len;
        }

        self.ranges.insert(addr, len);
        Ok(())
    }

    /// Allocates `len` bytes whose start satisfies `align`. Returns
    /// `None` when no run fits.
    pub(crate) fn alloc_aligned(&mut self, len: u64, align: u64) -> Option<u64> {
        let mut found = None;
        for (&start, &run_len) in self.ranges.iter() {
            let aligned = start.next_multiple_of(align);
            let skew = aligned - start;
            if run_len >= skew + len {
                found = Some((start, run_len, aligned, skew));
                break;
            }
        }

        let (start, run_len, aligned, skew) = found?;
        self.ranges.remove(&start);
        if skew > 0 {
            self.ranges.insert(start, skew);
        }
        let rest = run_len - skew - len;
        if rest > 0 {
            self.ranges.insert(aligned + len, rest);
        }
        Some(aligned)
    }

    /// The range containing `addr`, if free.
    pub(crate) fn containing(&self, addr: u64) -> Option<(u64, u64)> {
        let (&start, &len) = self.ranges.range(..=addr).next_back()?;
        (addr < start + len).then_some((start, len))
    }

    /// True if `addr` lies inside a free range.
    pub(crate) fn is_free(&self, addr: u64) -> bool {
        self.containing(addr).is_some()
    }

    /// The trailing free extent, if its end reaches `file_size`.
    pub(crate) fn tail_extent(&self, file_size: u64) -> Option<(u64, u64)> {
        let (&addr, &len) = self.ranges.iter().next_back()?;
        (addr + len == file_size).then_some((addr, len))
    }

    /// Drops every range at or beyond `boundary` (after truncation).
    pub(crate) fn remove_tail(&mut self, boundary: u64) {
        self.ranges.retain(|&addr, _| addr < boundary);
    }

    /// Removes an exact known-free range.
    fn carve(&mut self, addr: u64, len: u64) {
        let (start, run_len) = self.containing(addr).expect("carve of a live range");
        debug_assert!(addr + len <= start + run_len);
        self.ranges.remove(&start);
        if addr > start {
            self.ranges.insert(start, addr - start);
        }
        if start + run_len > addr + len {
            self.ranges.insert(addr + len, start + run_len - addr - len);
        }
    }

    fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&a, &l)| (a, l))
    }

    fn len(&self) -> usize {
        self.ranges.len()
    }
}

///
/// The paged store: device + cache + header + freelist.
///
pub(crate) struct PageManager {
    device: Device,
    cache: PageCache,
    header: EnvHeader,
    page_size: usize,
    /// whole free pages
    page_list: Freelist,
    /// free byte areas inside blob pages
    area_list: Freelist,
    /// pages carrying the persisted freelist, head first
    freelist_chain: Vec<PageAddr>,
}

impl PageManager {
    /// Initializes a fresh store: writes the header page at address 0.
    pub(crate) fn create(
        mut device: Device,
        cache: PageCache,
        header: EnvHeader,
    ) -> Result<PageManager> {
        let page_size = header.page_size() as usize;

        if !device.is_in_memory() {
            let addr = device.alloc_page(page_size)?;
            debug_assert_eq!(addr, 0);
        }

        let mut pm = PageManager {
            device,
            cache,
            header,
            page_size,
            page_list: Freelist::new(),
            area_list: Freelist::new(),
            freelist_chain: Vec::new(),
        };
        pm.write_header()?;
        Ok(pm)
    }

    /// Opens an existing store: validates the header page and loads
    /// the persisted freelist.
    pub(crate) fn open(
        device: Device,
        mut cache: PageCache,
        page_size: usize,
    ) -> Result<PageManager> {
        let page = cache.fetch_page(&device, 0, false)?;
        if page.header().typ() != PageType::Header {
            return Err(HamError::IntegrityViolated);
        }
        let header = EnvHeader::read_from(&page)?;

        let mut pm = PageManager {
            device,
            cache,
            header,
            page_size,
            page_list: Freelist::new(),
            area_list: Freelist::new(),
            freelist_chain: Vec::new(),
        };
        pm.load_freelist()?;
        Ok(pm)
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn header(&self) -> &EnvHeader {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut EnvHeader {
        &mut self.header
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    pub(crate) fn is_in_memory(&self) -> bool {
        self.device.is_in_memory()
    }

    /// Serializes the in-memory header onto page 0.
    pub(crate) fn write_header(&mut self) -> Result<()> {
        let mut page = PageBuf::new(self.page_size);
        page.header_mut().set_address(0);
        page.header_mut().set_typ(PageType::Header);
        self.header.write_to(&mut page);
        self.cache.store_page(0, page);
        Ok(())
    }

    pub(crate) fn fetch_page(&mut self, addr: PageAddr, no_header: bool) -> Result<PageBuf> {
        self.cache.fetch_page(&self.device, addr, no_header)
    }

    pub(crate) fn store_page(&mut self, addr: PageAddr, page: PageBuf) {
        self.cache.store_page(addr, page);
    }

    /// Allocates one page, recycling a freed one when possible, and
    /// returns its zeroed frame with the header set up.
    pub(crate) fn alloc_page(&mut self, typ: PageType) -> Result<PageBuf> {
        let addr = match self
            .page_list
            .alloc_aligned(self.page_size as u64, self.page_size as u64)
        {
            Some(addr) => {
                trace!("recycling page {}", addr);
                addr
            }
            None => self.device.alloc_page(self.page_size)?,
        };

        let mut page = PageBuf::new(self.page_size);
        page.header_mut().set_address(addr);
        page.header_mut().set_typ(typ);
        self.cache.insert_new(addr, page.clone());
        Ok(page)
    }

    /// Allocates `count` contiguous pages (for records larger than one
    /// page) and returns the address of the first.
    pub(crate) fn alloc_multiple_blob_pages(&mut self, count: usize) -> Result<PageAddr> {
        let total = (self.page_size * count) as u64;
        let first = match self
            .page_list
            .alloc_aligned(total, self.page_size as u64)
        {
            Some(addr) => addr,
            None => {
                // tail allocations are contiguous by construction
                let first = self.device.alloc_page(self.page_size)?;
                for i in 1..count {
                    let next = self.device.alloc_page(self.page_size)?;
                    debug_assert_eq!(next, first + (i * self.page_size) as u64);
                }
                first
            }
        };

        for i in 0..count {
            let addr = first + (i * self.page_size) as u64;
            let mut page = PageBuf::new(self.page_size);
            page.header_mut().set_address(addr);
            page.header_mut().set_typ(PageType::Blob);
            self.cache.insert_new(addr, page);
        }
        Ok(first)
    }

    /// Returns one page to the freelist.
    pub(crate) fn free_page(&mut self, addr: PageAddr) -> Result<()> {
        debug_assert_ne!(addr, 0, "cannot free the header page");
        self.cache.remove_page(addr);
        self.device.free_page(addr);
        self.page_list.free(addr, self.page_size as u64)
    }

    /// Allocates `len` bytes of blob space. Space is handed out in
    /// 32-byte chunks so it can be shared across databases. Returns
    /// `None` when no free area fits; the caller then allocates whole
    /// pages.
    pub(crate) fn alloc_area(&mut self, len: u64) -> Option<u64> {
        let chunked = len.next_multiple_of(FREELIST_CHUNK_SIZE as u64);
        self.area_list
            .alloc_aligned(chunked, FREELIST_CHUNK_SIZE as u64)
    }

    /// Returns a byte range inside a blob page to the freelist. When
    /// the whole payload of the page turns free, the page itself is
    /// recycled.
    pub(crate) fn free_area(&mut self, addr: u64, len: u64) -> Result<()> {
        let chunked = len.next_multiple_of(FREELIST_CHUNK_SIZE as u64);
        self.area_list.free(addr, chunked)?;

        let page_addr = addr - addr % self.page_size as u64;
        let payload_start = page_addr + BLOB_AREA_OFFSET as u64;
        let payload_len = (self.page_size - BLOB_AREA_OFFSET) as u64;
        if let Some((start, run_len)) = self.area_list.containing(payload_start) {
            if start <= payload_start && start + run_len >= payload_start + payload_len {
                self.area_list.carve(payload_start, payload_len);
                self.free_page(page_addr)?;
            }
        }
        Ok(())
    }

    /// Drops all freelist state. After crash recovery the persisted
    /// lists may predate the last flushes and could hand out live
    /// pages; forgetting them trades leaked space for safety until
    /// the next checkpoint persists a fresh state.
    pub(crate) fn clear_freelist(&mut self) {
        self.page_list = Freelist::new();
        self.area_list = Freelist::new();
    }

    /// Truncates the file when the topmost free extent reaches the
    /// current file size.
    pub(crate) fn reclaim(&mut self) -> Result<()> {
        if self.device.is_in_memory() {
            return Ok(());
        }

        let file_size = self.device.file_size()?;
        let Some((addr, _)) = self.page_list.tail_extent(file_size) else {
            return Ok(());
        };

        let boundary = addr.next_multiple_of(self.page_size as u64);
        if boundary >= file_size {
            return Ok(());
        }

        trace!("reclaiming file tail at {}", boundary);
        self.device.truncate(boundary)?;
        self.page_list.remove_tail(boundary);
        self.area_list.remove_tail(boundary);
        Ok(())
    }

    /// Addresses dirtied by the current top-level operation.
    pub(crate) fn changeset(&self) -> &[PageAddr] {
        self.cache.changeset()
    }

    pub(crate) fn dirty_page(&self, addr: PageAddr) -> Option<&PageBuf> {
        self.cache.dirty_page(addr)
    }

    /// Publishes the changeset: every dirty page reaches the device.
    /// The journal record describing the operation must be durable
    /// before this runs.
    pub(crate) fn flush_changeset(&mut self) -> Result<()> {
        self.cache.flush_changeset(&mut self.device)
    }

    /// Rolls the current operation back by discarding its dirty pages.
    pub(crate) fn discard_changeset(&mut self) {
        self.cache.discard_changeset();
    }

    /// Writes every dirty page and syncs the device.
    pub(crate) fn flush_all(&mut self) -> Result<()> {
        self.cache.flush_all(&mut self.device)?;
        self.device.flush()
    }

    ///////////////////////////////////////////////////////////////////////////
    // Freelist persistence
    ///////////////////////////////////////////////////////////////////////////

    /// Serializes the freelist onto its page chain and records the
    /// chain head in the header. The full policy writes bitmaps of
    /// 32-byte chunks; the reduced policy writes delta-encoded runs.
    pub(crate) fn persist_freelist(&mut self) -> Result<()> {
        if self.device.is_in_memory() {
            return Ok(());
        }

        let per_page = self.page_size - PAGE_HEADER_SIZE - FREELIST_PAGE_HEADER;

        // Adjusting the chain mutates the serialized state (tail
        // allocations extend the bitmap, freed surplus pages add
        // runs), so iterate until the chain length settles.
        let (pages, areas) = loop {
            let pages = self.serialize_list(true)?;
            let areas = self.serialize_list(false)?;
            let pages_needed = (pages.len() + areas.len()).div_ceil(per_page).max(1);

            if self.freelist_chain.len() < pages_needed {
                let addr = self.device.alloc_page(self.page_size)?;
                self.freelist_chain.push(addr);
            } else if self.freelist_chain.len() > pages_needed {
                let addr = self.freelist_chain.pop().unwrap();
                self.free_page(addr)?;
            } else {
                break (pages, areas);
            }
        };

        let mut payload = pages.clone();
        payload.extend_from_slice(&areas);

        let mut offset = 0usize;
        for (i, &addr) in self.freelist_chain.iter().enumerate() {
            let chunk_len = (payload.len() - offset).min(per_page);
            let next = self.freelist_chain.get(i + 1).copied().unwrap_or(0);

            let mut page = PageBuf::new(self.page_size);
            page.header_mut().set_address(addr);
            page.header_mut().set_typ(PageType::Freelist);
            {
                let body = page.payload_mut();
                // page_bytes/area_bytes only matter on the head page
                if i == 0 {
                    write_u32(body, 0, pages.len() as u32);
                    write_u32(body, 4, areas.len() as u32);
                }
                write_u64(body, 8, chunk_len as u64);
                write_u64(body, 16, next);
                body[FREELIST_PAGE_HEADER..FREELIST_PAGE_HEADER + chunk_len]
                    .copy_from_slice(&payload[offset..offset + chunk_len]);
            }
            self.cache.store_page(addr, page);
            offset += chunk_len;
        }

        self.header.set_freelist_root(self.freelist_chain[0]);
        self.write_header()
    }

    /// Loads the freelist from the chain referenced by the header.
    fn load_freelist(&mut self) -> Result<()> {
        self.page_list = Freelist::new();
        self.area_list = Freelist::new();
        self.freelist_chain.clear();

        let mut addr = self.header.freelist_root();
        let mut payload = Vec::new();
        let mut page_bytes = 0usize;
        let mut area_bytes = 0usize;

        while addr != 0 {
            self.freelist_chain.push(addr);
            let page = self.cache.fetch_page(&self.device, addr, false)?;
            if page.header().typ() != PageType::Freelist {
                return Err(HamError::IntegrityViolated);
            }
            let body = page.payload();
            if self.freelist_chain.len() == 1 {
                page_bytes = read_u32(body, 0) as usize;
                area_bytes = read_u32(body, 4) as usize;
            }
            let len = read_u64(body, 8) as usize;
            if FREELIST_PAGE_HEADER + len > body.len() {
                return Err(HamError::IntegrityViolated);
            }
            payload.extend_from_slice(&body[FREELIST_PAGE_HEADER..FREELIST_PAGE_HEADER + len]);
            addr = read_u64(body, 16);
        }

        if payload.len() != page_bytes + area_bytes {
            return Err(HamError::IntegrityViolated);
        }

        let (pages, areas) = payload.split_at(page_bytes);
        self.page_list = self.deserialize_list(pages)?;
        self.area_list = self.deserialize_list(areas)?;
        Ok(())
    }

    fn serialize_list(&self, pages: bool) -> Result<Vec<u8>> {
        let list = if pages { &self.page_list } else { &self.area_list };
        match self.header.freelist_policy() {
            FreelistPolicy::Full => {
                let file_size = self.device.file_size()?;
                Ok(serialize_bitmap(list, file_size))
            }
            FreelistPolicy::Reduced => Ok(serialize_runs(list)),
        }
    }

    fn deserialize_list(&self, payload: &[u8]) -> Result<Freelist> {
        match self.header.freelist_policy() {
            FreelistPolicy::Full => deserialize_bitmap(payload),
            FreelistPolicy::Reduced => deserialize_runs(payload),
        }
    }

    #[cfg(test)]
    pub(crate) fn page_list(&self) -> &Freelist {
        &self.page_list
    }

    #[cfg(test)]
    pub(crate) fn area_list(&self) -> &Freelist {
        &self.area_list
    }
}

/// Full policy: one bit per 32-byte chunk of the file, set when the
/// chunk is free.
fn serialize_bitmap(list: &Freelist, file_size: u64) -> Vec<u8> {
    let chunks = (file_size / FREELIST_CHUNK_SIZE as u64) as usize;
    let mut bitmap = vec![0u8; chunks.div_ceil(8)];

    for (addr, len) in list.iter() {
        let first = (addr / FREELIST_CHUNK_SIZE as u64) as usize;
        let count = len.div_ceil(FREELIST_CHUNK_SIZE as u64) as usize;
        for chunk in first..(first + count).min(chunks) {
            bitmap[chunk / 8] |= 1 << (chunk % 8);
        }
    }
    bitmap
}

fn deserialize_bitmap(bitmap: &[u8]) -> Result<Freelist> {
    let chunk = FREELIST_CHUNK_SIZE as u64;
    let mut list = Freelist::new();
    let mut run_start: Option<u64> = None;

    for i in 0..bitmap.len() * 8 {
        let free = bitmap[i / 8] & (1 << (i % 8)) != 0;
        match (free, run_start) {
            (true, None) => run_start = Some(i as u64 * chunk),
            (false, Some(start)) => {
                list.free(start, i as u64 * chunk - start)?;
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        list.free(start, bitmap.len() as u64 * 8 * chunk - start)?;
    }
    Ok(list)
}

/// Reduced policy: `{delta_addr(u64), len(u64)}` pairs; addresses are
/// deltas from the end of the previous run.
fn serialize_runs(list: &Freelist) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 * list.len() + 4);
    out.extend_from_slice(&(list.len() as u32).to_le_bytes());

    let mut prev_end = 0u64;
    for (addr, len) in list.iter() {
        out.extend_from_slice(&(addr - prev_end).to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        prev_end = addr + len;
    }
    out
}

fn deserialize_runs(payload: &[u8]) -> Result<Freelist> {
    let mut list = Freelist::new();
    if payload.is_empty() {
        return Ok(list);
    }
    if payload.len() < 4 {
        return Err(HamError::IntegrityViolated);
    }
    let count = read_u32(payload, 0) as usize;
    if payload.len() < 4 + count * 16 {
        return Err(HamError::IntegrityViolated);
    }

    let mut prev_end = 0u64;
    for i in 0..count {
        let off = 4 + i * 16;
        let delta = read_u64(payload, off);
        let len = read_u64(payload, off + 8);
        let addr = prev_end + delta;
        list.free(addr, len)?;
        prev_end = addr + len;
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{DEFAULT_CACHE_SIZE, EnvFlags};
    use crate::device::DiskDevice;
    use tempfile::NamedTempFile;

    const PAGE_SIZE: usize = 1024;

    fn new_store(tmp: &NamedTempFile, policy: FreelistPolicy) -> PageManager {
        let device = Device::Disk(DiskDevice::create(tmp.path(), 0o644, 0, None).unwrap());
        let cache = PageCache::new(DEFAULT_CACHE_SIZE, PAGE_SIZE, false);
        let header = EnvHeader::new(PAGE_SIZE as u32, 4, EnvFlags::empty(), 0, policy);
        PageManager::create(device, cache, header).unwrap()
    }

    #[test]
    fn test_freelist_coalescing() {
        let mut fl = Freelist::new();
        fl.free(0, 32).unwrap();
        fl.free(64, 32).unwrap();
        assert_eq!(fl.free_bytes(), 64);

        // the middle piece joins both neighbours into one run
        fl.free(32, 32).unwrap();
        assert_eq!(fl.free_bytes(), 96);
        assert_eq!(fl.alloc_aligned(96, 32), Some(0));
        assert!(fl.is_empty());
    }

    #[test]
    fn test_freelist_rejects_double_free() {
        let mut fl = Freelist::new();
        fl.free(64, 64).unwrap();
        assert_eq!(fl.free(64, 64), Err(HamError::IntegrityViolated));
        assert_eq!(fl.free(96, 16), Err(HamError::IntegrityViolated));
        assert_eq!(fl.free(32, 64), Err(HamError::IntegrityViolated));
    }

    #[test]
    fn test_freelist_alignment() {
        let mut fl = Freelist::new();
        fl.free(8, 1024).unwrap();

        let addr = fl.alloc_aligned(32, 32).unwrap();
        assert_eq!(addr % 32, 0);
        // the skew before the aligned start stays free
        assert!(fl.is_free(8));
        assert!(!fl.is_free(addr));
    }

    #[test]
    fn test_alloc_page_recycles() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp, FreelistPolicy::Full);

        let page = pm.alloc_page(PageType::Btree).unwrap();
        let addr = page.header().address();
        assert_eq!(addr, PAGE_SIZE as u64);

        pm.free_page(addr).unwrap();
        let page = pm.alloc_page(PageType::Blob).unwrap();
        assert_eq!(page.header().address(), addr);
        assert_eq!(page.header().typ(), PageType::Blob);
    }

    #[test]
    fn test_alloc_multiple_blob_pages_contiguous() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp, FreelistPolicy::Full);

        let first = pm.alloc_multiple_blob_pages(3).unwrap();
        let next = pm.alloc_page(PageType::Btree).unwrap();
        assert_eq!(next.header().address(), first + 3 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_area_promotion_frees_the_page() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp, FreelistPolicy::Full);

        let page = pm.alloc_page(PageType::Blob).unwrap();
        let addr = page.header().address();
        let payload_start = addr + BLOB_AREA_OFFSET as u64;
        let payload_len = (PAGE_SIZE - BLOB_AREA_OFFSET) as u64;

        // free the blob area in two halves; the second free promotes
        // the coalesced run back to a whole free page
        pm.free_area(payload_start, 480).unwrap();
        assert!(pm.page_list().is_empty());
        pm.free_area(payload_start + 480, payload_len - 480).unwrap();
        assert!(pm.area_list().is_empty());
        assert!(pm.page_list().is_free(addr));
    }

    #[test]
    fn test_reclaim_truncates_tail() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp, FreelistPolicy::Full);

        let a1 = pm.alloc_page(PageType::Blob).unwrap().header().address();
        let a2 = pm.alloc_page(PageType::Blob).unwrap().header().address();
        pm.flush_changeset().unwrap();

        pm.free_page(a2).unwrap();
        pm.reclaim().unwrap();
        assert_eq!(pm.device().file_size().unwrap(), a2);

        // a1 is still live; freeing it reclaims the rest
        pm.free_page(a1).unwrap();
        pm.reclaim().unwrap();
        assert_eq!(pm.device().file_size().unwrap(), a1);
    }

    #[test]
    fn test_freelist_survives_restart_full_policy() {
        let tmp = NamedTempFile::new().unwrap();
        let freed;
        {
            let mut pm = new_store(&tmp, FreelistPolicy::Full);
            let a1 = pm.alloc_page(PageType::Blob).unwrap().header().address();
            let _a2 = pm.alloc_page(PageType::Blob).unwrap().header().address();
            pm.free_page(a1).unwrap();
            freed = a1;
            pm.persist_freelist().unwrap();
            pm.flush_all().unwrap();
        }

        let device =
            Device::Disk(DiskDevice::open(tmp.path(), EnvFlags::empty(), 0, None).unwrap());
        let cache = PageCache::new(DEFAULT_CACHE_SIZE, PAGE_SIZE, false);
        let mut pm = PageManager::open(device, cache, PAGE_SIZE).unwrap();
        assert!(pm.page_list().is_free(freed));

        // the freed page is recycled after reopen
        let page = pm.alloc_page(PageType::Btree).unwrap();
        assert_eq!(page.header().address(), freed);
    }

    #[test]
    fn test_freelist_survives_restart_reduced_policy() {
        let tmp = NamedTempFile::new().unwrap();
        let freed_page;
        let freed_area;
        {
            let mut pm = new_store(&tmp, FreelistPolicy::Reduced);
            let a1 = pm.alloc_page(PageType::Blob).unwrap().header().address();
            let a2 = pm.alloc_page(PageType::Blob).unwrap().header().address();
            pm.free_page(a1).unwrap();
            freed_page = a1;
            freed_area = a2 + PAGE_HEADER_SIZE as u64;
            pm.free_area(freed_area, 64).unwrap();
            pm.persist_freelist().unwrap();
            pm.flush_all().unwrap();
        }

        let device =
            Device::Disk(DiskDevice::open(tmp.path(), EnvFlags::empty(), 0, None).unwrap());
        let cache = PageCache::new(DEFAULT_CACHE_SIZE, PAGE_SIZE, false);
        let pm = PageManager::open(device, cache, PAGE_SIZE).unwrap();
        assert!(pm.page_list().is_free(freed_page));
        assert!(pm.area_list().is_free(freed_area));
    }

    #[test]
    fn test_area_alloc_chunks() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp, FreelistPolicy::Full);

        assert_eq!(pm.alloc_area(100), None);

        let page = pm.alloc_page(PageType::Blob).unwrap();
        let addr = page.header().address();
        pm.free_area(addr + BLOB_AREA_OFFSET as u64, 200).unwrap();

        // carved area is chunk-aligned and chunk-sized
        let area = pm.alloc_area(100).unwrap();
        assert_eq!(area % 32, 0);
        assert!(pm.alloc_area(100).is_none());
    }
}
