//! Blob manager
//!
//! Allocates, reads, overwrites and erases variable-length records and
//! extended keys. A blob is addressed by the file offset of its
//! header. Small blobs live inside the shared area space of blob
//! pages; records that do not fit into one page span contiguous pages
//! allocated together, where every page after the first is a raw
//! frame without a page header.

use bytemuck::{Pod, Zeroable};
use bytes::{BufMut, BytesMut};
use log::trace;

use crate::common::page::PageType;
use crate::common::types::{BlobId, FREELIST_CHUNK_SIZE, MAX_INLINE_RECORD_SIZE};
use crate::common::{read_u32, write_u32};
use crate::errors::{HamError, Result};
use crate::page_manager::{BLOB_AREA_OFFSET, PageManager};

/// Persistent blob header:
///   |self(u64)|allocated_size(u64)|real_size(u64)|flags(u32)|reserved(u32)|
pub(crate) const BLOB_HEADER_SIZE: usize = std::mem::size_of::<BlobHeader>();

#[derive(Debug, Default, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct BlobHeader {
    self_addr: u64,
    allocated_size: u64,
    real_size: u64,
    flags: u32,
    reserved: u32,
}

impl BlobHeader {
    pub(crate) fn self_addr(&self) -> u64 {
        self.self_addr
    }

    pub(crate) fn allocated_size(&self) -> u64 {
        self.allocated_size
    }

    pub(crate) fn real_size(&self) -> u64 {
        self.real_size
    }
}

/// The blob manager is stateless; every call runs against the page
/// manager of the environment.
pub(crate) struct BlobManager;

impl BlobManager {
    /// Allocates a blob holding `data` and returns its id. A
    /// zero-length record becomes a header with `real_size == 0` and
    /// no payload bytes.
    pub(crate) fn alloc(pm: &mut PageManager, data: &[u8]) -> Result<BlobId> {
        let total = (BLOB_HEADER_SIZE + data.len()) as u64;
        let page_size = pm.page_size() as u64;
        let page_area = page_size - BLOB_AREA_OFFSET as u64;

        let (id, allocated_size) = if total <= page_area {
            match pm.alloc_area(total) {
                Some(addr) => {
                    let chunked = total.next_multiple_of(FREELIST_CHUNK_SIZE as u64);
                    (addr, chunked - BLOB_HEADER_SIZE as u64)
                }
                None => {
                    // carve the head of a fresh blob page, return the
                    // rest of its area to the freelist
                    let page = pm.alloc_page(PageType::Blob)?;
                    let page_addr = page.header().address();
                    let chunked = total.next_multiple_of(FREELIST_CHUNK_SIZE as u64);
                    let rest = page_area - chunked;
                    if rest > 0 {
                        pm.free_area(page_addr + BLOB_AREA_OFFSET as u64 + chunked, rest)?;
                    }
                    (
                        page_addr + BLOB_AREA_OFFSET as u64,
                        chunked - BLOB_HEADER_SIZE as u64,
                    )
                }
            }
        } else {
            // spans pages: first page contributes its area, every
            // further page a raw full frame
            let overflow = total - page_area;
            let pages = 1 + overflow.div_ceil(page_size) as usize;
            let first = pm.alloc_multiple_blob_pages(pages)?;
            let capacity = page_area + (pages as u64 - 1) * page_size;
            (
                first + BLOB_AREA_OFFSET as u64,
                capacity - BLOB_HEADER_SIZE as u64,
            )
        };

        let header = BlobHeader {
            self_addr: id,
            allocated_size,
            real_size: data.len() as u64,
            flags: 0,
            reserved: 0,
        };

        Self::write_region(pm, id, 0, bytemuck::bytes_of(&header))?;
        Self::write_region(pm, id, BLOB_HEADER_SIZE as u64, data)?;
        trace!("allocated blob {} ({} bytes)", id, data.len());
        Ok(id)
    }

    /// Reads and validates the header of blob `id`. An unknown id is
    /// fatal corruption.
    pub(crate) fn read_header(pm: &mut PageManager, id: BlobId) -> Result<BlobHeader> {
        let mut buf = [0u8; BLOB_HEADER_SIZE];
        Self::read_region(pm, id, 0, &mut buf)?;
        let header: BlobHeader = bytemuck::pod_read_unaligned(&buf);
        if header.self_addr != id {
            return Err(HamError::IntegrityViolated);
        }
        if header.real_size > header.allocated_size {
            return Err(HamError::IntegrityViolated);
        }
        Ok(header)
    }

    /// Reads the full record of blob `id`.
    pub(crate) fn read(pm: &mut PageManager, id: BlobId) -> Result<Vec<u8>> {
        let header = Self::read_header(pm, id)?;
        let mut data = vec![0u8; header.real_size as usize];
        Self::read_region(pm, id, BLOB_HEADER_SIZE as u64, &mut data)?;
        Ok(data)
    }

    /// Reads the window `[offset, offset+len)` of the record. The
    /// window is capped at `real_size`.
    pub(crate) fn read_partial(
        pm: &mut PageManager,
        id: BlobId,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>> {
        let header = Self::read_header(pm, id)?;
        if offset >= header.real_size {
            return Ok(Vec::new());
        }
        let len = len.min(header.real_size - offset);
        let mut data = vec![0u8; len as usize];
        Self::read_region(pm, id, BLOB_HEADER_SIZE as u64 + offset, &mut data)?;
        Ok(data)
    }

    pub(crate) fn size(pm: &mut PageManager, id: BlobId) -> Result<u64> {
        Ok(Self::read_header(pm, id)?.real_size)
    }

    /// Overwrites the record. Stays in place while the new size fits
    /// the allocation; otherwise the blob moves and the new id is
    /// returned.
    pub(crate) fn overwrite(pm: &mut PageManager, id: BlobId, data: &[u8]) -> Result<BlobId> {
        let mut header = Self::read_header(pm, id)?;

        if (data.len() as u64) <= header.allocated_size {
            header.real_size = data.len() as u64;
            Self::write_region(pm, id, 0, bytemuck::bytes_of(&header))?;
            Self::write_region(pm, id, BLOB_HEADER_SIZE as u64, data)?;
            return Ok(id);
        }

        Self::free(pm, id)?;
        Self::alloc(pm, data)
    }

    /// Overwrites only the window `[offset, offset+data.len())` and
    /// sets the record size to `total_size`. Bytes of a gap between
    /// the old size and `offset` read as zero. Grows past the
    /// allocation by relocating; shrinks keep the allocation.
    pub(crate) fn overwrite_partial(
        pm: &mut PageManager,
        id: BlobId,
        offset: u64,
        data: &[u8],
        total_size: u64,
    ) -> Result<BlobId> {
        if offset + data.len() as u64 > total_size {
            return Err(HamError::InvParameter(
                "partial window exceeds the record size",
            ));
        }

        let mut header = Self::read_header(pm, id)?;

        if total_size > header.allocated_size {
            // rebuild the record at full size, then relocate
            let old = Self::read(pm, id)?;
            let mut full = BytesMut::with_capacity(total_size as usize);
            full.put_slice(&old[..old.len().min(total_size as usize)]);
            full.resize(total_size as usize, 0);
            full[offset as usize..offset as usize + data.len()].copy_from_slice(data);

            Self::free(pm, id)?;
            return Self::alloc(pm, &full);
        }

        // zero-fill a gap between the old record end and the window
        if offset > header.real_size {
            let gap = vec![0u8; (offset - header.real_size) as usize];
            Self::write_region(
                pm,
                id,
                BLOB_HEADER_SIZE as u64 + header.real_size,
                &gap,
            )?;
        }

        Self::write_region(pm, id, BLOB_HEADER_SIZE as u64 + offset, data)?;
        header.real_size = total_size;
        Self::write_region(pm, id, 0, bytemuck::bytes_of(&header))?;
        Ok(id)
    }

    /// Releases the blob's storage.
    pub(crate) fn free(pm: &mut PageManager, id: BlobId) -> Result<()> {
        let header = Self::read_header(pm, id)?;
        let total = BLOB_HEADER_SIZE as u64 + header.allocated_size;
        let page_size = pm.page_size() as u64;
        let page_area = page_size - BLOB_AREA_OFFSET as u64;
        let first_page = id - id % page_size;

        if id % page_size != BLOB_AREA_OFFSET as u64 || total <= page_area {
            // area blob
            pm.free_area(id, total)?;
        } else {
            let overflow = total - page_area;
            let pages = 1 + overflow.div_ceil(page_size) as usize;
            for i in 0..pages {
                pm.free_page(first_page + i as u64 * page_size)?;
            }
        }
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////
    // Region I/O across the page chain of a blob
    ///////////////////////////////////////////////////////////////////////////

    /// Maps `id + rel` (a byte position relative to the blob header)
    /// onto (page address, in-frame offset, run length, raw frame).
    fn map_region(
        pm: &PageManager,
        id: BlobId,
        rel: u64,
    ) -> (u64, usize, usize, bool) {
        let page_size = pm.page_size() as u64;
        let first_page = id - id % page_size;
        let first_run = page_size - id % page_size;

        if rel < first_run {
            let in_page = (id % page_size + rel) as usize;
            (first_page, in_page, (page_size as u64 - in_page as u64) as usize, false)
        } else {
            let past = rel - first_run;
            let page = first_page + page_size + (past / page_size) * page_size;
            let in_page = (past % page_size) as usize;
            (page, in_page, (page_size - in_page as u64) as usize, true)
        }
    }

    fn read_region(pm: &mut PageManager, id: BlobId, rel: u64, buf: &mut [u8]) -> Result<()> {
        let mut rel = rel;
        let mut done = 0usize;
        while done < buf.len() {
            let (page_addr, in_page, run, raw) = Self::map_region(pm, id, rel);
            let n = run.min(buf.len() - done);
            let page = pm.fetch_page(page_addr, raw)?;
            buf[done..done + n].copy_from_slice(&page.as_slice()[in_page..in_page + n]);
            done += n;
            rel += n as u64;
        }
        Ok(())
    }

    fn write_region(pm: &mut PageManager, id: BlobId, rel: u64, data: &[u8]) -> Result<()> {
        let mut rel = rel;
        let mut done = 0usize;
        while done < data.len() {
            let (page_addr, in_page, run, raw) = Self::map_region(pm, id, rel);
            let n = run.min(data.len() - done);
            let mut page = pm.fetch_page(page_addr, raw)?;
            page.as_slice_mut()[in_page..in_page + n].copy_from_slice(&data[done..done + n]);
            pm.store_page(page_addr, page);
            done += n;
            rel += n as u64;
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////
// Duplicate tables
///////////////////////////////////////////////////////////////////////////////

/// Initial entry capacity of a fresh duplicate table.
const DUP_TABLE_INITIAL_CAPACITY: usize = 8;

/// Serialized entry: |flags(u8)|inline_size(u8)|reserved(u16)|
/// |reserved(u32)|rid_or_inline(u64)|
const DUP_ENTRY_SIZE: usize = 16;

const DUP_ENTRY_INLINE: u8 = 0x01;

/// One record of a key carrying duplicates: either a small record
/// stored inline or the id of its blob.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DupEntry {
    Inline(Vec<u8>),
    Blob(BlobId),
}

impl DupEntry {
    /// Builds the entry for `data`, spilling to a blob when it does
    /// not fit inline.
    pub(crate) fn for_record(pm: &mut PageManager, data: &[u8]) -> Result<DupEntry> {
        if data.len() <= MAX_INLINE_RECORD_SIZE {
            Ok(DupEntry::Inline(data.to_vec()))
        } else {
            Ok(DupEntry::Blob(BlobManager::alloc(pm, data)?))
        }
    }

    pub(crate) fn record(&self, pm: &mut PageManager) -> Result<Vec<u8>> {
        match self {
            DupEntry::Inline(data) => Ok(data.clone()),
            DupEntry::Blob(id) => BlobManager::read(pm, *id),
        }
    }

    pub(crate) fn record_size(&self, pm: &mut PageManager) -> Result<u64> {
        match self {
            DupEntry::Inline(data) => Ok(data.len() as u64),
            DupEntry::Blob(id) => BlobManager::size(pm, *id),
        }
    }

    /// Frees a spilled record blob.
    pub(crate) fn release(&self, pm: &mut PageManager) -> Result<()> {
        match self {
            DupEntry::Inline(_) => Ok(()),
            DupEntry::Blob(id) => BlobManager::free(pm, *id),
        }
    }
}

/// In-memory image of a duplicate table blob:
///   |count(u32)|capacity(u32)| entries...
#[derive(Debug, Default)]
pub(crate) struct DupTable {
    capacity: usize,
    pub(crate) entries: Vec<DupEntry>,
}

impl DupTable {
    /// Loads the table stored in blob `id`.
    pub(crate) fn read(pm: &mut PageManager, id: BlobId) -> Result<DupTable> {
        let raw = BlobManager::read(pm, id)?;
        if raw.len() < 8 {
            return Err(HamError::IntegrityViolated);
        }
        let count = read_u32(&raw, 0) as usize;
        let capacity = read_u32(&raw, 4) as usize;
        if raw.len() < 8 + count * DUP_ENTRY_SIZE || count > capacity {
            return Err(HamError::IntegrityViolated);
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = 8 + i * DUP_ENTRY_SIZE;
            let flags = raw[off];
            if flags & DUP_ENTRY_INLINE != 0 {
                let size = raw[off + 1] as usize;
                entries.push(DupEntry::Inline(raw[off + 8..off + 8 + size].to_vec()));
            } else {
                entries.push(DupEntry::Blob(crate::common::read_u64(&raw, off + 8)));
            }
        }
        Ok(DupTable { capacity, entries })
    }

    /// Creates the table blob for a key acquiring its second record.
    pub(crate) fn create(
        pm: &mut PageManager,
        first: DupEntry,
        second: DupEntry,
    ) -> Result<BlobId> {
        let table = DupTable {
            capacity: DUP_TABLE_INITIAL_CAPACITY,
            entries: vec![first, second],
        };
        BlobManager::alloc(pm, &table.serialize())
    }

    /// Writes the table back into blob `id`. Growing past the
    /// capacity doubles it and reallocates the table as a new blob;
    /// the (possibly moved) id is returned.
    pub(crate) fn write(&mut self, pm: &mut PageManager, id: BlobId) -> Result<BlobId> {
        while self.entries.len() > self.capacity {
            self.capacity *= 2;
        }
        BlobManager::overwrite(pm, id, &self.serialize())
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }

    /// Inserts `entry` at `pos`, shifting later entries up.
    pub(crate) fn insert(&mut self, pos: usize, entry: DupEntry) {
        self.entries.insert(pos.min(self.entries.len()), entry);
    }

    /// Removes the entry at `pos`, shifting later entries down. The
    /// spilled record is not released; the caller decides.
    pub(crate) fn erase(&mut self, pos: usize) -> DupEntry {
        self.entries.remove(pos)
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = vec![0u8; 8 + self.capacity.max(self.entries.len()) * DUP_ENTRY_SIZE];
        write_u32(&mut out, 0, self.entries.len() as u32);
        write_u32(&mut out, 4, self.capacity as u32);

        for (i, entry) in self.entries.iter().enumerate() {
            let off = 8 + i * DUP_ENTRY_SIZE;
            match entry {
                DupEntry::Inline(data) => {
                    out[off] = DUP_ENTRY_INLINE;
                    out[off + 1] = data.len() as u8;
                    out[off + 8..off + 8 + data.len()].copy_from_slice(data);
                }
                DupEntry::Blob(id) => {
                    crate::common::write_u64(&mut out, off + 8, *id);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PageCache;
    use crate::common::header::EnvHeader;
    use crate::common::types::{DEFAULT_CACHE_SIZE, EnvFlags, FreelistPolicy};
    use crate::device::{Device, DiskDevice};
    use tempfile::NamedTempFile;

    const PAGE_SIZE: usize = 1024;

    fn new_store(tmp: &NamedTempFile) -> PageManager {
        let device = Device::Disk(DiskDevice::create(tmp.path(), 0o644, 0, None).unwrap());
        let cache = PageCache::new(DEFAULT_CACHE_SIZE, PAGE_SIZE, false);
        let header = EnvHeader::new(
            PAGE_SIZE as u32,
            4,
            EnvFlags::empty(),
            0,
            FreelistPolicy::Full,
        );
        PageManager::create(device, cache, header).unwrap()
    }

    #[test]
    fn test_blob_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp);

        let id = BlobManager::alloc(&mut pm, b"world").unwrap();
        assert_eq!(BlobManager::read(&mut pm, id).unwrap(), b"world");
        assert_eq!(BlobManager::size(&mut pm, id).unwrap(), 5);
    }

    #[test]
    fn test_zero_length_blob() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp);

        let id = BlobManager::alloc(&mut pm, b"").unwrap();
        let header = BlobManager::read_header(&mut pm, id).unwrap();
        assert_eq!(header.real_size(), 0);
        assert_eq!(BlobManager::read(&mut pm, id).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_multi_page_blob() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp);

        let data: Vec<u8> = (0..PAGE_SIZE * 3).map(|i| (i % 251) as u8).collect();
        let id = BlobManager::alloc(&mut pm, &data).unwrap();
        assert_eq!(BlobManager::read(&mut pm, id).unwrap(), data);

        // window that crosses page boundaries
        let window = BlobManager::read_partial(&mut pm, id, 900, 400).unwrap();
        assert_eq!(window, &data[900..1300]);
    }

    #[test]
    fn test_overwrite_in_place_and_relocating() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp);

        let id = BlobManager::alloc(&mut pm, &[7u8; 100]).unwrap();
        // shrinking keeps the blob in place
        let id2 = BlobManager::overwrite(&mut pm, id, &[9u8; 40]).unwrap();
        assert_eq!(id, id2);
        assert_eq!(BlobManager::read(&mut pm, id2).unwrap(), vec![9u8; 40]);

        // growing far past the allocation relocates
        let big = vec![3u8; PAGE_SIZE * 2];
        let id3 = BlobManager::overwrite(&mut pm, id2, &big).unwrap();
        assert_ne!(id2, id3);
        assert_eq!(BlobManager::read(&mut pm, id3).unwrap(), big);
    }

    #[test]
    fn test_partial_write_window() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp);

        let id = BlobManager::alloc(&mut pm, b"aaaaaaaaaa").unwrap();
        let id = BlobManager::overwrite_partial(&mut pm, id, 3, b"XYZ", 10).unwrap();
        assert_eq!(BlobManager::read(&mut pm, id).unwrap(), b"aaaXYZaaaa");

        // window beyond the record size is rejected
        assert!(matches!(
            BlobManager::overwrite_partial(&mut pm, id, 8, b"XYZ", 10),
            Err(HamError::InvParameter(_))
        ));
    }

    #[test]
    fn test_partial_write_gap_is_zero_filled() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp);

        let id = BlobManager::alloc(&mut pm, b"ab").unwrap();
        let id = BlobManager::overwrite_partial(&mut pm, id, 6, b"cd", 8).unwrap();
        assert_eq!(
            BlobManager::read(&mut pm, id).unwrap(),
            b"ab\0\0\0\0cd"
        );
    }

    #[test]
    fn test_free_returns_space() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp);

        let id = BlobManager::alloc(&mut pm, &[1u8; 100]).unwrap();
        BlobManager::free(&mut pm, id).unwrap();

        // the freed area is recycled for the next small blob
        let id2 = BlobManager::alloc(&mut pm, &[2u8; 100]).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn test_unknown_blob_is_corruption() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp);

        let id = BlobManager::alloc(&mut pm, b"x").unwrap();
        assert!(matches!(
            BlobManager::read(&mut pm, id + 64),
            Err(HamError::IntegrityViolated)
        ));
    }

    #[test]
    fn test_dup_table_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp);

        let a = DupEntry::for_record(&mut pm, b"a").unwrap();
        let b = DupEntry::for_record(&mut pm, b"b").unwrap();
        let id = DupTable::create(&mut pm, a, b).unwrap();

        let mut table = DupTable::read(&mut pm, id).unwrap();
        assert_eq!(table.count(), 2);
        assert_eq!(table.entries[0].record(&mut pm).unwrap(), b"a");
        assert_eq!(table.entries[1].record(&mut pm).unwrap(), b"b");

        // a record past the inline limit spills into its own blob
        let big = DupEntry::for_record(&mut pm, b"cccccccccccccc").unwrap();
        assert!(matches!(big, DupEntry::Blob(_)));
        table.insert(2, big);
        let id = table.write(&mut pm, id).unwrap();

        let mut table = DupTable::read(&mut pm, id).unwrap();
        assert_eq!(table.count(), 3);
        assert_eq!(table.entries[2].record(&mut pm).unwrap(), b"cccccccccccccc");

        // erase shifts the rest down
        let erased = table.erase(1);
        erased.release(&mut pm).unwrap();
        let id = table.write(&mut pm, id).unwrap();
        let table = DupTable::read(&mut pm, id).unwrap();
        assert_eq!(table.count(), 2);
        assert_eq!(table.entries[0], DupEntry::Inline(b"a".to_vec()));
    }

    #[test]
    fn test_dup_table_grows_past_capacity() {
        let tmp = NamedTempFile::new().unwrap();
        let mut pm = new_store(&tmp);

        let a = DupEntry::for_record(&mut pm, b"0").unwrap();
        let b = DupEntry::for_record(&mut pm, b"1").unwrap();
        let mut id = DupTable::create(&mut pm, a, b).unwrap();

        for i in 2..20u8 {
            let mut table = DupTable::read(&mut pm, id).unwrap();
            let entry = DupEntry::for_record(&mut pm, &[b'0' + i]).unwrap();
            table.insert(table.count(), entry);
            id = table.write(&mut pm, id).unwrap();
        }

        let table = DupTable::read(&mut pm, id).unwrap();
        assert_eq!(table.count(), 20);
        assert!(table.capacity >= 20);
    }
}
