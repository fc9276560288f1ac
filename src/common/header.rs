//! The environment header page.
//!
//! Page 0 carries the magic marker, the format version, global
//! configuration and the table of database descriptors. It is read
//! once at open, validated, and written back whenever a descriptor or
//! the freelist bootstrap pointer changes.

use bytemuck::{Pod, Zeroable};
use fnv::FnvHasher;
use memoffset::offset_of;
use std::hash::Hasher;
use std::mem;

use crate::common::page::{PageBuf, PAGE_HEADER_SIZE};
use crate::common::types::{EnvFlags, FreelistPolicy, KeyType, MAGIC, PageAddr, VERSION};
use crate::common::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};
use crate::errors::{HamError, Result};

/// Serialized size of the fixed header region.
pub(crate) const HEADER_FIXED_SIZE: usize = mem::size_of::<HeaderRaw>();

/// Serialized size of one database descriptor.
pub(crate) const DB_DESCRIPTOR_SIZE: usize = 34;

/// Fixed region of the header page payload.
///
///   |magic(u32)|version(u32)|serialno(u32)|page_size(u32)|
///   |max_databases(u16)|clean_shutdown(u8)|journal_codec(u8)|
///   |flags(u32)|file_size_limit(u64)|freelist_policy(u32)|
///   |reserved(u32)|freelist_root(u64)|checksum(u64)|
#[derive(Debug, Default, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct HeaderRaw {
    magic: u32,
    version: u32,
    serialno: u32,
    page_size: u32,
    max_databases: u16,
    clean_shutdown: u8,
    journal_codec: u8,
    flags: u32,
    file_size_limit: u64,
    freelist_policy: u32,
    reserved: u32,
    freelist_root: u64,
    checksum: u64,
}

/// One slot of the database descriptor table. A slot with name 0 is
/// free.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct DbDescriptor {
    pub(crate) name: u16,
    pub(crate) flags: u32,
    pub(crate) key_type: u16,
    pub(crate) key_size: u16,
    pub(crate) root_page: PageAddr,
    pub(crate) record_count: u64,
    pub(crate) recno_counter: u64,
}

impl DbDescriptor {
    pub(crate) fn is_free(&self) -> bool {
        self.name == 0
    }

    pub(crate) fn key_type(&self) -> KeyType {
        KeyType::from_u16(self.key_type).unwrap_or_default()
    }

    fn read_from(buf: &[u8]) -> DbDescriptor {
        DbDescriptor {
            name: read_u16(buf, 0),
            flags: read_u32(buf, 2),
            key_type: read_u16(buf, 6),
            key_size: read_u16(buf, 8),
            root_page: read_u64(buf, 10),
            record_count: read_u64(buf, 18),
            recno_counter: read_u64(buf, 26),
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        write_u16(buf, 0, self.name);
        write_u32(buf, 2, self.flags);
        write_u16(buf, 6, self.key_type);
        write_u16(buf, 8, self.key_size);
        write_u64(buf, 10, self.root_page);
        write_u64(buf, 18, self.record_count);
        write_u64(buf, 26, self.recno_counter);
    }
}

/// In-memory form of the header page.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EnvHeader {
    serialno: u32,
    page_size: u32,
    clean_shutdown: bool,
    journal_codec: u8,
    flags: EnvFlags,
    file_size_limit: u64,
    freelist_policy: FreelistPolicy,
    freelist_root: PageAddr,
    descriptors: Vec<DbDescriptor>,
}

impl EnvHeader {
    pub(crate) fn new(
        page_size: u32,
        max_databases: u16,
        flags: EnvFlags,
        file_size_limit: u64,
        freelist_policy: FreelistPolicy,
    ) -> EnvHeader {
        EnvHeader {
            serialno: 0,
            page_size,
            clean_shutdown: true,
            journal_codec: 0,
            flags,
            file_size_limit,
            freelist_policy,
            freelist_root: 0,
            descriptors: vec![DbDescriptor::default(); max_databases as usize],
        }
    }

    /// Largest descriptor table that fits into one page of `page_size`.
    pub(crate) fn max_databases_for(page_size: usize) -> u16 {
        let payload = page_size - PAGE_HEADER_SIZE - HEADER_FIXED_SIZE;
        (payload / DB_DESCRIPTOR_SIZE).min(u16::MAX as usize) as u16
    }

    /// Reads and validates the header from page 0. Checks the marker
    /// bytes, the version and the checksum.
    pub(crate) fn read_from(page: &PageBuf) -> Result<EnvHeader> {
        let payload = page.payload();
        let raw: &HeaderRaw = bytemuck::from_bytes(&payload[..HEADER_FIXED_SIZE]);

        if raw.magic != MAGIC {
            return Err(HamError::IntegrityViolated);
        }
        if raw.version != VERSION {
            return Err(HamError::InvFileVersion);
        }

        let desc_end =
            HEADER_FIXED_SIZE + raw.max_databases as usize * DB_DESCRIPTOR_SIZE;
        if desc_end > payload.len() {
            return Err(HamError::IntegrityViolated);
        }
        if raw.checksum != 0 && raw.checksum != sum64(payload, raw.max_databases) {
            return Err(HamError::IntegrityViolated);
        }

        let mut descriptors = Vec::with_capacity(raw.max_databases as usize);
        for i in 0..raw.max_databases as usize {
            let off = HEADER_FIXED_SIZE + i * DB_DESCRIPTOR_SIZE;
            descriptors.push(DbDescriptor::read_from(&payload[off..off + DB_DESCRIPTOR_SIZE]));
        }

        Ok(EnvHeader {
            serialno: raw.serialno,
            page_size: raw.page_size,
            clean_shutdown: raw.clean_shutdown != 0,
            journal_codec: raw.journal_codec,
            flags: EnvFlags::from_bits_truncate(raw.flags),
            file_size_limit: raw.file_size_limit,
            freelist_policy: FreelistPolicy::from_u32(raw.freelist_policy)
                .ok_or(HamError::IntegrityViolated)?,
            freelist_root: raw.freelist_root,
            descriptors,
        })
    }

    /// Writes the header onto page 0 and recomputes the checksum.
    pub(crate) fn write_to(&self, page: &mut PageBuf) {
        let max_databases = self.descriptors.len() as u16;
        let payload = page.payload_mut();

        {
            let raw: &mut HeaderRaw =
                bytemuck::from_bytes_mut(&mut payload[..HEADER_FIXED_SIZE]);
            raw.magic = MAGIC;
            raw.version = VERSION;
            raw.serialno = self.serialno;
            raw.page_size = self.page_size;
            raw.max_databases = max_databases;
            raw.clean_shutdown = self.clean_shutdown as u8;
            raw.journal_codec = self.journal_codec;
            raw.flags = self.flags.bits();
            raw.file_size_limit = self.file_size_limit;
            raw.freelist_policy = self.freelist_policy.to_u32();
            raw.reserved = 0;
            raw.freelist_root = self.freelist_root;
            raw.checksum = 0;
        }

        for (i, desc) in self.descriptors.iter().enumerate() {
            let off = HEADER_FIXED_SIZE + i * DB_DESCRIPTOR_SIZE;
            desc.write_to(&mut payload[off..off + DB_DESCRIPTOR_SIZE]);
        }

        let checksum = sum64(payload, max_databases);
        let raw: &mut HeaderRaw = bytemuck::from_bytes_mut(&mut payload[..HEADER_FIXED_SIZE]);
        raw.checksum = checksum;
    }

    pub(crate) fn page_size(&self) -> u32 {
        self.page_size
    }

    pub(crate) fn flags(&self) -> EnvFlags {
        self.flags
    }

    pub(crate) fn bump_serialno(&mut self) {
        self.serialno += 1;
    }

    pub(crate) fn is_clean_shutdown(&self) -> bool {
        self.clean_shutdown
    }

    pub(crate) fn set_clean_shutdown(&mut self, clean: bool) {
        self.clean_shutdown = clean;
    }

    pub(crate) fn journal_codec(&self) -> u8 {
        self.journal_codec
    }

    pub(crate) fn set_journal_codec(&mut self, codec: u8) {
        self.journal_codec = codec;
    }

    pub(crate) fn freelist_policy(&self) -> FreelistPolicy {
        self.freelist_policy
    }

    pub(crate) fn freelist_root(&self) -> PageAddr {
        self.freelist_root
    }

    pub(crate) fn set_freelist_root(&mut self, addr: PageAddr) {
        self.freelist_root = addr;
    }

    pub(crate) fn max_databases(&self) -> u16 {
        self.descriptors.len() as u16
    }

    /// Returns the slot index of the database `name`, if created.
    pub(crate) fn find_database(&self, name: u16) -> Option<usize> {
        self.descriptors
            .iter()
            .position(|d| !d.is_free() && d.name == name)
    }

    /// Returns the index of the first free descriptor slot.
    pub(crate) fn find_free_slot(&self) -> Option<usize> {
        self.descriptors.iter().position(|d| d.is_free())
    }

    pub(crate) fn descriptor(&self, slot: usize) -> &DbDescriptor {
        &self.descriptors[slot]
    }

    pub(crate) fn descriptor_mut(&mut self, slot: usize) -> &mut DbDescriptor {
        &mut self.descriptors[slot]
    }

    /// Names of all created databases, in slot order.
    pub(crate) fn database_names(&self) -> Vec<u16> {
        self.descriptors
            .iter()
            .filter(|d| !d.is_free())
            .map(|d| d.name)
            .collect()
    }
}

/// Generates the checksum for the header payload: everything before
/// the checksum field plus the descriptor table.
fn sum64(payload: &[u8], max_databases: u16) -> u64 {
    let desc_end = HEADER_FIXED_SIZE + max_databases as usize * DB_DESCRIPTOR_SIZE;
    let mut h = FnvHasher::default();
    h.write(&payload[..offset_of!(HeaderRaw, checksum)]);
    h.write(&payload[HEADER_FIXED_SIZE..desc_end]);
    h.finish()
}
