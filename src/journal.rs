//! Write-ahead log.
//!
//! Every page mutation and every transaction boundary appends a
//! length-prefixed record to an append-only journal file sequenced by
//! lsn. No dirty page reaches its final location before the record
//! describing its new contents is durable; a checkpoint rewrites the
//! durable summary and resets the file. Recovery replays the page
//! images in lsn order and re-applies committed transactions whose
//! flush never made it to the store.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use fnv::FnvHasher;
use log::{debug, warn};
use std::hash::Hasher;

use crate::common::types::{InsertFlags, Lsn, PageAddr, TxnId};
use crate::common::{read_u32, read_u64};
use crate::compressor::{Compressor, CompressorKind, for_kind};
use crate::errors::{HamError, Result};

/// Marker of every record: 'H', 'J', 'L', '\0'.
const RECORD_MAGIC: u32 = u32::from_le_bytes(*b"HJL\0");

/// |magic(u32)|kind(u8)|codec(u8)|reserved(u16)|lsn(u64)|txn(u64)|
/// |db(u16)|payload_len(u32)|checksum(u64)|
const RECORD_HEADER_SIZE: usize = 38;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub(crate) enum RecordKind {
    TxnBegin = 1,
    TxnCommit = 2,
    TxnAbort = 3,
    Insert = 4,
    Erase = 5,
    PageWrite = 6,
    /// The pages of this transaction's flush follow as PageWrite
    /// records; during recovery replaying those images completes the
    /// flush, so the logical records need no second application.
    FlushTxn = 7,
    Checkpoint = 8,
}

impl RecordKind {
    fn from_u8(v: u8) -> Option<RecordKind> {
        match v {
            1 => Some(RecordKind::TxnBegin),
            2 => Some(RecordKind::TxnCommit),
            3 => Some(RecordKind::TxnAbort),
            4 => Some(RecordKind::Insert),
            5 => Some(RecordKind::Erase),
            6 => Some(RecordKind::PageWrite),
            7 => Some(RecordKind::FlushTxn),
            8 => Some(RecordKind::Checkpoint),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct JournalRecord {
    pub(crate) kind: RecordKind,
    pub(crate) lsn: Lsn,
    pub(crate) txn_id: TxnId,
    pub(crate) db: u16,
    pub(crate) payload: Vec<u8>,
}

impl JournalRecord {
    pub(crate) fn txn_boundary(kind: RecordKind, lsn: Lsn, txn_id: TxnId) -> JournalRecord {
        JournalRecord {
            kind,
            lsn,
            txn_id,
            db: 0,
            payload: Vec::new(),
        }
    }

    pub(crate) fn insert(
        lsn: Lsn,
        txn_id: TxnId,
        db: u16,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> JournalRecord {
        let mut payload = BytesMut::with_capacity(12 + key.len() + record.len());
        payload.put_u32_le(key.len() as u32);
        payload.put_slice(key);
        payload.put_u32_le(record.len() as u32);
        payload.put_slice(record);
        payload.put_u32_le(flags.bits());
        JournalRecord {
            kind: RecordKind::Insert,
            lsn,
            txn_id,
            db,
            payload: payload.to_vec(),
        }
    }

    pub(crate) fn parse_insert(&self) -> Result<(Vec<u8>, Vec<u8>, InsertFlags)> {
        let p = &self.payload;
        if p.len() < 4 {
            return Err(HamError::IntegrityViolated);
        }
        let key_len = read_u32(p, 0) as usize;
        if p.len() < 8 + key_len {
            return Err(HamError::IntegrityViolated);
        }
        let key = p[4..4 + key_len].to_vec();
        let record_len = read_u32(p, 4 + key_len) as usize;
        if p.len() < 12 + key_len + record_len {
            return Err(HamError::IntegrityViolated);
        }
        let record = p[8 + key_len..8 + key_len + record_len].to_vec();
        let flags = InsertFlags::from_bits_truncate(read_u32(p, 8 + key_len + record_len));
        Ok((key, record, flags))
    }

    pub(crate) fn erase(
        lsn: Lsn,
        txn_id: TxnId,
        db: u16,
        key: &[u8],
        dup_index: Option<usize>,
    ) -> JournalRecord {
        let mut payload = BytesMut::with_capacity(12 + key.len());
        payload.put_u32_le(key.len() as u32);
        payload.put_slice(key);
        payload.put_i64_le(dup_index.map(|i| i as i64).unwrap_or(-1));
        JournalRecord {
            kind: RecordKind::Erase,
            lsn,
            txn_id,
            db,
            payload: payload.to_vec(),
        }
    }

    pub(crate) fn parse_erase(&self) -> Result<(Vec<u8>, Option<usize>)> {
        let p = &self.payload;
        if p.len() < 4 {
            return Err(HamError::IntegrityViolated);
        }
        let key_len = read_u32(p, 0) as usize;
        if p.len() < 12 + key_len {
            return Err(HamError::IntegrityViolated);
        }
        let key = p[4..4 + key_len].to_vec();
        let dup = i64::from_le_bytes(p[4 + key_len..12 + key_len].try_into().unwrap());
        Ok((key, (dup >= 0).then_some(dup as usize)))
    }

    pub(crate) fn page_write(lsn: Lsn, addr: PageAddr, image: &[u8]) -> JournalRecord {
        let mut payload = BytesMut::with_capacity(8 + image.len());
        payload.put_u64_le(addr);
        payload.put_slice(image);
        JournalRecord {
            kind: RecordKind::PageWrite,
            lsn,
            txn_id: 0,
            db: 0,
            payload: payload.to_vec(),
        }
    }

    pub(crate) fn parse_page_write(&self) -> Result<(PageAddr, &[u8])> {
        if self.payload.len() < 8 {
            return Err(HamError::IntegrityViolated);
        }
        Ok((read_u64(&self.payload, 0), &self.payload[8..]))
    }

    pub(crate) fn checkpoint(lsn: Lsn, freelist_root: PageAddr) -> JournalRecord {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64_le(freelist_root);
        JournalRecord {
            kind: RecordKind::Checkpoint,
            lsn,
            txn_id: 0,
            db: 0,
            payload: payload.to_vec(),
        }
    }
}

///
/// The append-only journal file of one environment.
///
pub(crate) struct Journal {
    path: PathBuf,
    file: File,
    compressor: Box<dyn Compressor>,
}

impl Journal {
    pub(crate) fn journal_path(env_path: &Path) -> PathBuf {
        let mut name = env_path.as_os_str().to_os_string();
        name.push(".jrn");
        PathBuf::from(name)
    }

    /// Creates a fresh (truncated) journal.
    pub(crate) fn create(env_path: &Path, codec: CompressorKind) -> Result<Journal> {
        let path = Self::journal_path(env_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Journal {
            path,
            file,
            compressor: for_kind(codec)?,
        })
    }

    /// Opens an existing journal, creating an empty one when missing.
    pub(crate) fn open(env_path: &Path, codec: CompressorKind) -> Result<Journal> {
        let path = Self::journal_path(env_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let mut journal = Journal {
            path,
            file,
            compressor: for_kind(codec)?,
        };
        journal.file.seek(SeekFrom::End(0))?;
        Ok(journal)
    }

    /// Appends one record. Durability requires a later
    /// [`Journal::sync`].
    pub(crate) fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let payload = self.compressor.compress(&record.payload);

        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
        buf.put_u32_le(RECORD_MAGIC);
        buf.put_u8(record.kind as u8);
        buf.put_u8(self.compressor.kind() as u8);
        buf.put_u16_le(0);
        buf.put_u64_le(record.lsn);
        buf.put_u64_le(record.txn_id);
        buf.put_u16_le(record.db);
        buf.put_u32_le(payload.len() as u32);

        let mut hasher = FnvHasher::default();
        hasher.write(&buf);
        hasher.write(&payload);
        buf.put_u64_le(hasher.finish());
        buf.put_slice(&payload);

        self.file.write_all(&buf)?;
        Ok(())
    }

    /// Forces appended records to durable storage.
    pub(crate) fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Reads every intact record from the start of the file. A torn
    /// or corrupt tail ends the scan; everything before it is
    /// returned.
    pub(crate) fn read_all(&mut self) -> Result<Vec<JournalRecord>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut raw = Vec::new();
        self.file.read_to_end(&mut raw)?;
        self.file.seek(SeekFrom::End(0))?;

        let mut records = Vec::new();
        let mut off = 0usize;
        while off + RECORD_HEADER_SIZE <= raw.len() {
            let head = &raw[off..off + RECORD_HEADER_SIZE];
            if read_u32(head, 0) != RECORD_MAGIC {
                warn!("journal record at {} has no magic, stopping scan", off);
                break;
            }
            let kind = match RecordKind::from_u8(head[4]) {
                Some(kind) => kind,
                None => {
                    warn!("journal record at {} has unknown kind, stopping scan", off);
                    break;
                }
            };
            let codec = head[5];
            let lsn = read_u64(head, 8);
            let txn_id = read_u64(head, 16);
            let db = crate::common::read_u16(head, 24);
            let payload_len = read_u32(head, 26) as usize;
            let checksum = read_u64(head, 30);

            if off + RECORD_HEADER_SIZE + payload_len > raw.len() {
                debug!("journal ends in a torn record at {}", off);
                break;
            }
            let payload = &raw[off + RECORD_HEADER_SIZE..off + RECORD_HEADER_SIZE + payload_len];

            let mut hasher = FnvHasher::default();
            hasher.write(&head[..RECORD_HEADER_SIZE - 8]);
            hasher.write(payload);
            if hasher.finish() != checksum {
                warn!("journal record at {} fails its checksum, stopping scan", off);
                break;
            }

            if CompressorKind::from_u8(codec) != Some(self.compressor.kind()) {
                return Err(HamError::NotImplemented);
            }

            records.push(JournalRecord {
                kind,
                lsn,
                txn_id,
                db,
                payload: self.compressor.decompress(payload)?,
            });
            off += RECORD_HEADER_SIZE + payload_len;
        }

        Ok(records)
    }

    /// Drops every record after a checkpoint made the prefix
    /// redundant.
    pub(crate) fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Removes the journal file (clean close of the environment).
    pub(crate) fn remove_file(self) -> Result<()> {
        drop(self.file);
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
