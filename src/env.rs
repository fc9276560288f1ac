//! Environment facade
//!
//! The environment owns the device, the page cache, the freelist, the
//! journal and the map of open databases, and serialises mutating
//! operations behind one writer lock. Databases, transactions and
//! cursors are thin handles that keep the environment alive and route
//! every call through it.

use std::path::Path;
use std::sync::Arc;

use fnv::FnvHashMap;
use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::btree::erase::EraseMode;
use crate::btree::insert::DupPosition;
use crate::btree::BtreeIndex;
use crate::cache::PageCache;
use crate::common::header::EnvHeader;
use crate::common::page::PageBuf;
use crate::common::types::{
    ApproxMode, CloseFlags, CursorMove, DEFAULT_CACHE_SIZE, DEFAULT_MAX_DATABASES,
    DEFAULT_PAGE_SIZE, DbFlags, EnvFlags, FreelistPolicy, InsertFlags, KeyType, MAX_PAGE_SIZE,
    MIN_PAGE_SIZE, TxnId,
};
use crate::compressor::CompressorKind;
use crate::cursor::{CursorState, MergeView, Position};
use crate::device::{Device, DiskDevice, InMemDevice, XorCipher};
use crate::errors::{HamError, Result};
use crate::journal::{Journal, JournalRecord, RecordKind};
use crate::page_manager::PageManager;
use crate::txn::{KeyPresence, OpKind, TxnManager, TxnOperation, normalize_key};

/// Number of flushed transactions between two checkpoints.
const CHECKPOINT_INTERVAL: u64 = 64;

/// How a cursor overwrite reaches its target duplicate.
enum OverwriteAction {
    /// The key holds a single record; a plain overwrite replaces it.
    WholeKey,
    /// Replace the stored duplicate at this index in place.
    Stored(usize),
    /// The target is a pending operation of the cursor's own
    /// transaction: spend it and re-append the new record (the
    /// replay-equivalent erase uses the second field).
    PendingOp(crate::txn::OpIndex, usize),
}

/// Options accepted when creating or opening an environment.
#[derive(Clone)]
pub struct Options {
    pub page_size: usize,
    pub cache_size: usize,
    pub max_databases: u16,
    pub file_mode: u32,
    pub flags: EnvFlags,
    pub file_size_limit: u64,
    pub freelist_policy: FreelistPolicy,
    pub journal_compression: CompressorKind,
    pub encryption_key: Option<[u8; 16]>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            max_databases: DEFAULT_MAX_DATABASES,
            file_mode: 0o644,
            flags: EnvFlags::empty(),
            file_size_limit: 0,
            freelist_policy: FreelistPolicy::Full,
            journal_compression: CompressorKind::None,
            encryption_key: None,
        }
    }
}

impl Options {
    fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(HamError::InvParameter(
                "page_size must be a power of two between 1 KiB and 128 KiB",
            ));
        }
        if self.max_databases == 0
            || self.max_databases > EnvHeader::max_databases_for(self.page_size)
        {
            return Err(HamError::InvParameter(
                "max_databases does not fit the header page",
            ));
        }
        if !self.journal_compression.is_available() {
            return Err(HamError::NotImplemented);
        }
        Ok(())
    }
}

/// Options accepted when creating a database.
#[derive(Clone)]
pub struct DbOptions {
    pub flags: DbFlags,
    pub key_type: KeyType,
    /// fixed key length; 0 means variable
    pub key_size: u16,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            flags: DbFlags::empty(),
            key_type: KeyType::Binary,
            key_size: 0,
        }
    }
}

/// Parameters reported for one database.
#[derive(Debug, Clone, PartialEq)]
pub struct DbParameters {
    pub name: u16,
    pub flags: DbFlags,
    pub key_type: KeyType,
    pub key_size: u16,
    pub record_count: u64,
    pub recno_counter: u64,
}

/// One open database inside the environment.
pub(crate) struct DbState {
    pub(crate) descriptor: usize,
    pub(crate) index: BtreeIndex,
    pub(crate) flags: DbFlags,
    pub(crate) key_type: KeyType,
    pub(crate) key_size: u16,
    pub(crate) cursor_count: u32,
}

pub(crate) struct EnvCore {
    config: Options,
    pm: PageManager,
    journal: Option<Journal>,
    txns: TxnManager,
    dbs: FnvHashMap<u16, DbState>,
    cursors: FnvHashMap<u64, CursorState>,
    next_cursor: u64,
    flushed_txns: u64,
    closed: bool,
}

impl EnvCore {
    ///////////////////////////////////////////////////////////////////////////
    // Lifecycle
    ///////////////////////////////////////////////////////////////////////////

    fn create(path: &Path, options: Options) -> Result<EnvCore> {
        options.validate()?;
        let flags = options.flags;

        let device = if flags.contains(EnvFlags::IN_MEMORY) {
            Device::InMem(InMemDevice::new(options.page_size))
        } else {
            let transform = options
                .encryption_key
                .map(|key| Box::new(XorCipher::new(key)) as Box<dyn crate::device::PageTransform>);
            Device::Disk(DiskDevice::create(
                path,
                options.file_mode,
                options.file_size_limit,
                transform,
            )?)
        };

        let cache = PageCache::new(
            options.cache_size,
            options.page_size,
            flags.contains(EnvFlags::CACHE_STRICT),
        );
        let mut header = EnvHeader::new(
            options.page_size as u32,
            options.max_databases,
            flags,
            options.file_size_limit,
            options.freelist_policy,
        );
        header.set_journal_codec(options.journal_compression as u8);

        let pm = PageManager::create(device, cache, header)?;

        let journal = if Self::wants_journal(flags) {
            Some(Journal::create(path, options.journal_compression)?)
        } else {
            None
        };

        let mut core = EnvCore {
            config: options,
            pm,
            journal,
            txns: TxnManager::new(),
            dbs: FnvHashMap::default(),
            cursors: FnvHashMap::default(),
            next_cursor: 1,
            flushed_txns: 0,
            closed: false,
        };
        core.mark_dirty()?;
        core.publish_changeset()?;
        info!("environment created");
        Ok(core)
    }

    fn open(path: &Path, options: Options) -> Result<EnvCore> {
        let flags = options.flags;
        if flags.contains(EnvFlags::IN_MEMORY) {
            return Err(HamError::InvParameter(
                "an in-memory environment cannot be reopened",
            ));
        }

        let transform = options
            .encryption_key
            .map(|key| Box::new(XorCipher::new(key)) as Box<dyn crate::device::PageTransform>);
        let mut device =
            DiskDevice::open(path, flags, options.file_size_limit, transform)?;

        // the header page tells us the real page size
        let mut probe = vec![0u8; MIN_PAGE_SIZE];
        device.read(0, &mut probe)?;
        let probe_page = PageBuf::from_vec(probe);
        let page_size = {
            let payload = probe_page.payload();
            crate::common::read_u32(payload, 12) as usize
        };
        if !page_size.is_power_of_two() || page_size < MIN_PAGE_SIZE || page_size > MAX_PAGE_SIZE {
            return Err(HamError::IntegrityViolated);
        }

        let header_page = PageBuf::from_vec({
            let mut buf = vec![0u8; page_size];
            device.read(0, &mut buf)?;
            buf
        });
        let header = EnvHeader::read_from(&header_page)?;

        let codec = CompressorKind::from_u8(header.journal_codec())
            .ok_or(HamError::NotImplemented)?;
        let mut journal = if Self::wants_journal(flags) {
            Some(Journal::open(path, codec)?)
        } else {
            None
        };

        let mut device = Device::Disk(device);
        let mut recovered_records = None;
        if !header.is_clean_shutdown() {
            if journal.is_none() || !flags.contains(EnvFlags::AUTO_RECOVERY) {
                warn!("environment was not shut down cleanly");
                return Err(HamError::NotReady);
            }
            let records = journal.as_mut().unwrap().read_all()?;
            debug!("recovering {} journal records", records.len());

            // phase 1: replay page images so the store is physically
            // consistent with the last logged flush
            for record in &records {
                if record.kind == RecordKind::PageWrite {
                    let (addr, image) = record.parse_page_write()?;
                    if image.len() != page_size {
                        return Err(HamError::IntegrityViolated);
                    }
                    device.write_page(addr, &PageBuf::from_vec(image.to_vec()))?;
                }
            }
            device.flush()?;
            recovered_records = Some(records);
        }

        let cache = PageCache::new(
            options.cache_size,
            page_size,
            flags.contains(EnvFlags::CACHE_STRICT),
        );
        let pm = PageManager::open(device, cache, page_size)?;

        let mut core = EnvCore {
            config: Options {
                page_size,
                max_databases: pm.header().max_databases(),
                ..options
            },
            pm,
            journal,
            txns: TxnManager::new(),
            dbs: FnvHashMap::default(),
            cursors: FnvHashMap::default(),
            next_cursor: 1,
            flushed_txns: 0,
            closed: false,
        };

        if let Some(records) = recovered_records {
            // the persisted freelist may predate the replayed flushes
            core.pm.clear_freelist();
            core.replay_committed(&records)?;
            core.checkpoint()?;
            info!("recovery complete");
        }
        if !flags.contains(EnvFlags::READ_ONLY) {
            core.mark_dirty()?;
            core.publish_changeset()?;
        }
        Ok(core)
    }

    fn wants_journal(flags: EnvFlags) -> bool {
        !flags.contains(EnvFlags::IN_MEMORY)
            && !flags.contains(EnvFlags::READ_ONLY)
            && (flags.contains(EnvFlags::ENABLE_RECOVERY)
                || flags.contains(EnvFlags::ENABLE_TRANSACTIONS))
    }

    fn transactions_enabled(&self) -> bool {
        self.config.flags.contains(EnvFlags::ENABLE_TRANSACTIONS)
    }

    fn assert_open(&self) -> Result<()> {
        if self.closed {
            return Err(HamError::InvParameter("environment is closed"));
        }
        Ok(())
    }

    fn assert_writable(&self) -> Result<()> {
        self.assert_open()?;
        if self.config.flags.contains(EnvFlags::READ_ONLY) {
            return Err(HamError::AccessDenied);
        }
        Ok(())
    }

    /// Flags the header page so a crash is detected at the next open.
    fn mark_dirty(&mut self) -> Result<()> {
        if self.journal.is_some() {
            self.pm.header_mut().set_clean_shutdown(false);
            self.pm.write_header()?;
        }
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////
    // Changeset publication
    ///////////////////////////////////////////////////////////////////////////

    /// Publishes the pages dirtied by the current operation: their
    /// images reach the journal first, then the store.
    fn publish_changeset(&mut self) -> Result<()> {
        if let Some(journal) = &mut self.journal {
            let addrs = self.pm.changeset().to_vec();
            if !addrs.is_empty() {
                let lsn = self.txns.next_lsn();
                for addr in addrs {
                    if let Some(page) = self.pm.dirty_page(addr) {
                        journal.append(&JournalRecord::page_write(lsn, addr, page.as_slice()))?;
                    }
                }
                journal.sync()?;
            }
        }
        self.pm.flush_changeset()
    }

    /// Runs a mutating closure as one atomic top-level operation.
    fn mutate<T>(&mut self, f: impl FnOnce(&mut EnvCore) -> Result<T>) -> Result<T> {
        match f(self) {
            Ok(value) => {
                self.publish_changeset()?;
                Ok(value)
            }
            Err(e) => {
                self.pm.discard_changeset();
                Err(e)
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Databases
    ///////////////////////////////////////////////////////////////////////////

    fn create_db(&mut self, name: u16, options: DbOptions) -> Result<()> {
        self.assert_writable()?;
        if name == 0 {
            return Err(HamError::InvParameter("database name 0 is reserved"));
        }
        if options.flags.contains(DbFlags::RECORD_NUMBER)
            && options.flags.contains(DbFlags::ENABLE_DUPLICATES)
        {
            return Err(HamError::InvParameter(
                "record-number databases cannot store duplicates",
            ));
        }
        if self.pm.header().find_database(name).is_some() {
            return Err(HamError::DatabaseAlreadyExists);
        }
        let slot = self
            .pm
            .header()
            .find_free_slot()
            .ok_or(HamError::LimitsReached)?;

        let (key_type, key_size) = if options.flags.contains(DbFlags::RECORD_NUMBER) {
            // record numbers are 8-byte big-endian counters; their
            // byte order sorts them correctly
            (KeyType::Binary, 8)
        } else {
            match options.key_type.fixed_size() {
                Some(size) => {
                    if options.key_size != 0 && options.key_size != size {
                        return Err(HamError::InvParameter(
                            "key_size contradicts the key type",
                        ));
                    }
                    (options.key_type, size)
                }
                None => (options.key_type, options.key_size),
            }
        };

        self.mutate(|core| {
            {
                let desc = core.pm.header_mut().descriptor_mut(slot);
                desc.name = name;
                desc.flags = options.flags.bits();
                desc.key_type = key_type.to_u16();
                desc.key_size = key_size;
                desc.record_count = 0;
                desc.recno_counter = 0;
            }
            let index = BtreeIndex::create(
                &mut core.pm,
                slot,
                key_type,
                options.flags.contains(DbFlags::ENABLE_DUPLICATES),
            )?;
            core.dbs.insert(
                name,
                DbState {
                    descriptor: slot,
                    index,
                    flags: options.flags,
                    key_type,
                    key_size,
                    cursor_count: 0,
                },
            );
            Ok(())
        })
    }

    fn open_db(&mut self, name: u16) -> Result<()> {
        self.assert_open()?;
        if self.dbs.contains_key(&name) {
            return Err(HamError::DatabaseAlreadyOpen);
        }
        let slot = self
            .pm
            .header()
            .find_database(name)
            .ok_or(HamError::DatabaseNotFound)?;

        let desc = self.pm.header().descriptor(slot).clone();
        let flags = DbFlags::from_bits_truncate(desc.flags);
        let key_type = desc.key_type();
        let index = BtreeIndex::open(
            slot,
            desc.root_page,
            key_type,
            flags.contains(DbFlags::ENABLE_DUPLICATES),
        );
        self.dbs.insert(
            name,
            DbState {
                descriptor: slot,
                index,
                flags,
                key_type,
                key_size: desc.key_size,
                cursor_count: 0,
            },
        );
        Ok(())
    }

    fn close_db(&mut self, name: u16, flags: CloseFlags) -> Result<()> {
        let Some(db) = self.dbs.get(&name) else {
            return Ok(());
        };
        if db.cursor_count > 0 {
            if !flags.contains(CloseFlags::AUTO_CLEANUP) {
                return Err(HamError::CursorStillOpen);
            }
            self.cursors.retain(|_, c| c.db != name);
        }
        self.dbs.remove(&name);
        Ok(())
    }

    fn rename_db(&mut self, old: u16, new: u16) -> Result<()> {
        self.assert_writable()?;
        if new == 0 {
            return Err(HamError::InvParameter("database name 0 is reserved"));
        }
        if self.dbs.contains_key(&old) {
            return Err(HamError::DatabaseAlreadyOpen);
        }
        if self.pm.header().find_database(new).is_some() {
            return Err(HamError::DatabaseAlreadyExists);
        }
        let slot = self
            .pm
            .header()
            .find_database(old)
            .ok_or(HamError::DatabaseNotFound)?;

        self.mutate(|core| {
            core.pm.header_mut().descriptor_mut(slot).name = new;
            core.pm.write_header()
        })
    }

    fn erase_db(&mut self, name: u16) -> Result<()> {
        self.assert_writable()?;
        if self.dbs.contains_key(&name) {
            return Err(HamError::DatabaseAlreadyOpen);
        }
        if self.txns.has_tree_entries(name) {
            return Err(HamError::TxnStillOpen);
        }
        let slot = self
            .pm
            .header()
            .find_database(name)
            .ok_or(HamError::DatabaseNotFound)?;

        self.mutate(|core| {
            let desc = core.pm.header().descriptor(slot).clone();
            let mut index = BtreeIndex::open(
                slot,
                desc.root_page,
                desc.key_type(),
                DbFlags::from_bits_truncate(desc.flags).contains(DbFlags::ENABLE_DUPLICATES),
            );
            index.drop_tree(&mut core.pm)?;
            *core.pm.header_mut().descriptor_mut(slot) = Default::default();
            core.pm.write_header()?;
            core.pm.reclaim()
        })
    }

    fn database_names(&self) -> Vec<u16> {
        self.pm.header().database_names()
    }

    fn db_parameters(&self, name: u16) -> Result<DbParameters> {
        let db = self.db(name)?;
        let desc = self.pm.header().descriptor(db.descriptor);
        Ok(DbParameters {
            name,
            flags: db.flags,
            key_type: db.key_type,
            key_size: db.key_size,
            record_count: desc.record_count,
            recno_counter: desc.recno_counter,
        })
    }

    fn db(&self, name: u16) -> Result<&DbState> {
        self.dbs.get(&name).ok_or(HamError::DatabaseNotFound)
    }

    fn db_mut(&mut self, name: u16) -> Result<&mut DbState> {
        self.dbs.get_mut(&name).ok_or(HamError::DatabaseNotFound)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Transactions
    ///////////////////////////////////////////////////////////////////////////

    fn txn_begin(&mut self, read_only: bool) -> Result<TxnId> {
        self.assert_open()?;
        if !self.transactions_enabled() {
            return Err(HamError::InvParameter(
                "environment was opened without transaction support",
            ));
        }
        let id = self.txns.begin(read_only, false);
        self.journal_txn(RecordKind::TxnBegin, id)?;
        Ok(id)
    }

    fn journal_txn(&mut self, kind: RecordKind, id: TxnId) -> Result<()> {
        if let Some(journal) = &mut self.journal {
            let lsn = self.txns.next_lsn();
            journal.append(&JournalRecord::txn_boundary(kind, lsn, id))?;
            journal.sync()?;
        }
        Ok(())
    }

    fn txn_commit(&mut self, id: TxnId) -> Result<()> {
        self.assert_open()?;
        if self.txns.record(id)?.cursor_refcount > 0 {
            return Err(HamError::CursorStillOpen);
        }
        self.txns.commit(id)?;
        self.journal_txn(RecordKind::TxnCommit, id)?;
        self.flush_committed()
    }

    fn txn_abort(&mut self, id: TxnId) -> Result<()> {
        self.assert_open()?;
        if self.txns.record(id)?.cursor_refcount > 0 {
            return Err(HamError::CursorStillOpen);
        }
        self.journal_txn(RecordKind::TxnAbort, id)?;
        self.txns.abort(id)
    }

    /// Applies the leading committed transactions to the B-tree and
    /// publishes the page changes. Operations are merged across the
    /// batch and applied in lsn order, so on overlapping keys the
    /// later write wins regardless of which transaction began first.
    fn flush_committed(&mut self) -> Result<()> {
        let batch = self.txns.flushable_batch();
        if batch.is_empty() {
            return Ok(());
        }

        let mut all_ops: Vec<crate::txn::OpIndex> =
            batch.iter().flat_map(|(_, ops)| ops.iter().copied()).collect();
        all_ops.sort_by_key(|&idx| self.txns.op(idx).lsn);

        match self.apply_txn_ops(&all_ops) {
            Ok(()) => {
                if let Some(journal) = &mut self.journal {
                    for (id, _) in &batch {
                        let lsn = self.txns.next_lsn();
                        journal.append(&JournalRecord::txn_boundary(
                            RecordKind::FlushTxn,
                            lsn,
                            *id,
                        ))?;
                    }
                }
                self.publish_changeset()?;
                for (id, _) in &batch {
                    self.txns.retire(*id);
                    self.flushed_txns += 1;
                }
            }
            Err(e) => {
                self.pm.discard_changeset();
                return Err(e);
            }
        }

        if self.flushed_txns % CHECKPOINT_INTERVAL == 0 {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn apply_txn_ops(&mut self, ops: &[crate::txn::OpIndex]) -> Result<()> {
        for &idx in ops {
            let op = self.txns.op(idx).clone();
            self.apply_op(&op)?;
        }
        Ok(())
    }

    fn apply_op(&mut self, op: &TxnOperation) -> Result<()> {
        let db = self
            .dbs
            .get_mut(&op.db)
            .ok_or(HamError::DatabaseNotFound)?;

        match op.kind {
            OpKind::Nop => Ok(()),
            OpKind::Insert => db
                .index
                .insert(&mut self.pm, &op.key, &op.record, InsertFlags::empty(), DupPosition::Last)
                .map(|_| ()),
            OpKind::InsertOverwrite => match op.dup_ref {
                Some(dup) => db
                    .index
                    .overwrite_duplicate(&mut self.pm, &op.key, dup, &op.record),
                None => db
                    .index
                    .insert(
                        &mut self.pm,
                        &op.key,
                        &op.record,
                        InsertFlags::OVERWRITE,
                        DupPosition::Last,
                    )
                    .map(|_| ()),
            },
            OpKind::InsertDuplicate => {
                let pos = if op.flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
                    DupPosition::First
                } else if op.flags.contains(InsertFlags::DUPLICATE_INSERT_BEFORE) {
                    DupPosition::Before(op.dup_ref.unwrap_or(0))
                } else if op.flags.contains(InsertFlags::DUPLICATE_INSERT_AFTER) {
                    DupPosition::After(op.dup_ref.unwrap_or(0))
                } else {
                    DupPosition::Last
                };
                db.index
                    .insert(&mut self.pm, &op.key, &op.record, InsertFlags::DUPLICATE, pos)
                    .map(|_| ())
            }
            OpKind::Erase => {
                let mode = match op.dup_ref {
                    Some(dup) => EraseMode::Duplicate(dup),
                    None => EraseMode::WholeKey,
                };
                db.index.erase(&mut self.pm, &op.key, mode)
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Insert / find / erase
    ///////////////////////////////////////////////////////////////////////////

    /// Validates the key against the database configuration and
    /// assigns record numbers. Returns the key actually stored.
    fn effective_key(&mut self, name: u16, key: &[u8], flags: InsertFlags) -> Result<Vec<u8>> {
        let (db_flags, db_key_type, db_key_size, descriptor) = {
            let db = self.db(name)?;
            (db.flags, db.key_type, db.key_size, db.descriptor)
        };

        if db_flags.contains(DbFlags::RECORD_NUMBER) {
            if key.is_empty() {
                if flags.contains(InsertFlags::OVERWRITE) {
                    return Err(HamError::InvParameter(
                        "overwriting a record number requires the key",
                    ));
                }
                let next = self.pm.header().descriptor(descriptor).recno_counter + 1;
                self.pm.header_mut().descriptor_mut(descriptor).recno_counter = next;
                return Ok(next.to_be_bytes().to_vec());
            }
            if key.len() != 8 {
                return Err(HamError::InvParameter(
                    "record-number keys are 8 bytes",
                ));
            }
            let value = u64::from_be_bytes(key.try_into().unwrap());
            let desc = self.pm.header_mut().descriptor_mut(descriptor);
            if value > desc.recno_counter {
                desc.recno_counter = value;
            }
            return Ok(key.to_vec());
        }

        if let Some(fixed) = db_key_type.fixed_size() {
            if key.len() != fixed as usize {
                return Err(HamError::InvParameter("key length contradicts key type"));
            }
        } else if db_key_size != 0 && key.len() != db_key_size as usize {
            return Err(HamError::InvParameter("database uses fixed-size keys"));
        }
        if key.is_empty() {
            return Err(HamError::InvParameter("zero-length key"));
        }
        Ok(key.to_vec())
    }

    fn validate_insert_flags(&self, name: u16, flags: InsertFlags) -> Result<()> {
        let db = self.db(name)?;
        if db.flags.contains(DbFlags::READ_ONLY) {
            return Err(HamError::AccessDenied);
        }
        if flags.contains(InsertFlags::OVERWRITE) && flags.contains(InsertFlags::DUPLICATE) {
            return Err(HamError::InvParameter(
                "overwrite and duplicate exclude each other",
            ));
        }
        if flags.contains(InsertFlags::DUPLICATE)
            && !db.flags.contains(DbFlags::ENABLE_DUPLICATES)
        {
            return Err(HamError::InvParameter(
                "database was created without duplicate support",
            ));
        }
        if db.flags.contains(DbFlags::RECORD_NUMBER) && flags.contains(InsertFlags::DUPLICATE) {
            return Err(HamError::InvParameter(
                "record-number databases cannot store duplicates",
            ));
        }
        Ok(())
    }

    fn insert(
        &mut self,
        name: u16,
        txn: Option<TxnId>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        dup_ref: Option<usize>,
    ) -> Result<Vec<u8>> {
        self.assert_writable()?;
        self.validate_insert_flags(name, flags)?;

        self.mutate(|core| {
            let key = core.effective_key(name, key, flags)?;

            if !core.transactions_enabled() {
                let db = core.dbs.get_mut(&name).unwrap();
                db.index.insert(
                    &mut core.pm,
                    &key,
                    record,
                    flags,
                    dup_position(flags, dup_ref),
                )?;
                return Ok(key);
            }

            let (txn_id, temporary) = match txn {
                Some(id) => {
                    if !core.txns.is_active(id) {
                        return Err(HamError::InvParameter("transaction is closed"));
                    }
                    (id, false)
                }
                None => {
                    let id = core.txns.begin(false, true);
                    core.journal_txn(RecordKind::TxnBegin, id)?;
                    (id, true)
                }
            };

            let result = core.txn_insert(name, txn_id, &key, record, flags, dup_ref);
            if temporary {
                match result {
                    Ok(()) => {
                        core.txns.commit(txn_id)?;
                        core.journal_txn(RecordKind::TxnCommit, txn_id)?;
                        core.flush_committed()?;
                    }
                    Err(e) => {
                        core.journal_txn(RecordKind::TxnAbort, txn_id)?;
                        core.txns.abort(txn_id)?;
                        return Err(e);
                    }
                }
            } else {
                result?;
            }
            Ok(key)
        })
    }

    /// Records an insert in the transaction tree after the conflict
    /// and duplicate checks.
    fn txn_insert(
        &mut self,
        name: u16,
        txn_id: TxnId,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        dup_ref: Option<usize>,
    ) -> Result<()> {
        let db = self.db(name)?;
        let key_type = db.key_type;
        let norm = normalize_key(key_type, key);

        let presence = self.txns.check_write_conflict(name, &norm, txn_id)?;
        let exists = match presence {
            KeyPresence::Present(_) => true,
            KeyPresence::Erased => false,
            KeyPresence::Unknown => {
                let db = self.dbs.get_mut(&name).unwrap();
                db.index.find(&mut self.pm, key, ApproxMode::Exact)?.is_some()
            }
        };
        if exists
            && !flags.contains(InsertFlags::OVERWRITE)
            && !flags.contains(InsertFlags::DUPLICATE)
        {
            return Err(HamError::DuplicateKey);
        }

        let kind = if flags.contains(InsertFlags::OVERWRITE) {
            OpKind::InsertOverwrite
        } else if flags.contains(InsertFlags::DUPLICATE) && exists {
            OpKind::InsertDuplicate
        } else {
            OpKind::Insert
        };

        let (_, lsn) = self.txns.append_op(
            name,
            key_type,
            TxnOperation {
                kind,
                flags,
                lsn: 0,
                txn_id,
                db: name,
                key: key.to_vec(),
                norm_key: Vec::new(),
                record: record.to_vec(),
                dup_ref,
            },
        )?;

        if let Some(journal) = &mut self.journal {
            journal.append(&JournalRecord::insert(lsn, txn_id, name, key, record, flags))?;
            journal.sync()?;
        }
        Ok(())
    }

    fn erase(
        &mut self,
        name: u16,
        txn: Option<TxnId>,
        key: &[u8],
        dup_ref: Option<usize>,
    ) -> Result<()> {
        self.assert_writable()?;
        if self.db(name)?.flags.contains(DbFlags::READ_ONLY) {
            return Err(HamError::AccessDenied);
        }

        self.mutate(|core| {
            if !core.transactions_enabled() {
                let db = core.dbs.get_mut(&name).unwrap();
                let mode = match dup_ref {
                    Some(dup) => EraseMode::Duplicate(dup),
                    None => EraseMode::WholeKey,
                };
                return db.index.erase(&mut core.pm, key, mode);
            }

            let (txn_id, temporary) = match txn {
                Some(id) => {
                    if !core.txns.is_active(id) {
                        return Err(HamError::InvParameter("transaction is closed"));
                    }
                    (id, false)
                }
                None => {
                    let id = core.txns.begin(false, true);
                    core.journal_txn(RecordKind::TxnBegin, id)?;
                    (id, true)
                }
            };

            let result = core.txn_erase(name, txn_id, key, dup_ref);
            if temporary {
                match result {
                    Ok(()) => {
                        core.txns.commit(txn_id)?;
                        core.journal_txn(RecordKind::TxnCommit, txn_id)?;
                        core.flush_committed()?;
                    }
                    Err(e) => {
                        core.journal_txn(RecordKind::TxnAbort, txn_id)?;
                        core.txns.abort(txn_id)?;
                        return Err(e);
                    }
                }
                Ok(())
            } else {
                result
            }
        })
    }

    fn txn_erase(
        &mut self,
        name: u16,
        txn_id: TxnId,
        key: &[u8],
        dup_ref: Option<usize>,
    ) -> Result<()> {
        let key_type = self.db(name)?.key_type;
        let norm = normalize_key(key_type, key);

        let presence = self.txns.check_write_conflict(name, &norm, txn_id)?;
        let exists = match presence {
            KeyPresence::Present(_) => true,
            KeyPresence::Erased => false,
            KeyPresence::Unknown => {
                let db = self.dbs.get_mut(&name).unwrap();
                db.index.find(&mut self.pm, key, ApproxMode::Exact)?.is_some()
            }
        };
        if !exists {
            return Err(HamError::KeyNotFound);
        }

        let (_, lsn) = self.txns.append_op(
            name,
            key_type,
            TxnOperation {
                kind: OpKind::Erase,
                flags: InsertFlags::empty(),
                lsn: 0,
                txn_id,
                db: name,
                key: key.to_vec(),
                norm_key: Vec::new(),
                record: Vec::new(),
                dup_ref,
            },
        )?;

        if let Some(journal) = &mut self.journal {
            journal.append(&JournalRecord::erase(lsn, txn_id, name, key, dup_ref))?;
            journal.sync()?;
        }
        Ok(())
    }

    fn find(
        &mut self,
        name: u16,
        txn: Option<TxnId>,
        key: &[u8],
        approx: ApproxMode,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        self.assert_open()?;
        let mut view = self.merge_view(name, txn)?;
        let position = view.find(key, approx)?.ok_or(HamError::KeyNotFound)?;
        let record = view.record_at(&position)?;
        Ok((position.key, record))
    }

    fn merge_view(&mut self, name: u16, viewer: Option<TxnId>) -> Result<MergeView<'_>> {
        let db = self
            .dbs
            .get_mut(&name)
            .ok_or(HamError::DatabaseNotFound)?;
        Ok(MergeView {
            pm: &mut self.pm,
            index: &mut db.index,
            txns: &self.txns,
            db: name,
            key_type: db.key_type,
            viewer,
        })
    }

    fn key_count(&mut self, name: u16, txn: Option<TxnId>) -> Result<u64> {
        self.assert_open()?;
        if !self.txns.has_tree_entries(name) {
            let db = self.dbs.get_mut(&name).ok_or(HamError::DatabaseNotFound)?;
            return db.index.key_count(&mut self.pm, true);
        }

        // pending operations force a merged scan
        let mut view = self.merge_view(name, txn)?;
        let mut count = 0u64;
        let mut pos = view.scan(None, true, true)?;
        while let Some(p) = pos {
            count += view.dup_view(&p.key)?.total() as u64;
            pos = view.scan(Some(&p.key), true, false)?;
        }
        Ok(count)
    }

    fn check_integrity(&mut self, name: u16) -> Result<()> {
        self.assert_open()?;
        let db = self.dbs.get_mut(&name).ok_or(HamError::DatabaseNotFound)?;
        db.index.check_integrity(&mut self.pm)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Partial records
    ///////////////////////////////////////////////////////////////////////////

    fn find_partial(
        &mut self,
        name: u16,
        key: &[u8],
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>> {
        self.assert_open()?;
        if self.transactions_enabled() {
            return Err(HamError::InvParameter(
                "partial records are not available with transactions",
            ));
        }

        let db = self.dbs.get_mut(&name).ok_or(HamError::DatabaseNotFound)?;
        let found = db
            .index
            .find(&mut self.pm, key, ApproxMode::Exact)?
            .ok_or(HamError::KeyNotFound)?;
        let (_, slot) = db.index.entry_at(&mut self.pm, found.leaf, found.slot)?;

        match crate::btree::RecordRef::from_slot(&slot) {
            crate::btree::RecordRef::Inline(data) => {
                let start = (offset as usize).min(data.len());
                let end = (offset as usize + size as usize).min(data.len());
                Ok(data[start..end].to_vec())
            }
            crate::btree::RecordRef::Blob(id) => {
                crate::blob::BlobManager::read_partial(&mut self.pm, id, offset, size)
            }
            crate::btree::RecordRef::DupTable(_) => Err(HamError::InvParameter(
                "partial reads do not support duplicate keys",
            )),
        }
    }

    fn insert_partial(
        &mut self,
        name: u16,
        key: &[u8],
        data: &[u8],
        offset: u64,
        total_size: u64,
    ) -> Result<()> {
        self.assert_writable()?;
        if self.transactions_enabled() {
            return Err(HamError::InvParameter(
                "partial records are not available with transactions",
            ));
        }
        if offset + data.len() as u64 > total_size {
            return Err(HamError::InvParameter(
                "partial window exceeds the record size",
            ));
        }

        self.mutate(|core| {
            let db = core.dbs.get_mut(&name).ok_or(HamError::DatabaseNotFound)?;
            let existing = db.index.find(&mut core.pm, key, ApproxMode::Exact)?;

            if let Some(found) = existing {
                let (_, slot) = db.index.entry_at(&mut core.pm, found.leaf, found.slot)?;
                if let crate::btree::RecordRef::Blob(id) =
                    crate::btree::RecordRef::from_slot(&slot)
                {
                    // only while the slot keeps pointing at the same
                    // blob; a relocation goes through the rebuild path
                    let header = crate::blob::BlobManager::read_header(&mut core.pm, id)?;
                    if total_size <= header.allocated_size() {
                        crate::blob::BlobManager::overwrite_partial(
                            &mut core.pm,
                            id,
                            offset,
                            data,
                            total_size,
                        )?;
                        return Ok(());
                    }
                }
            }

            // rebuild the record in memory for inline keys, fresh
            // keys and growth past the allocation
            let mut full = match existing {
                Some(found) => {
                    let (_, slot) = db.index.entry_at(&mut core.pm, found.leaf, found.slot)?;
                    BtreeIndex::slot_record(&mut core.pm, &slot)?
                }
                None => Vec::new(),
            };
            full.resize(total_size as usize, 0);
            full[offset as usize..offset as usize + data.len()].copy_from_slice(data);
            db.index
                .insert(
                    &mut core.pm,
                    key,
                    &full,
                    InsertFlags::OVERWRITE,
                    DupPosition::Last,
                )
                .map(|_| ())
        })
    }

    ///////////////////////////////////////////////////////////////////////////
    // Flush / checkpoint / close
    ///////////////////////////////////////////////////////////////////////////

    fn flush(&mut self) -> Result<()> {
        self.assert_open()?;
        if self.config.flags.contains(EnvFlags::READ_ONLY) || self.pm.is_in_memory() {
            return Ok(());
        }
        self.publish_changeset()?;
        self.pm.flush_all()
    }

    /// Makes the whole store durable and resets the journal.
    fn checkpoint(&mut self) -> Result<()> {
        if self.pm.is_in_memory() {
            return Ok(());
        }
        self.pm.persist_freelist()?;
        self.publish_changeset()?;
        self.pm.flush_all()?;
        if let Some(journal) = &mut self.journal {
            journal.reset()?;
            let lsn = self.txns.next_lsn();
            let freelist_root = self.pm.header().freelist_root();
            journal.append(&JournalRecord::checkpoint(lsn, freelist_root))?;
            journal.sync()?;
        }
        debug!("checkpoint complete");
        Ok(())
    }

    fn close(&mut self, flags: CloseFlags) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        if !self.cursors.is_empty() {
            if !flags.contains(CloseFlags::AUTO_CLEANUP) {
                return Err(HamError::CursorStillOpen);
            }
            let ids: Vec<u64> = self.cursors.keys().copied().collect();
            for id in ids {
                self.cursor_close(id);
            }
        }

        let open_txns = self.txns.active_txns();
        if !open_txns.is_empty() {
            if flags.contains(CloseFlags::TXN_AUTO_COMMIT) {
                for id in open_txns {
                    self.txn_commit(id)?;
                }
            } else {
                for id in open_txns {
                    self.journal_txn(RecordKind::TxnAbort, id)?;
                    self.txns.abort(id)?;
                }
            }
        }
        let open_dbs: Vec<u16> = self.dbs.keys().copied().collect();
        for name in open_dbs {
            self.close_db(name, flags)?;
        }

        self.flush_committed()?;

        if !self.config.flags.contains(EnvFlags::READ_ONLY) && !self.pm.is_in_memory() {
            self.pm.persist_freelist()?;
            self.pm.header_mut().bump_serialno();
            self.pm.header_mut().set_clean_shutdown(true);
            self.pm.write_header()?;
            self.publish_changeset()?;
            self.pm.flush_all()?;
            self.pm.reclaim()?;
        }

        if let Some(journal) = self.journal.take() {
            journal.remove_file()?;
        }

        // release the file handle and with it the advisory lock
        let page_size = self.pm.page_size();
        drop(std::mem::replace(
            self.pm.device_mut(),
            Device::InMem(InMemDevice::new(page_size)),
        ));

        self.closed = true;
        info!("environment closed");
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////
    // Recovery
    ///////////////////////////////////////////////////////////////////////////

    /// Re-applies committed transactions whose flush never reached
    /// the store. Runs against a freshly opened page manager whose
    /// pages already carry the replayed images.
    fn replay_committed(&mut self, records: &[JournalRecord]) -> Result<()> {
        use std::collections::{HashMap, HashSet};

        let mut committed: HashMap<TxnId, u64> = HashMap::new();
        let mut flushed: HashSet<TxnId> = HashSet::new();
        let mut max_lsn = 0;
        for record in records {
            max_lsn = max_lsn.max(record.lsn);
            match record.kind {
                RecordKind::TxnCommit => {
                    committed.insert(record.txn_id, record.lsn);
                }
                RecordKind::FlushTxn => {
                    flushed.insert(record.txn_id);
                }
                _ => {}
            }
        }
        self.txns.observe_lsn(max_lsn);

        let mut replay: Vec<TxnId> = committed
            .keys()
            .copied()
            .filter(|id| !flushed.contains(id))
            .collect();
        replay.sort_by_key(|id| committed[id]);

        for txn_id in replay {
            debug!("replaying committed txn {}", txn_id);
            for record in records {
                if record.txn_id != txn_id {
                    continue;
                }
                match record.kind {
                    RecordKind::Insert => {
                        let (key, data, flags) = record.parse_insert()?;
                        self.ensure_db_open(record.db)?;
                        let db = self.dbs.get_mut(&record.db).unwrap();
                        db.index.insert(
                            &mut self.pm,
                            &key,
                            &data,
                            flags & (InsertFlags::OVERWRITE | InsertFlags::DUPLICATE),
                            DupPosition::Last,
                        )?;
                    }
                    RecordKind::Erase => {
                        let (key, dup) = record.parse_erase()?;
                        self.ensure_db_open(record.db)?;
                        let db = self.dbs.get_mut(&record.db).unwrap();
                        let mode = match dup {
                            Some(dup) => EraseMode::Duplicate(dup),
                            None => EraseMode::WholeKey,
                        };
                        db.index.erase(&mut self.pm, &key, mode)?;
                    }
                    _ => {}
                }
            }
            self.publish_changeset()?;
        }

        // replay opened databases the application never asked for
        let replayed: Vec<u16> = self.dbs.keys().copied().collect();
        for name in replayed {
            self.close_db(name, CloseFlags::empty())?;
        }
        Ok(())
    }

    fn ensure_db_open(&mut self, name: u16) -> Result<()> {
        if self.dbs.contains_key(&name) {
            return Ok(());
        }
        self.open_db(name)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Cursors
    ///////////////////////////////////////////////////////////////////////////

    fn cursor_create(&mut self, db: u16, txn: Option<TxnId>) -> Result<u64> {
        self.assert_open()?;
        self.db(db)?;
        if let Some(id) = txn {
            if !self.txns.is_active(id) {
                return Err(HamError::InvParameter("transaction is closed"));
            }
            self.txns.add_cursor_ref(id);
        }

        let id = self.next_cursor;
        self.next_cursor += 1;
        self.cursors.insert(id, CursorState::new(db, txn));
        self.db_mut(db)?.cursor_count += 1;
        Ok(id)
    }

    fn cursor_clone(&mut self, cursor: u64) -> Result<u64> {
        self.assert_open()?;
        let state = self.cursor(cursor)?;
        let clone = CursorState {
            db: state.db,
            txn: state.txn,
            pos: state.pos.clone(),
        };
        if let Some(txn) = clone.txn {
            self.txns.add_cursor_ref(txn);
        }

        let id = self.next_cursor;
        self.next_cursor += 1;
        self.db_mut(clone.db)?.cursor_count += 1;
        self.cursors.insert(id, clone);
        Ok(id)
    }

    fn cursor_close(&mut self, cursor: u64) {
        if let Some(state) = self.cursors.remove(&cursor) {
            if let Some(txn) = state.txn {
                self.txns.release_cursor_ref(txn);
            }
            if let Some(db) = self.dbs.get_mut(&state.db) {
                db.cursor_count = db.cursor_count.saturating_sub(1);
            }
        }
    }

    fn cursor(&self, cursor: u64) -> Result<&CursorState> {
        self.cursors
            .get(&cursor)
            .ok_or(HamError::InvParameter("unknown cursor"))
    }

    fn cursor_move(&mut self, cursor: u64, step: CursorMove) -> Result<(Vec<u8>, Vec<u8>)> {
        self.assert_open()?;
        let state = self.cursor(cursor)?;
        let db = state.db;
        let txn = state.txn;
        let current = state.pos.clone();

        let mut view = self.merge_view(db, txn)?;
        let position = match step {
            CursorMove::First => view.scan(None, true, true)?,
            CursorMove::Last => view.scan(None, false, true)?,
            CursorMove::Next => match &current {
                // stepping a fresh cursor starts at the edge
                None => view.scan(None, true, true)?,
                Some(pos) => view.scan(Some(&pos.key), true, false)?,
            },
            CursorMove::Previous => match &current {
                None => view.scan(None, false, true)?,
                Some(pos) => view.scan(Some(&pos.key), false, false)?,
            },
            CursorMove::NextDuplicate => {
                let pos = current.as_ref().ok_or(HamError::CursorIsNil)?;
                Some(view.move_duplicate(pos, true)?)
            }
            CursorMove::PreviousDuplicate => {
                let pos = current.as_ref().ok_or(HamError::CursorIsNil)?;
                Some(view.move_duplicate(pos, false)?)
            }
        };

        let position = position.ok_or(HamError::KeyNotFound)?;
        let record = view.record_at(&position)?;
        let key = position.key.clone();
        self.cursors.get_mut(&cursor).unwrap().pos = Some(position);
        Ok((key, record))
    }

    fn cursor_find(
        &mut self,
        cursor: u64,
        key: &[u8],
        approx: ApproxMode,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        self.assert_open()?;
        let state = self.cursor(cursor)?;
        let db = state.db;
        let txn = state.txn;

        let mut view = self.merge_view(db, txn)?;
        let position = view.find(key, approx)?.ok_or(HamError::KeyNotFound)?;
        let record = view.record_at(&position)?;
        let found = position.key.clone();
        self.cursors.get_mut(&cursor).unwrap().pos = Some(position);
        Ok((found, record))
    }

    fn cursor_insert(
        &mut self,
        cursor: u64,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        let state = self.cursor(cursor)?;
        let db = state.db;
        let txn = state.txn;
        let dup_ref = state.pos.as_ref().map(|p| p.dup_index);

        let stored_key = self.insert(db, txn, key, record, flags, dup_ref)?;

        let dup_index = if flags.contains(InsertFlags::DUPLICATE) {
            let mut view = self.merge_view(db, txn)?;
            let count_before = view.dup_view(&stored_key)?.total().saturating_sub(1);
            dup_position(flags, dup_ref).index(count_before)
        } else {
            0
        };
        self.cursors.get_mut(&cursor).unwrap().pos = Some(Position {
            key: stored_key,
            side: crate::cursor::ActiveSide::Txn,
            dup_index,
            is_approximate: false,
        });
        Ok(())
    }

    fn cursor_overwrite(&mut self, cursor: u64, record: &[u8]) -> Result<()> {
        let state = self.cursor(cursor)?;
        let db = state.db;
        let txn = state.txn;
        let pos = state.position()?.clone();

        self.assert_writable()?;

        if !self.transactions_enabled() {
            return self.mutate(|core| {
                let db_state = core.dbs.get_mut(&db).unwrap();
                db_state.index.overwrite_duplicate(
                    &mut core.pm,
                    &pos.key,
                    pos.dup_index,
                    record,
                )
            });
        }

        // translate the combined duplicate index; a pending duplicate
        // of this transaction is spent and the record re-appended
        let action = {
            let mut view = self.merge_view(db, txn)?;
            let dup = view.dup_view(&pos.key)?;
            if dup.total() <= 1 {
                OverwriteAction::WholeKey
            } else if pos.dup_index < dup.ops.len() {
                let idx = dup.ops[pos.dup_index];
                if txn == Some(self.txns.op(idx).txn_id) {
                    OverwriteAction::PendingOp(idx, dup.stored + pos.dup_index)
                } else {
                    // committed but not yet flushed: its future
                    // stored position
                    OverwriteAction::Stored(dup.stored + pos.dup_index)
                }
            } else {
                OverwriteAction::Stored(pos.dup_index - dup.ops.len())
            }
        };

        self.mutate(|core| {
            let (txn_id, temporary) = match txn {
                Some(id) => {
                    if !core.txns.is_active(id) {
                        return Err(HamError::InvParameter("transaction is closed"));
                    }
                    (id, false)
                }
                None => {
                    let id = core.txns.begin(false, true);
                    core.journal_txn(RecordKind::TxnBegin, id)?;
                    (id, true)
                }
            };

            let result = match action {
                OverwriteAction::WholeKey => core.txn_insert(
                    db,
                    txn_id,
                    &pos.key,
                    record,
                    InsertFlags::OVERWRITE,
                    None,
                ),
                OverwriteAction::Stored(stored) => core.append_dup_overwrite_op(
                    db,
                    txn_id,
                    &pos.key,
                    record,
                    stored,
                ),
                OverwriteAction::PendingOp(op, replay_index) => core
                    .spend_pending_op(db, Some(txn_id), &pos.key, op, replay_index)
                    .and_then(|()| {
                        core.txn_insert(
                            db,
                            txn_id,
                            &pos.key,
                            record,
                            InsertFlags::DUPLICATE,
                            None,
                        )
                    }),
            };

            if temporary {
                match result {
                    Ok(()) => {
                        core.txns.commit(txn_id)?;
                        core.journal_txn(RecordKind::TxnCommit, txn_id)?;
                        core.flush_committed()
                    }
                    Err(e) => {
                        core.journal_txn(RecordKind::TxnAbort, txn_id)?;
                        core.txns.abort(txn_id)?;
                        Err(e)
                    }
                }
            } else {
                result
            }
        })
    }

    /// Records an in-place overwrite of one stored duplicate.
    fn append_dup_overwrite_op(
        &mut self,
        db: u16,
        txn_id: TxnId,
        key: &[u8],
        record: &[u8],
        stored_index: usize,
    ) -> Result<()> {
        let key_type = self.db(db)?.key_type;
        let (_, lsn) = self.txns.append_op(
            db,
            key_type,
            TxnOperation {
                kind: OpKind::InsertOverwrite,
                flags: InsertFlags::OVERWRITE,
                lsn: 0,
                txn_id,
                db,
                key: key.to_vec(),
                norm_key: Vec::new(),
                record: record.to_vec(),
                dup_ref: Some(stored_index),
            },
        )?;

        if let Some(journal) = &mut self.journal {
            journal.append(&JournalRecord::insert(
                lsn,
                txn_id,
                db,
                key,
                record,
                InsertFlags::OVERWRITE,
            ))?;
            journal.sync()?;
        }
        Ok(())
    }

    /// Turns a pending duplicate insert of `txn` into a nop and logs
    /// the equivalent erase, so a replay of the committed transaction
    /// converges to the same state (`replay_index` is the position the
    /// duplicate would hold once the journal replayed its insert).
    fn spend_pending_op(
        &mut self,
        db: u16,
        txn: Option<TxnId>,
        key: &[u8],
        op: crate::txn::OpIndex,
        replay_index: usize,
    ) -> Result<()> {
        let txn_id = match txn {
            Some(id) => id,
            None => self.txns.op(op).txn_id,
        };
        self.txns.nullify_op(op);

        if let Some(journal) = &mut self.journal {
            let lsn = self.txns.next_lsn();
            journal.append(&JournalRecord::erase(
                lsn,
                txn_id,
                db,
                key,
                Some(replay_index),
            ))?;
            journal.sync()?;
        }
        Ok(())
    }

    fn cursor_erase(&mut self, cursor: u64) -> Result<()> {
        let state = self.cursor(cursor)?;
        let db = state.db;
        let txn = state.txn;
        let pos = state.position()?.clone();

        // translate the combined duplicate index into a stored one
        let dup_ref = {
            let mut view = self.merge_view(db, txn)?;
            let dup = view.dup_view(&pos.key)?;
            if dup.total() <= 1 {
                None
            } else if pos.dup_index < dup.ops.len() {
                let idx = dup.ops[pos.dup_index];
                if txn == Some(self.txns.op(idx).txn_id) {
                    // a pending operation of this very transaction is
                    // spent instead of erased
                    self.spend_pending_op(db, txn, &pos.key, idx, dup.stored + pos.dup_index)?;
                    self.cursors.get_mut(&cursor).unwrap().pos = None;
                    return Ok(());
                }
                // a committed-but-unflushed duplicate: address it by
                // the position it will hold once its insert applied
                Some(dup.stored + pos.dup_index)
            } else {
                Some(pos.dup_index - dup.ops.len())
            }
        };

        self.erase(db, txn, &pos.key, dup_ref)?;
        self.cursors.get_mut(&cursor).unwrap().pos = None;
        Ok(())
    }

    fn cursor_dup_count(&mut self, cursor: u64) -> Result<usize> {
        self.assert_open()?;
        let state = self.cursor(cursor)?;
        let db = state.db;
        let txn = state.txn;
        let pos = state.position()?.clone();

        let mut view = self.merge_view(db, txn)?;
        let dup = view.dup_view(&pos.key)?;
        if dup.total() == 0 {
            return Err(HamError::CursorIsNil);
        }
        Ok(dup.total())
    }

    fn cursor_record_size(&mut self, cursor: u64) -> Result<u64> {
        self.assert_open()?;
        let state = self.cursor(cursor)?;
        let db = state.db;
        let txn = state.txn;
        let pos = state.position()?.clone();

        let mut view = self.merge_view(db, txn)?;
        view.record_size_at(&pos)
    }
}

impl Drop for EnvCore {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close(CloseFlags::AUTO_CLEANUP) {
                warn!("implicit close failed: {}", e);
            }
        }
    }
}

fn dup_position(flags: InsertFlags, dup_ref: Option<usize>) -> DupPosition {
    if flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
        DupPosition::First
    } else if flags.contains(InsertFlags::DUPLICATE_INSERT_BEFORE) {
        DupPosition::Before(dup_ref.unwrap_or(0))
    } else if flags.contains(InsertFlags::DUPLICATE_INSERT_AFTER) {
        DupPosition::After(dup_ref.unwrap_or(0))
    } else {
        DupPosition::Last
    }
}

///
/// The public environment handle. Cheap to clone; every clone talks
/// to the same store.
///
#[derive(Clone)]
pub struct Environment {
    core: Arc<RwLock<EnvCore>>,
}

impl Environment {
    /// Creates a new environment file (truncating an existing one)
    /// and opens it.
    pub fn create<P: AsRef<Path>>(path: P, options: Options) -> Result<Environment> {
        Ok(Environment {
            core: Arc::new(RwLock::new(EnvCore::create(path.as_ref(), options)?)),
        })
    }

    /// Opens an existing environment file.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Environment> {
        Ok(Environment {
            core: Arc::new(RwLock::new(EnvCore::open(path.as_ref(), options)?)),
        })
    }

    /// Closes the environment. Open transactions are committed or
    /// aborted per `flags`; open cursors and databases require
    /// `AUTO_CLEANUP`.
    pub fn close(&self, flags: CloseFlags) -> Result<()> {
        self.core.write().close(flags)
    }

    /// Writes every dirty page back to the device and syncs it.
    pub fn flush(&self) -> Result<()> {
        self.core.write().flush()
    }

    pub fn get_parameters(&self) -> Options {
        self.core.read().config.clone()
    }

    /// Names of all databases in the environment.
    pub fn database_names(&self) -> Vec<u16> {
        self.core.read().database_names()
    }

    pub fn create_db(&self, name: u16, options: DbOptions) -> Result<crate::db::Database> {
        self.core.write().create_db(name, options)?;
        Ok(crate::db::Database::new(self.clone(), name))
    }

    pub fn open_db(&self, name: u16) -> Result<crate::db::Database> {
        self.core.write().open_db(name)?;
        Ok(crate::db::Database::new(self.clone(), name))
    }

    pub fn rename_db(&self, old: u16, new: u16) -> Result<()> {
        self.core.write().rename_db(old, new)
    }

    pub fn erase_db(&self, name: u16) -> Result<()> {
        self.core.write().erase_db(name)
    }

    /// Starts a transaction.
    pub fn txn_begin(&self, read_only: bool) -> Result<Transaction> {
        let id = self.core.write().txn_begin(read_only)?;
        Ok(Transaction {
            env: self.clone(),
            id,
            done: false,
        })
    }

    pub(crate) fn core(&self) -> &Arc<RwLock<EnvCore>> {
        &self.core
    }
}

///
/// A unit of atomic change. Commit applies every operation; abort
/// drops them. A transaction dropped without either is aborted.
///
pub struct Transaction {
    env: Environment,
    pub(crate) id: TxnId,
    done: bool,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.env.core().write().txn_commit(self.id)
    }

    pub fn abort(mut self) -> Result<()> {
        self.done = true;
        self.env.core().write().txn_abort(self.id)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done {
            let mut core = self.env.core().write();
            if core.txns.is_active(self.id) {
                if let Err(e) = core.txn_abort(self.id) {
                    warn!("implicit abort of txn {} failed: {}", self.id, e);
                }
            }
        }
    }
}

// EnvCore is only reachable behind the lock.
unsafe impl Send for EnvCore {}
unsafe impl Sync for EnvCore {}

/// Cross-module access for the database and cursor handles.
impl EnvCore {
    pub(crate) fn api_insert(
        &mut self,
        db: u16,
        txn: Option<TxnId>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<Vec<u8>> {
        self.insert(db, txn, key, record, flags, None)
    }

    pub(crate) fn api_find(
        &mut self,
        db: u16,
        txn: Option<TxnId>,
        key: &[u8],
        approx: ApproxMode,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        self.find(db, txn, key, approx)
    }

    pub(crate) fn api_erase(
        &mut self,
        db: u16,
        txn: Option<TxnId>,
        key: &[u8],
    ) -> Result<()> {
        self.erase(db, txn, key, None)
    }

    pub(crate) fn api_key_count(&mut self, db: u16, txn: Option<TxnId>) -> Result<u64> {
        self.key_count(db, txn)
    }

    pub(crate) fn api_check_integrity(&mut self, db: u16) -> Result<()> {
        self.check_integrity(db)
    }

    pub(crate) fn api_db_parameters(&self, db: u16) -> Result<DbParameters> {
        self.db_parameters(db)
    }

    pub(crate) fn api_close_db(&mut self, db: u16, flags: CloseFlags) -> Result<()> {
        self.close_db(db, flags)
    }

    pub(crate) fn api_find_partial(
        &mut self,
        db: u16,
        key: &[u8],
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>> {
        self.find_partial(db, key, offset, size)
    }

    pub(crate) fn api_insert_partial(
        &mut self,
        db: u16,
        key: &[u8],
        data: &[u8],
        offset: u64,
        total_size: u64,
    ) -> Result<()> {
        self.insert_partial(db, key, data, offset, total_size)
    }

    pub(crate) fn api_cursor_create(&mut self, db: u16, txn: Option<TxnId>) -> Result<u64> {
        self.cursor_create(db, txn)
    }

    pub(crate) fn api_cursor_clone(&mut self, cursor: u64) -> Result<u64> {
        self.cursor_clone(cursor)
    }

    pub(crate) fn api_cursor_close(&mut self, cursor: u64) {
        self.cursor_close(cursor)
    }

    pub(crate) fn api_cursor_move(
        &mut self,
        cursor: u64,
        step: CursorMove,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        self.cursor_move(cursor, step)
    }

    pub(crate) fn api_cursor_find(
        &mut self,
        cursor: u64,
        key: &[u8],
        approx: ApproxMode,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        self.cursor_find(cursor, key, approx)
    }

    pub(crate) fn api_cursor_insert(
        &mut self,
        cursor: u64,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        self.cursor_insert(cursor, key, record, flags)
    }

    pub(crate) fn api_cursor_overwrite(&mut self, cursor: u64, record: &[u8]) -> Result<()> {
        self.cursor_overwrite(cursor, record)
    }

    pub(crate) fn api_cursor_erase(&mut self, cursor: u64) -> Result<()> {
        self.cursor_erase(cursor)
    }

    pub(crate) fn api_cursor_dup_count(&mut self, cursor: u64) -> Result<usize> {
        self.cursor_dup_count(cursor)
    }

    pub(crate) fn api_cursor_record_size(&mut self, cursor: u64) -> Result<u64> {
        self.cursor_record_size(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnv;

    fn small_options(flags: EnvFlags) -> Options {
        Options {
            page_size: 1024,
            flags,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_reopen() {
        let env = TestEnv::with_options(small_options(EnvFlags::empty())).unwrap();
        let db = env.create_db(1, DbOptions::default()).unwrap();
        db.insert(None, b"hello", b"world", InsertFlags::empty()).unwrap();
        assert_eq!(db.find(None, b"hello").unwrap(), b"world");

        let file = {
            env.close(CloseFlags::AUTO_CLEANUP).unwrap();
            env.into_path()
        };

        let env = Environment::open(file.path(), small_options(EnvFlags::empty())).unwrap();
        let db = env.open_db(1).unwrap();
        assert_eq!(db.find(None, b"hello").unwrap(), b"world");
        assert_eq!(db.find(None, b"helloX"), Err(HamError::KeyNotFound));
        env.close(CloseFlags::AUTO_CLEANUP).unwrap();
    }

    #[test]
    fn test_database_lifecycle() {
        let env = TestEnv::new().unwrap();

        let db = env.create_db(7, DbOptions::default()).unwrap();
        assert_eq!(
            env.create_db(7, DbOptions::default()).err(),
            Some(HamError::DatabaseAlreadyExists)
        );
        assert_eq!(env.open_db(7).err(), Some(HamError::DatabaseAlreadyOpen));
        assert_eq!(env.open_db(9).err(), Some(HamError::DatabaseNotFound));

        db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();
        db.close(CloseFlags::empty()).unwrap();

        // rename and erase only work on closed databases
        env.rename_db(7, 8).unwrap();
        assert_eq!(env.database_names(), vec![8]);
        let db = env.open_db(8).unwrap();
        assert_eq!(db.find(None, b"k").unwrap(), b"v");
        db.close(CloseFlags::empty()).unwrap();

        env.erase_db(8).unwrap();
        assert_eq!(env.open_db(8).err(), Some(HamError::DatabaseNotFound));
        assert!(env.database_names().is_empty());
    }

    #[test]
    fn test_close_refuses_open_cursor() {
        let env = TestEnv::new().unwrap();
        let db = env.create_db(1, DbOptions::default()).unwrap();
        db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

        let cursor = db.cursor(None).unwrap();
        assert_eq!(
            env.close(CloseFlags::empty()).err(),
            Some(HamError::CursorStillOpen)
        );
        drop(cursor);
        env.close(CloseFlags::empty()).err(); // databases still open
        env.close(CloseFlags::AUTO_CLEANUP).unwrap();
    }

    #[test]
    fn test_in_memory_environment() {
        let env = Environment::create(
            "unused",
            Options {
                flags: EnvFlags::IN_MEMORY,
                page_size: 1024,
                ..Default::default()
            },
        )
        .unwrap();
        let db = env.create_db(1, DbOptions::default()).unwrap();

        db.insert(None, b"a", b"1", InsertFlags::empty()).unwrap();
        let big = vec![9u8; 5000];
        db.insert(None, b"b", &big, InsertFlags::empty()).unwrap();
        assert_eq!(db.find(None, b"a").unwrap(), b"1");
        assert_eq!(db.find(None, b"b").unwrap(), big);

        db.erase(None, b"a").unwrap();
        assert_eq!(db.find(None, b"a"), Err(HamError::KeyNotFound));
        env.close(CloseFlags::AUTO_CLEANUP).unwrap();
    }

    #[test]
    fn test_record_number_database() {
        let env = TestEnv::new().unwrap();
        let db = env
            .create_db(
                1,
                DbOptions {
                    flags: DbFlags::RECORD_NUMBER,
                    ..Default::default()
                },
            )
            .unwrap();

        let k1 = db.insert(None, b"", b"a", InsertFlags::empty()).unwrap();
        let k2 = db.insert(None, b"", b"b", InsertFlags::empty()).unwrap();
        let k3 = db.insert(None, b"", b"c", InsertFlags::empty()).unwrap();
        assert_eq!(k1, 1u64.to_be_bytes());
        assert_eq!(k2, 2u64.to_be_bytes());
        assert_eq!(k3, 3u64.to_be_bytes());

        // erasing the middle key does not disturb the counter
        db.erase(None, &k2).unwrap();
        let k4 = db.insert(None, b"", b"d", InsertFlags::empty()).unwrap();
        assert_eq!(k4, 4u64.to_be_bytes());

        // a wrongly sized key is rejected
        assert_eq!(
            db.insert(None, b"xy", b"e", InsertFlags::empty()).err(),
            Some(HamError::InvParameter("record-number keys are 8 bytes"))
        );

        let params = db.get_parameters().unwrap();
        assert_eq!(params.recno_counter, 4);
    }

    #[test]
    fn test_recno_counter_survives_reopen() {
        let env = TestEnv::new().unwrap();
        {
            let db = env
                .create_db(
                    1,
                    DbOptions {
                        flags: DbFlags::RECORD_NUMBER,
                        ..Default::default()
                    },
                )
                .unwrap();
            for record in [b"a", b"b", b"c", b"d"] {
                db.insert(None, b"", record, InsertFlags::empty()).unwrap();
            }
            db.close(CloseFlags::empty()).unwrap();
        }
        env.close(CloseFlags::AUTO_CLEANUP).unwrap();
        let file = env.into_path();

        let env = Environment::open(file.path(), Options::default()).unwrap();
        let db = env.open_db(1).unwrap();
        let k5 = db.insert(None, b"", b"e", InsertFlags::empty()).unwrap();
        assert_eq!(k5, 5u64.to_be_bytes());
        env.close(CloseFlags::AUTO_CLEANUP).unwrap();
    }

    #[test]
    fn test_partial_records() {
        let env = TestEnv::new().unwrap();
        let db = env.create_db(1, DbOptions::default()).unwrap();

        db.insert(None, b"k", &vec![b'x'; 100], InsertFlags::empty())
            .unwrap();
        db.insert_partial(b"k", b"YYY", 10, 100).unwrap();

        let window = db.find_partial(b"k", 9, 5).unwrap();
        assert_eq!(window, b"xYYYx");

        // bytes outside the window are unchanged
        let full = db.find(None, b"k").unwrap();
        assert_eq!(full.len(), 100);
        assert_eq!(&full[..10], &[b'x'; 10]);
        assert_eq!(&full[10..13], b"YYY");
        assert_eq!(&full[13..], &vec![b'x'; 87][..]);

        // a window past the total size is rejected
        assert!(matches!(
            db.insert_partial(b"k", b"zz", 99, 100),
            Err(HamError::InvParameter(_))
        ));
    }

    #[test]
    fn test_partial_rejected_with_transactions() {
        let env = TestEnv::with_options(small_options(EnvFlags::ENABLE_TRANSACTIONS)).unwrap();
        let db = env.create_db(1, DbOptions::default()).unwrap();

        db.insert(None, b"k", b"0123456789", InsertFlags::empty())
            .unwrap();
        assert!(matches!(
            db.insert_partial(b"k", b"z", 1, 10),
            Err(HamError::InvParameter(_))
        ));
        assert!(matches!(
            db.find_partial(b"k", 0, 4),
            Err(HamError::InvParameter(_))
        ));
    }

    #[test]
    fn test_txn_commit_and_abort() {
        let env = TestEnv::with_options(small_options(EnvFlags::ENABLE_TRANSACTIONS)).unwrap();
        let db = env.create_db(1, DbOptions::default()).unwrap();

        let txn = env.txn_begin(false).unwrap();
        db.insert(Some(&txn), b"a", b"1", InsertFlags::empty()).unwrap();
        // invisible to an outside reader until the commit
        assert_eq!(db.find(None, b"a"), Err(HamError::KeyNotFound));
        // but visible within the transaction
        assert_eq!(db.find(Some(&txn), b"a").unwrap(), b"1");
        txn.commit().unwrap();
        assert_eq!(db.find(None, b"a").unwrap(), b"1");

        let txn = env.txn_begin(false).unwrap();
        db.insert(Some(&txn), b"b", b"2", InsertFlags::empty()).unwrap();
        txn.abort().unwrap();
        assert_eq!(db.find(None, b"b"), Err(HamError::KeyNotFound));
    }

    #[test]
    fn test_txn_erase_shadows_committed_key() {
        let env = TestEnv::with_options(small_options(EnvFlags::ENABLE_TRANSACTIONS)).unwrap();
        let db = env.create_db(1, DbOptions::default()).unwrap();

        db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

        let txn = env.txn_begin(false).unwrap();
        db.erase(Some(&txn), b"k").unwrap();
        // erased inside the txn, still present outside
        assert_eq!(db.find(Some(&txn), b"k"), Err(HamError::KeyNotFound));
        assert_eq!(db.find(None, b"k").unwrap(), b"v");
        txn.commit().unwrap();
        assert_eq!(db.find(None, b"k"), Err(HamError::KeyNotFound));
    }

    #[test]
    fn test_read_only_txn() {
        let env = TestEnv::with_options(small_options(EnvFlags::ENABLE_TRANSACTIONS)).unwrap();
        let db = env.create_db(1, DbOptions::default()).unwrap();
        db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

        let txn = env.txn_begin(true).unwrap();
        assert_eq!(db.find(Some(&txn), b"k").unwrap(), b"v");
        assert_eq!(
            db.insert(Some(&txn), b"x", b"y", InsertFlags::empty()).err(),
            Some(HamError::AccessDenied)
        );
        txn.abort().unwrap();
    }

    #[test]
    fn test_numeric_key_ordering() {
        let env = TestEnv::with_options(small_options(EnvFlags::ENABLE_TRANSACTIONS)).unwrap();
        let db = env
            .create_db(
                1,
                DbOptions {
                    key_type: KeyType::U32,
                    ..Default::default()
                },
            )
            .unwrap();

        // 300 > 5 numerically but not lexicographically over LE bytes
        db.insert(None, &300u32.to_le_bytes(), b"hi", InsertFlags::empty())
            .unwrap();
        db.insert(None, &5u32.to_le_bytes(), b"lo", InsertFlags::empty())
            .unwrap();

        let cursor = db.cursor(None).unwrap();
        let (key, record) = cursor.move_to(CursorMove::First).unwrap();
        assert_eq!(key, 5u32.to_le_bytes());
        assert_eq!(record, b"lo");
        let (key, _) = cursor.move_to(CursorMove::Next).unwrap();
        assert_eq!(key, 300u32.to_le_bytes());
        drop(cursor);

        // pending numeric keys merge in numeric order as well
        let txn = env.txn_begin(false).unwrap();
        db.insert(Some(&txn), &40u32.to_le_bytes(), b"mid", InsertFlags::empty())
            .unwrap();
        let (key, _) = db
            .find_approx(Some(&txn), &35u32.to_le_bytes(), ApproxMode::Geq)
            .unwrap();
        assert_eq!(key, 40u32.to_le_bytes());
        txn.abort().unwrap();

        // a key of the wrong width is rejected
        assert_eq!(
            db.insert(None, b"abc", b"x", InsertFlags::empty()).err(),
            Some(HamError::InvParameter("key length contradicts key type"))
        );
    }

    #[test]
    fn test_key_count_merges_pending_ops() {
        let env = TestEnv::with_options(small_options(EnvFlags::ENABLE_TRANSACTIONS)).unwrap();
        let db = env.create_db(1, DbOptions::default()).unwrap();

        db.insert(None, b"a", b"1", InsertFlags::empty()).unwrap();
        db.insert(None, b"b", b"2", InsertFlags::empty()).unwrap();
        assert_eq!(db.key_count(None).unwrap(), 2);

        let txn = env.txn_begin(false).unwrap();
        db.insert(Some(&txn), b"c", b"3", InsertFlags::empty()).unwrap();
        db.erase(Some(&txn), b"a").unwrap();

        assert_eq!(db.key_count(Some(&txn)).unwrap(), 2);
        txn.commit().unwrap();
        assert_eq!(db.key_count(None).unwrap(), 2);
    }
}
