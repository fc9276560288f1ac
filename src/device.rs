//! Device
//!
//! Page-addressable storage behind the page cache. A device is either
//! a block file on disk or a private memory arena; the rest of the
//! engine only sees page reads, page writes and page allocation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;

use fs4::fs_std::FileExt;
use log::trace;
use memmap2::Mmap;

use crate::common::page::PageBuf;
use crate::common::types::{EnvFlags, OS_PAGE_SIZE, PageAddr};
use crate::errors::{HamError, Result};

/// Transform applied to page bytes on their way to and from a disk
/// device. Real ciphers plug in from the outside; the built-in
/// [`XorCipher`] has the same contract (whole pages only, disables
/// mmap) and exists so the seam stays exercised.
pub trait PageTransform: Send {
    /// In-place transform before bytes reach the file.
    fn encrypt(&self, addr: PageAddr, data: &mut [u8]);

    /// In-place transform after bytes left the file.
    fn decrypt(&self, addr: PageAddr, data: &mut [u8]);
}

/// Keyed XOR stream. Symmetric, so encrypt and decrypt coincide.
pub struct XorCipher {
    key: [u8; 16],
}

impl XorCipher {
    pub fn new(key: [u8; 16]) -> XorCipher {
        XorCipher { key }
    }

    fn apply(&self, addr: PageAddr, data: &mut [u8]) {
        for (i, b) in data.iter_mut().enumerate() {
            *b ^= self.key[(addr as usize + i) % 16];
        }
    }
}

impl PageTransform for XorCipher {
    fn encrypt(&self, addr: PageAddr, data: &mut [u8]) {
        self.apply(addr, data);
    }

    fn decrypt(&self, addr: PageAddr, data: &mut [u8]) {
        self.apply(addr, data);
    }
}

/// A file-based device.
pub(crate) struct DiskDevice {
    file: File,
    /// read window into the file, established at open
    mmap: Option<Mmap>,
    /// the size of the mapped window
    mapped_size: u64,
    /// the (cached) size of the file
    file_size: u64,
    file_size_limit: u64,
    transform: Option<Box<dyn PageTransform>>,
    /// scratch space for the encrypt-then-write path
    scratch: Vec<u8>,
}

impl DiskDevice {
    /// Creates a new device file, truncating an existing one, and
    /// takes the advisory exclusive lock.
    pub(crate) fn create(
        path: &Path,
        mode: u32,
        file_size_limit: u64,
        transform: Option<Box<dyn PageTransform>>,
    ) -> Result<DiskDevice> {
        use std::os::unix::fs::OpenOptionsExt;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)?;
        if !file.try_lock_exclusive()? {
            return Err(HamError::WouldBlock);
        }

        Ok(DiskDevice {
            file,
            mmap: None,
            mapped_size: 0,
            file_size: 0,
            file_size_limit,
            transform,
            scratch: Vec::new(),
        })
    }

    /// Opens an existing device file and takes the advisory lock.
    ///
    /// Tries to map the file; if the size does not line up with the
    /// host granularity, continues with plain read/write.
    pub(crate) fn open(
        path: &Path,
        flags: EnvFlags,
        file_size_limit: u64,
        transform: Option<Box<dyn PageTransform>>,
    ) -> Result<DiskDevice> {
        let mut options = OpenOptions::new();
        options.read(true);
        if !flags.contains(EnvFlags::READ_ONLY) {
            options.write(true);
        }
        let file = options.open(path)?;
        if !file.try_lock_exclusive()? {
            return Err(HamError::WouldBlock);
        }

        let file_size = file.metadata()?.len();

        let mut device = DiskDevice {
            file,
            mmap: None,
            mapped_size: 0,
            file_size,
            file_size_limit,
            transform,
            scratch: Vec::new(),
        };

        // A transform touches whole pages on the write path, which is
        // incompatible with handing out raw file windows.
        if flags.contains(EnvFlags::DISABLE_MMAP) || device.transform.is_some() {
            return Ok(device);
        }

        let granularity = *OS_PAGE_SIZE as u64;
        if file_size == 0 || file_size % granularity != 0 {
            return Ok(device);
        }

        // Safety: the file is exclusively locked for the lifetime of
        // this device; no other process mutates it underneath the map.
        match unsafe { Mmap::map(&device.file) } {
            Ok(map) => {
                device.mapped_size = file_size;
                device.mmap = Some(map);
            }
            Err(e) => {
                trace!("mmap failed, falling back to pread: {}", e);
            }
        }

        Ok(device)
    }

    pub(crate) fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)?;
        if let Some(transform) = &self.transform {
            transform.decrypt(offset, buf);
        }
        Ok(())
    }

    pub(crate) fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        match &self.transform {
            Some(transform) => {
                self.scratch.clear();
                self.scratch.extend_from_slice(buf);
                transform.encrypt(offset, &mut self.scratch);
                self.file.write_all_at(&self.scratch, offset)?;
            }
            None => self.file.write_all_at(buf, offset)?,
        }
        Ok(())
    }

    pub(crate) fn truncate(&mut self, new_size: u64) -> Result<()> {
        if self.file_size_limit != 0 && new_size > self.file_size_limit {
            return Err(HamError::LimitsReached);
        }
        self.file.set_len(new_size)?;
        self.file_size = new_size;
        Ok(())
    }

    pub(crate) fn file_size(&self) -> u64 {
        self.file_size
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn read_page(&self, addr: PageAddr, page_size: usize) -> Result<PageBuf> {
        let mut page = PageBuf::new(page_size);

        // If this page lies in the mapped window, copy from the map
        // and skip the syscall. Never taken with a transform; the
        // window is not established then.
        if let Some(map) = &self.mmap {
            if addr + page_size as u64 <= self.mapped_size {
                page.as_slice_mut()
                    .copy_from_slice(&map[addr as usize..addr as usize + page_size]);
                return Ok(page);
            }
        }

        self.read(addr, page.as_slice_mut())?;
        Ok(page)
    }

    fn write_page(&mut self, addr: PageAddr, page: &PageBuf) -> Result<()> {
        self.write(addr, page.as_slice())
    }

    /// Allocates one page at the file tail.
    fn alloc_page(&mut self, page_size: usize) -> Result<PageAddr> {
        let addr = self.file_size;
        self.truncate(addr + page_size as u64)?;
        Ok(addr)
    }
}

/// An in-memory device: a private arena of page frames. File-shaped
/// operations are not available.
pub(crate) struct InMemDevice {
    frames: HashMap<PageAddr, PageBuf>,
    next_addr: PageAddr,
}

impl InMemDevice {
    pub(crate) fn new(page_size: usize) -> InMemDevice {
        InMemDevice {
            frames: HashMap::new(),
            // address 0 stays reserved for the header page
            next_addr: page_size as PageAddr,
        }
    }

    fn read_page(&self, addr: PageAddr, page_size: usize) -> Result<PageBuf> {
        match self.frames.get(&addr) {
            Some(frame) => Ok(frame.clone()),
            // the header page is materialized on first access
            None if addr == 0 => Ok(PageBuf::new(page_size)),
            None => Err(HamError::IntegrityViolated),
        }
    }

    fn write_page(&mut self, addr: PageAddr, page: &PageBuf) -> Result<()> {
        self.frames.insert(addr, page.clone());
        Ok(())
    }

    fn alloc_page(&mut self, page_size: usize) -> Result<PageAddr> {
        let addr = self.next_addr;
        self.next_addr += page_size as PageAddr;
        self.frames.insert(addr, PageBuf::new(page_size));
        Ok(addr)
    }

    fn free_page(&mut self, addr: PageAddr) {
        self.frames.remove(&addr);
    }
}

/// The device behind an environment.
pub(crate) enum Device {
    Disk(DiskDevice),
    InMem(InMemDevice),
}

impl Device {
    pub(crate) fn is_in_memory(&self) -> bool {
        matches!(self, Device::InMem(_))
    }

    /// Reads raw bytes. Not available on in-memory devices.
    pub(crate) fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Device::Disk(d) => d.read(offset, buf),
            Device::InMem(_) => Err(HamError::NotImplemented),
        }
    }

    /// Writes raw bytes. Not available on in-memory devices.
    pub(crate) fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        match self {
            Device::Disk(d) => d.write(offset, buf),
            Device::InMem(_) => Err(HamError::NotImplemented),
        }
    }

    pub(crate) fn truncate(&mut self, new_size: u64) -> Result<()> {
        match self {
            Device::Disk(d) => d.truncate(new_size),
            Device::InMem(_) => Err(HamError::NotImplemented),
        }
    }

    pub(crate) fn file_size(&self) -> Result<u64> {
        match self {
            Device::Disk(d) => Ok(d.file_size()),
            Device::InMem(_) => Err(HamError::NotImplemented),
        }
    }

    pub(crate) fn flush(&self) -> Result<()> {
        match self {
            Device::Disk(d) => d.flush(),
            Device::InMem(_) => Ok(()),
        }
    }

    /// Reads the frame at `addr`.
    pub(crate) fn read_page(&self, addr: PageAddr, page_size: usize) -> Result<PageBuf> {
        match self {
            Device::Disk(d) => d.read_page(addr, page_size),
            Device::InMem(d) => d.read_page(addr, page_size),
        }
    }

    /// Writes the frame at `addr`.
    pub(crate) fn write_page(&mut self, addr: PageAddr, page: &PageBuf) -> Result<()> {
        match self {
            Device::Disk(d) => d.write_page(addr, page),
            Device::InMem(d) => d.write_page(addr, page),
        }
    }

    /// Allocates storage for one fresh page and returns its address.
    pub(crate) fn alloc_page(&mut self, page_size: usize) -> Result<PageAddr> {
        match self {
            Device::Disk(d) => d.alloc_page(page_size),
            Device::InMem(d) => d.alloc_page(page_size),
        }
    }

    /// Releases the frame at `addr`. Only meaningful for in-memory
    /// devices; disk space is recycled through the freelist.
    pub(crate) fn free_page(&mut self, addr: PageAddr) {
        if let Device::InMem(d) = self {
            d.free_page(addr);
        }
    }
}
