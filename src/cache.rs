//! Page cache
//!
//! Maps page addresses to resident frames and tracks the changeset of
//! the current top-level operation. Frames are owned by the cache;
//! callers fetch a copy, mutate it, and hand it back through
//! [`PageCache::store_page`]. Clean frames are evicted in approximate
//! LRU order when the configured byte capacity is exceeded.

use fnv::FnvHashMap;
use log::trace;

use crate::common::page::PageBuf;
use crate::common::types::PageAddr;
use crate::device::Device;
use crate::errors::{HamError, Result};

struct CachedPage {
    page: PageBuf,
    dirty: bool,
    /// LRU clock value of the most recent access
    last_use: u64,
}

pub(crate) struct PageCache {
    frames: FnvHashMap<PageAddr, CachedPage>,
    /// capacity in bytes, converted to a frame budget via page_size
    capacity: usize,
    page_size: usize,
    /// fail fetches instead of growing past capacity
    strict: bool,
    tick: u64,
    /// pages dirtied by the current top-level operation
    changeset: Vec<PageAddr>,
}

impl PageCache {
    pub(crate) fn new(capacity: usize, page_size: usize, strict: bool) -> PageCache {
        PageCache {
            frames: FnvHashMap::default(),
            capacity,
            page_size,
            strict,
            tick: 0,
            changeset: Vec::new(),
        }
    }

    fn frame_budget(&self) -> usize {
        (self.capacity / self.page_size).max(1)
    }

    /// True when the number of resident frames exceeds the budget.
    pub(crate) fn is_full(&self) -> bool {
        self.frames.len() >= self.frame_budget()
    }

    pub(crate) fn resident_count(&self) -> usize {
        self.frames.len()
    }

    /// Fetches the frame at `addr`, reading it from the device on a
    /// miss. Returns a copy; mutations must come back via
    /// [`PageCache::store_page`].
    pub(crate) fn fetch_page(
        &mut self,
        device: &Device,
        addr: PageAddr,
        no_header: bool,
    ) -> Result<PageBuf> {
        self.tick += 1;

        if let Some(cached) = self.frames.get_mut(&addr) {
            cached.last_use = self.tick;
            return Ok(cached.page.clone());
        }

        if self.strict && self.is_full() && !self.has_evictable() {
            return Err(HamError::LimitsReached);
        }

        let mut page = device.read_page(addr, self.page_size)?;
        page.set_no_header(no_header);
        if !no_header && !page.fast_check(addr) {
            return Err(HamError::IntegrityViolated);
        }

        self.purge();
        self.frames.insert(
            addr,
            CachedPage {
                page: page.clone(),
                dirty: false,
                last_use: self.tick,
            },
        );
        Ok(page)
    }

    /// Hands a mutated frame back: the cache takes ownership, marks it
    /// dirty and records it in the current changeset.
    pub(crate) fn store_page(&mut self, addr: PageAddr, page: PageBuf) {
        self.tick += 1;
        let was_dirty = match self.frames.get(&addr) {
            Some(cached) => cached.dirty,
            None => false,
        };
        self.frames.insert(
            addr,
            CachedPage {
                page,
                dirty: true,
                last_use: self.tick,
            },
        );
        if !was_dirty {
            self.changeset.push(addr);
        }
    }

    /// Registers a freshly allocated frame without going through the
    /// device read path.
    pub(crate) fn insert_new(&mut self, addr: PageAddr, page: PageBuf) {
        self.store_page(addr, page);
    }

    /// Drops the frame at `addr`, discarding its content.
    pub(crate) fn remove_page(&mut self, addr: PageAddr) {
        self.frames.remove(&addr);
        self.changeset.retain(|&a| a != addr);
    }

    /// Addresses dirtied by the current operation, in dirtying order.
    pub(crate) fn changeset(&self) -> &[PageAddr] {
        &self.changeset
    }

    pub(crate) fn dirty_page(&self, addr: PageAddr) -> Option<&PageBuf> {
        self.frames
            .get(&addr)
            .filter(|cached| cached.dirty)
            .map(|cached| &cached.page)
    }

    /// Writes every dirty frame of the changeset back to the device
    /// and clears the changeset. The journal record describing the
    /// changes must be durable before this is called.
    pub(crate) fn flush_changeset(&mut self, device: &mut Device) -> Result<()> {
        let addrs = std::mem::take(&mut self.changeset);
        for addr in addrs {
            if let Some(cached) = self.frames.get_mut(&addr) {
                if cached.dirty {
                    device.write_page(addr, &cached.page)?;
                    cached.dirty = false;
                }
            }
        }
        Ok(())
    }

    /// Throws away every frame of the current changeset. The next
    /// fetch re-reads the pre-operation state from the device.
    pub(crate) fn discard_changeset(&mut self) {
        let addrs = std::mem::take(&mut self.changeset);
        trace!("discarding changeset of {} pages", addrs.len());
        for addr in addrs {
            self.frames.remove(&addr);
        }
    }

    /// Writes back every dirty frame, changeset member or not.
    pub(crate) fn flush_all(&mut self, device: &mut Device) -> Result<()> {
        for (addr, cached) in self.frames.iter_mut() {
            if cached.dirty {
                device.write_page(*addr, &cached.page)?;
                cached.dirty = false;
            }
        }
        self.changeset.clear();
        Ok(())
    }

    fn has_evictable(&self) -> bool {
        self.frames.values().any(|c| !c.dirty)
    }

    /// Evicts clean frames in approximate LRU order until the frame
    /// budget is met. Dirty frames are never evicted here; they leave
    /// through [`PageCache::flush_changeset`].
    pub(crate) fn purge(&mut self) {
        while self.frames.len() >= self.frame_budget() {
            let victim = self
                .frames
                .iter()
                .filter(|(_, c)| !c.dirty)
                .min_by_key(|(_, c)| c.last_use)
                .map(|(addr, _)| *addr);

            match victim {
                Some(addr) => {
                    trace!("evicting page {}", addr);
                    self.frames.remove(&addr);
                }
                None => break,
            }
        }
    }
}
