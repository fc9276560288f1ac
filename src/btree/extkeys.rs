//! Extended-key cache.
//!
//! Keys that spill out of the inline slot live in a blob; comparisons
//! on the descent fetch them repeatedly. This cache keeps recently
//! reconstructed keys around, bounded by a byte budget.

use fnv::FnvHashMap;

use crate::common::types::BlobId;

/// Byte budget of one cache; enough for a descent working set.
const EXTKEY_CACHE_BUDGET: usize = 64 * 1024;

#[derive(Debug, Default)]
pub(crate) struct ExtKeyCache {
    keys: FnvHashMap<BlobId, (u64, Vec<u8>)>,
    bytes: usize,
    tick: u64,
}

impl ExtKeyCache {
    pub(crate) fn new() -> ExtKeyCache {
        ExtKeyCache::default()
    }

    pub(crate) fn get(&mut self, id: BlobId) -> Option<&[u8]> {
        self.tick += 1;
        let tick = self.tick;
        self.keys.get_mut(&id).map(|(last_use, key)| {
            *last_use = tick;
            key.as_slice()
        })
    }

    pub(crate) fn put(&mut self, id: BlobId, key: Vec<u8>) {
        self.tick += 1;
        self.bytes += key.len();
        self.keys.insert(id, (self.tick, key));

        while self.bytes > EXTKEY_CACHE_BUDGET && self.keys.len() > 1 {
            let victim = self
                .keys
                .iter()
                .min_by_key(|(_, (last_use, _))| *last_use)
                .map(|(&id, _)| id);
            if let Some(id) = victim {
                self.remove(id);
            }
        }
    }

    /// Drops the entry when its blob is freed.
    pub(crate) fn remove(&mut self, id: BlobId) {
        if let Some((_, key)) = self.keys.remove(&id) {
            self.bytes -= key.len();
        }
    }

    pub(crate) fn clear(&mut self) {
        self.keys.clear();
        self.bytes = 0;
    }
}
