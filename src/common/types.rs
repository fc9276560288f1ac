//!
//!  hamsterdb default type declares and limits
//!

use bitflags::bitflags;
use once_cell::sync::Lazy;
use page_size;

// Magic marker value to indicate that a file is a hamsterdb
// environment ('H', 'A', 'M', '\0' in little-endian order).
pub(crate) const MAGIC: u32 = u32::from_le_bytes(*b"HAM\0");

// Environment file format version.
pub(crate) const VERSION: u32 = 2;

// Default page size of a freshly created environment. Page sizes are
// powers of two; the file grows in page-sized increments.
pub(crate) const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

// Smallest and largest page size accepted by `page_size` parameter.
pub(crate) const MIN_PAGE_SIZE: usize = 1024;
pub(crate) const MAX_PAGE_SIZE: usize = 128 * 1024;

// Default capacity of the page cache, in bytes.
pub(crate) const DEFAULT_CACHE_SIZE: usize = 2 * 1024 * 1024;

// Default number of database descriptor slots in the header page.
pub(crate) const DEFAULT_MAX_DATABASES: u16 = 16;

// Records of up to this size are stored directly in the key slot
// instead of a blob.
pub(crate) const MAX_INLINE_RECORD_SIZE: usize = 8;

// Granularity of the full freelist bitmap: one bit covers this many
// bytes of blob space.
pub(crate) const FREELIST_CHUNK_SIZE: usize = 32;

// OsPageSize is the allocation granularity of the host, used to decide
// whether a file can be memory-mapped.
pub(crate) static OS_PAGE_SIZE: Lazy<usize> = Lazy::new(|| page_size::get());

// PageAddr addresses a page by its byte offset in the file. The header
// page is address 0; every other page address is a positive multiple
// of the page size.
pub(crate) type PageAddr = u64;

// BlobId addresses a blob by the file offset of its header.
pub(crate) type BlobId = u64;

// TxnId represents the internal transaction identifier, assigned
// monotonically when a transaction begins.
pub(crate) type TxnId = u64;

// Lsn is the log sequence number which totally orders operations.
pub(crate) type Lsn = u64;

bitflags! {
    /// Flags of an environment, persisted in the header page.
    #[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
    pub struct EnvFlags: u32 {
        /// Keep all pages in memory, never touch a file.
        const IN_MEMORY = 0x0000_0001;
        /// Open the file (and every database in it) read-only.
        const READ_ONLY = 0x0000_0004;
        /// Enable the transaction layer.
        const ENABLE_TRANSACTIONS = 0x0000_0008;
        /// Write a journal and recover from it after a crash.
        const ENABLE_RECOVERY = 0x0000_0010;
        /// Run recovery automatically when opening a dirty file.
        const AUTO_RECOVERY = 0x0000_0020;
        /// Never hand out mmap windows; always buffer reads.
        const DISABLE_MMAP = 0x0000_0040;
        /// Fail allocations instead of growing the cache past its
        /// configured capacity.
        const CACHE_STRICT = 0x0000_0080;
    }
}

bitflags! {
    /// Flags of a single database, persisted in its descriptor.
    #[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
    pub struct DbFlags: u32 {
        /// A key may carry more than one record.
        const ENABLE_DUPLICATES = 0x0000_0001;
        /// Keys are an 8-byte big-endian counter managed by the engine.
        const RECORD_NUMBER = 0x0000_0002;
        /// Reject every mutation.
        const READ_ONLY = 0x0000_0004;
    }
}

bitflags! {
    /// Flags accepted by insert and cursor_insert.
    #[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
    pub struct InsertFlags: u32 {
        /// Overwrite the record if the key exists.
        const OVERWRITE = 0x0000_0001;
        /// Append a duplicate if the key exists.
        const DUPLICATE = 0x0000_0002;
        /// Insert the duplicate before the current cursor position.
        const DUPLICATE_INSERT_BEFORE = 0x0000_0004;
        /// Insert the duplicate after the current cursor position.
        const DUPLICATE_INSERT_AFTER = 0x0000_0008;
        /// Insert the duplicate as the first one of the key.
        const DUPLICATE_INSERT_FIRST = 0x0000_0010;
        /// Insert the duplicate as the last one of the key.
        const DUPLICATE_INSERT_LAST = 0x0000_0020;
        /// Only write the window described by the record's
        /// partial_offset/partial_size.
        const PARTIAL = 0x0000_0040;
    }
}

bitflags! {
    /// Flags accepted by env_close and db_close.
    #[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
    pub struct CloseFlags: u32 {
        /// Close open cursors and databases instead of failing.
        const AUTO_CLEANUP = 0x0000_0001;
        /// Commit still-open transactions; the default is to abort.
        const TXN_AUTO_COMMIT = 0x0000_0002;
    }
}

/// Key ordering of a database. Binary keys compare as unsigned
/// lexicographic byte strings; the numeric types short-circuit the
/// extended-key fetch because their length is fixed.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum KeyType {
    #[default]
    Binary,
    U32,
    U64,
}

impl KeyType {
    pub(crate) fn to_u16(self) -> u16 {
        match self {
            KeyType::Binary => 0,
            KeyType::U32 => 3,
            KeyType::U64 => 5,
        }
    }

    pub(crate) fn from_u16(v: u16) -> Option<KeyType> {
        match v {
            0 => Some(KeyType::Binary),
            3 => Some(KeyType::U32),
            5 => Some(KeyType::U64),
            _ => None,
        }
    }

    /// Fixed key length implied by the type, if any.
    pub(crate) fn fixed_size(self) -> Option<u16> {
        match self {
            KeyType::Binary => None,
            KeyType::U32 => Some(4),
            KeyType::U64 => Some(8),
        }
    }
}

/// Approximate-match mode of a find operation.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum ApproxMode {
    /// Only the requested key itself matches.
    #[default]
    Exact,
    /// Nearest key strictly smaller than the requested one.
    Lt,
    /// The requested key, or the nearest smaller one.
    Leq,
    /// Nearest key strictly greater than the requested one.
    Gt,
    /// The requested key, or the nearest greater one.
    Geq,
}

impl ApproxMode {
    /// True if an exact hit satisfies this mode.
    pub(crate) fn accepts_exact(self) -> bool {
        matches!(self, ApproxMode::Exact | ApproxMode::Leq | ApproxMode::Geq)
    }

    /// True if the mode scans towards smaller keys.
    pub(crate) fn is_backward(self) -> bool {
        matches!(self, ApproxMode::Lt | ApproxMode::Leq)
    }

    /// True if the mode scans towards greater keys.
    pub(crate) fn is_forward(self) -> bool {
        matches!(self, ApproxMode::Gt | ApproxMode::Geq)
    }
}

/// Direction of a cursor positioning call.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CursorMove {
    First,
    Last,
    Next,
    Previous,
    NextDuplicate,
    PreviousDuplicate,
}

/// Freelist bookkeeping policy of an environment.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum FreelistPolicy {
    /// Persistent bitmap with one bit per 32-byte chunk; supports
    /// arbitrary byte ranges and survives restart.
    #[default]
    Full,
    /// In-memory map of address -> run length, serialized only on
    /// shutdown. Suited to databases with few distinct free extents.
    Reduced,
}

impl FreelistPolicy {
    pub(crate) fn to_u32(self) -> u32 {
        match self {
            FreelistPolicy::Full => 1,
            FreelistPolicy::Reduced => 2,
        }
    }

    pub(crate) fn from_u32(v: u32) -> Option<FreelistPolicy> {
        match v {
            1 => Some(FreelistPolicy::Full),
            2 => Some(FreelistPolicy::Reduced),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic() {
        let bytes = MAGIC.to_le_bytes();
        assert_eq!(&bytes, b"HAM\0");
    }

    #[test]
    fn test_os_page_size() {
        let sz = *OS_PAGE_SIZE;
        assert!(sz.is_power_of_two());
    }

    #[test]
    fn test_key_type_round_trip() {
        for kt in [KeyType::Binary, KeyType::U32, KeyType::U64] {
            assert_eq!(KeyType::from_u16(kt.to_u16()), Some(kt));
        }
        assert_eq!(KeyType::from_u16(999), None);
    }

    #[test]
    fn test_approx_mode() {
        assert!(ApproxMode::Leq.accepts_exact());
        assert!(!ApproxMode::Lt.accepts_exact());
        assert!(ApproxMode::Lt.is_backward());
        assert!(ApproxMode::Geq.is_forward());
        assert!(!ApproxMode::Exact.is_forward());
    }
}
