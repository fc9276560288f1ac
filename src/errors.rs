//! Package errors defines the error variables that may be returned
//!  during hamsterdb operations.

use std::io;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum HamError {
    /// Returned when a function parameter, flag combination or
    /// configuration value is not acceptable.
    #[error("invalid parameter: {0}")]
    InvParameter(&'static str),

    /// Returned when a device read/write/truncate failed.
    #[error("io error: {0}")]
    Io(String),

    /// Returned when the environment file does not exist.
    #[error("file not found")]
    FileNotFound,

    /// Returned when the environment file is exclusively locked by
    /// another process.
    #[error("would block")]
    WouldBlock,

    /// Returned when the data file was created with an incompatible
    /// version of this library.
    #[error("invalid file version")]
    InvFileVersion,

    ///////////////////////////////////////////////////////////////////////////
    // Domain errors returned by lookups and mutations.
    ///////////////////////////////////////////////////////////////////////////
    /// Returned when a key (or a duplicate of a key) does not exist.
    #[error("key not found")]
    KeyNotFound,

    /// Returned when inserting a key that already exists and neither
    /// overwrite nor duplicate semantics were requested.
    #[error("duplicate key")]
    DuplicateKey,

    /// Returned when a persistent structure (page header, blob header,
    /// freelist, checksum) fails validation. The environment is no
    /// longer safe to write.
    #[error("integrity violated")]
    IntegrityViolated,

    /// Returned on write access to a read-only environment, database
    /// or transaction.
    #[error("access denied")]
    AccessDenied,

    /// Returned when an environment requires recovery before it can
    /// be used.
    #[error("not ready")]
    NotReady,

    /// Returned when the cache, the file size limit or the database
    /// descriptor table is exhausted.
    #[error("limits reached")]
    LimitsReached,

    /// Returned when an environment is initialized twice.
    #[error("already initialized")]
    AlreadyInitialized,

    ///////////////////////////////////////////////////////////////////////////
    // Database lifecycle errors.
    ///////////////////////////////////////////////////////////////////////////
    /// Returned when opening a database name that was never created.
    #[error("database not found")]
    DatabaseNotFound,

    /// Returned when creating a database name that already exists.
    #[error("database already exists")]
    DatabaseAlreadyExists,

    /// Returned when opening a database that is already open.
    #[error("database already open")]
    DatabaseAlreadyOpen,

    ///////////////////////////////////////////////////////////////////////////
    // Cursor and transaction lifecycle errors.
    ///////////////////////////////////////////////////////////////////////////
    /// Returned when a cursor is used before it was positioned, or
    /// after its position was erased.
    #[error("cursor is nil")]
    CursorIsNil,

    /// Returned when closing a database or transaction while cursors
    /// are still attached to it.
    #[error("cursor still open")]
    CursorStillOpen,

    /// Returned when closing an environment or database while
    /// transactions are still active.
    #[error("transaction still open")]
    TxnStillOpen,

    /// Returned when a write collides with an uncommitted operation
    /// of another transaction on the same key.
    #[error("transaction conflict")]
    TxnConflict,

    /// Returned by operations a device or configuration does not
    /// support (e.g. file I/O on an in-memory environment).
    #[error("not implemented")]
    NotImplemented,

    /// Returned when an allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// Returned when an unreachable state was reached anyway.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl HamError {
    /// Returns the stable integer code of this error as used on the
    /// public API boundary. Success is 0; every error is negative.
    pub fn code(&self) -> i32 {
        match self {
            HamError::OutOfMemory => -6,
            HamError::InvParameter(_) => -8,
            HamError::InvFileVersion => -10,
            HamError::KeyNotFound => -11,
            HamError::DuplicateKey => -12,
            HamError::IntegrityViolated => -13,
            HamError::Internal(_) => -14,
            HamError::AccessDenied => -15,
            HamError::Io(_) => -18,
            HamError::NotImplemented => -20,
            HamError::FileNotFound => -21,
            HamError::WouldBlock => -22,
            HamError::NotReady => -23,
            HamError::LimitsReached => -24,
            HamError::AlreadyInitialized => -27,
            HamError::CursorStillOpen => -29,
            HamError::TxnConflict => -31,
            HamError::TxnStillOpen => -33,
            HamError::CursorIsNil => -100,
            HamError::DatabaseNotFound => -200,
            HamError::DatabaseAlreadyExists => -201,
            HamError::DatabaseAlreadyOpen => -202,
        }
    }
}

impl From<io::Error> for HamError {
    #[inline]
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Self::FileNotFound,
            io::ErrorKind::PermissionDenied => Self::AccessDenied,
            io::ErrorKind::WouldBlock => Self::WouldBlock,
            _ => Self::Io(e.kind().to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, HamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_codes() {
        assert_eq!(HamError::KeyNotFound.code(), -11);
        assert_eq!(HamError::DuplicateKey.code(), -12);
        assert_eq!(HamError::TxnConflict.code(), -31);
        assert_eq!(HamError::CursorIsNil.code(), -100);
        assert_eq!(HamError::DatabaseNotFound.code(), -200);
    }

    #[test]
    fn test_from_io() {
        let e: HamError = io::Error::from(io::ErrorKind::NotFound).into();
        assert_eq!(e, HamError::FileNotFound);

        let e: HamError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(e, HamError::WouldBlock);
    }
}
