//! hamsterdb is an embeddable key/value storage engine exposing an
//! ordered multi-map interface over named databases grouped in an
//! environment.
//!
//! The paged store ([`page_manager`]) backs a B-tree index per
//! database ([`btree`]), variable-length records live in blobs
//! ([`blob`]), pending operations of transactions sit in an in-memory
//! transaction tree ([`txn`]), cursors merge both views ([`cursor`]),
//! and a write-ahead log ([`journal`]) turns a crash into the state of
//! the last committed transaction.

extern crate bitflags;
extern crate fnv;
extern crate page_size;

mod blob;
mod btree;
mod cache;
mod common;
mod compressor;
mod cursor;
mod device;
mod errors;
mod journal;
mod page_manager;
mod txn;

pub mod db;
pub mod env;

#[cfg(test)]
mod testing;

pub use common::types::{
    ApproxMode, CloseFlags, CursorMove, DbFlags, EnvFlags, FreelistPolicy, InsertFlags, KeyType,
};
pub use compressor::{Compressor, CompressorKind};
pub use db::{Cursor, Database};
pub use device::{PageTransform, XorCipher};
pub use env::{DbOptions, DbParameters, Environment, Options, Transaction};
pub use errors::{HamError, Result};
