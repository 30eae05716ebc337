//! # Tidemark Store
//!
//! Durable local store and pending operation log.
//!
//! This crate provides:
//! - [`StorageBackend`]: opaque byte-store trait
//! - [`InMemoryBackend`] / [`FileBackend`] implementations
//! - [`Journal`]: append-only transaction frames with CRC32 framing
//! - [`SyncStore`]: the durable facade over the entity table, pending
//!   operation log, persisted cursor, and update feed
//!
//! ## Durability
//!
//! Every mutating `SyncStore` operation appends exactly one journal
//! frame and flushes it before returning. A frame carries all records
//! of one logical transaction, so multi-row updates (entity write +
//! log acknowledgement) are atomic across crashes. On open, the
//! journal is replayed; a torn final frame is discarded.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod feed;
mod file;
mod journal;
mod locks;
mod memory;
mod oplog;
mod store;

pub use backend::StorageBackend;
pub use error::{StoreError, StoreResult};
pub use feed::{UpdateFeed, UpdateReceiver};
pub use file::FileBackend;
pub use journal::{Journal, JournalRecord};
pub use locks::EntityLocks;
pub use memory::InMemoryBackend;
pub use store::SyncStore;
