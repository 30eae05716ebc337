//! # Tidemark Types
//!
//! Data types shared by the Tidemark sync core.
//!
//! This crate provides:
//! - [`Entity`]: a versioned, uniquely identified document
//! - [`Payload`] / [`FieldValue`]: ordered field maps
//! - [`PendingOperation`]: a queued, not-yet-acknowledged mutation
//! - [`SyncCursor`]: opaque marker of pull progress
//! - [`ConflictRecord`] and the pure [`resolve`] function
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod cursor;
mod entity;
mod operation;
mod value;

pub use conflict::{resolve, ConflictRecord, Resolution};
pub use cursor::SyncCursor;
pub use entity::{Entity, EntityId, SyncStatus};
pub use operation::{OperationKind, PendingOperation};
pub use value::{FieldValue, Payload};
