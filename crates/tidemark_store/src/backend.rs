//! Storage backend trait definition.

use crate::error::StoreResult;

/// A low-level byte store underneath the journal.
///
/// Backends are opaque: they never interpret the bytes they hold. All
/// framing, checksumming, and replay logic lives in the journal.
///
/// # Invariants
///
/// - `append` returns the offset the data was written at
/// - `read_at` returns exactly the bytes previously written there
/// - after `flush` returns, appended data survives process death
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails if the range extends past the current size or on I/O
    /// error.
    fn read_at(&self, offset: u64, len: usize) -> StoreResult<Vec<u8>>;

    /// Appends data, returning the offset it was written at.
    fn append(&mut self, data: &[u8]) -> StoreResult<u64>;

    /// Flushes pending writes to durable storage.
    fn flush(&mut self) -> StoreResult<()>;

    /// Returns the current size in bytes (the next append offset).
    fn size(&self) -> StoreResult<u64>;

    /// Truncates to `new_size`, discarding everything after it.
    /// Used to drop a torn frame found during replay.
    ///
    /// # Errors
    ///
    /// Fails if `new_size` exceeds the current size.
    fn truncate(&mut self, new_size: u64) -> StoreResult<()>;
}
