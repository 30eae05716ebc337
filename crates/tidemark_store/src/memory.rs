//! In-memory storage backend for tests and ephemeral stores.

use crate::backend::StorageBackend;
use crate::error::{StoreError, StoreResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory backend.
///
/// Suitable for unit tests and stores that do not need to survive the
/// process. Clones share the same buffer, so a test can keep a handle
/// to inspect the bytes a store wrote.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend seeded with existing bytes.
    ///
    /// Useful for replay and crash-recovery tests.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of all bytes held.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);

        if offset > size || end > data.len() {
            return Err(StoreError::ReadPastEnd { offset, len, size });
        }

        Ok(data[start..end].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StoreResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn size(&self) -> StoreResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StoreResult<()> {
        let mut data = self.data.write();
        if new_size > data.len() as u64 {
            return Err(StoreError::corrupted(format!(
                "truncate past end: {} > {}",
                new_size,
                data.len()
            )));
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read() {
        let mut backend = InMemoryBackend::new();
        let offset = backend.append(b"hello").unwrap();
        assert_eq!(offset, 0);

        let offset2 = backend.append(b" world").unwrap();
        assert_eq!(offset2, 5);

        assert_eq!(backend.read_at(0, 11).unwrap(), b"hello world");
        assert_eq!(backend.size().unwrap(), 11);
    }

    #[test]
    fn read_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"abc").unwrap();

        assert!(matches!(
            backend.read_at(1, 10),
            Err(StoreError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn truncate_discards_tail() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"abcdef").unwrap();
        backend.truncate(3).unwrap();

        assert_eq!(backend.size().unwrap(), 3);
        assert_eq!(backend.read_at(0, 3).unwrap(), b"abc");
        assert!(backend.truncate(10).is_err());
    }
}
