//! Striped per-entity locks.
//!
//! The UI-facing enqueue path and the sync engine both mutate the
//! entity table and the operation log. Serializing per entity keeps
//! them consistent without a global lock that would stall unrelated
//! entities during a long cycle.

use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tidemark_types::EntityId;

const DEFAULT_STRIPES: usize = 64;

/// A fixed pool of mutexes, one per hash stripe of the entity id
/// space. Two entities on different stripes never contend.
pub struct EntityLocks {
    stripes: Vec<Mutex<()>>,
}

impl EntityLocks {
    /// Creates a lock pool with the default stripe count.
    #[must_use]
    pub fn new() -> Self {
        Self::with_stripes(DEFAULT_STRIPES)
    }

    /// Creates a lock pool with `stripes` mutexes (minimum 1).
    #[must_use]
    pub fn with_stripes(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Locks the stripe covering `entity_id`, blocking until held.
    pub fn lock(&self, entity_id: &EntityId) -> MutexGuard<'_, ()> {
        self.stripes[self.index(entity_id)].lock()
    }

    fn index(&self, entity_id: &EntityId) -> usize {
        let mut hasher = DefaultHasher::new();
        entity_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }
}

impl Default for EntityLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn same_entity_maps_to_same_stripe() {
        let locks = EntityLocks::new();
        let id = EntityId::new("e1");
        assert_eq!(locks.index(&id), locks.index(&EntityId::new("e1")));
    }

    #[test]
    fn lock_serializes_concurrent_holders() {
        let locks = Arc::new(EntityLocks::with_stripes(1));
        let counter = Arc::new(parking_lot::Mutex::new(0u32));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let _guard = locks.lock(&EntityId::new("shared"));
                    let mut c = counter.lock();
                    *c += 1;
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 8);
    }
}
