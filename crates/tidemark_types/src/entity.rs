//! Entities: versioned, uniquely identified documents.

use crate::value::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for an entity.
///
/// Ids are caller-supplied strings (document keys) and are never
/// reinterpreted by the core.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    /// Creates an entity id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Synchronization status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Local and remote agree; `local_version == remote_version`.
    Clean,
    /// Local mutations not yet acknowledged by the remote store.
    Dirty,
    /// A conflicting remote write was adopted; the local change needs
    /// manual resolution.
    Conflicted,
    /// Locally deleted; tombstone retained until purge.
    Deleted,
}

/// A versioned document tracked by the sync core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier.
    pub id: EntityId,
    /// Current local payload.
    pub payload: Payload,
    /// Monotonic local version, bumped on every local mutation.
    pub local_version: u64,
    /// Last known server version. `None` until first synced.
    pub remote_version: Option<u64>,
    /// Synchronization status.
    pub status: SyncStatus,
    /// Payload as of the last remote acknowledgement; the three-way
    /// merge base for conflict resolution. `None` until first synced.
    pub base_payload: Option<Payload>,
    /// Epoch milliseconds of the acknowledged delete, if any.
    /// Tombstones are purged once a grace period elapses.
    pub tombstoned_at: Option<u64>,
}

impl Entity {
    /// Creates a new, never-synced entity from a first local write.
    pub fn created_locally(id: EntityId, payload: Payload) -> Self {
        Self {
            id,
            payload,
            local_version: 1,
            remote_version: None,
            status: SyncStatus::Dirty,
            base_payload: None,
            tombstoned_at: None,
        }
    }

    /// Creates an entity from a remote change that has no local state.
    pub fn from_remote(id: EntityId, payload: Payload, remote_version: u64) -> Self {
        Self {
            id,
            base_payload: Some(payload.clone()),
            payload,
            local_version: remote_version,
            remote_version: Some(remote_version),
            status: SyncStatus::Clean,
            tombstoned_at: None,
        }
    }

    /// Applies a local delta: overlays the fields, bumps the local
    /// version, and marks the entity dirty.
    pub fn apply_local_delta(&mut self, delta: &Payload) {
        self.payload.merge_from(delta);
        self.local_version += 1;
        self.status = SyncStatus::Dirty;
        self.tombstoned_at = None;
    }

    /// Marks the entity locally deleted. The payload is retained until
    /// the delete is acknowledged and the tombstone purged.
    pub fn mark_deleted(&mut self) {
        self.local_version += 1;
        self.status = SyncStatus::Deleted;
    }

    /// Records a remote acknowledgement: local and remote now agree,
    /// and the current payload becomes the new merge base.
    pub fn mark_clean(&mut self, remote_version: u64) {
        self.local_version = remote_version;
        self.remote_version = Some(remote_version);
        self.status = SyncStatus::Clean;
        self.base_payload = Some(self.payload.clone());
        debug_assert!(self.invariant_holds());
    }

    /// Adopts a remote payload wholesale (KeepRemote resolution or a
    /// direct pull apply).
    pub fn adopt_remote(&mut self, payload: Payload, remote_version: u64) {
        self.payload = payload;
        self.mark_clean(remote_version);
    }

    /// Returns true if there are unacknowledged local changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        matches!(self.status, SyncStatus::Dirty | SyncStatus::Deleted)
    }

    /// Checks the Clean ⇒ versions-agree invariant.
    #[must_use]
    pub fn invariant_holds(&self) -> bool {
        self.status != SyncStatus::Clean || self.remote_version == Some(self.local_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_locally_is_dirty() {
        let e = Entity::created_locally("e1".into(), Payload::new().with("a", 1i64));
        assert_eq!(e.local_version, 1);
        assert_eq!(e.remote_version, None);
        assert_eq!(e.status, SyncStatus::Dirty);
        assert!(e.invariant_holds());
    }

    #[test]
    fn from_remote_is_clean() {
        let e = Entity::from_remote("e1".into(), Payload::new(), 7);
        assert_eq!(e.status, SyncStatus::Clean);
        assert_eq!(e.remote_version, Some(7));
        assert!(e.invariant_holds());
    }

    #[test]
    fn local_delta_bumps_version() {
        let mut e = Entity::from_remote("e1".into(), Payload::new().with("a", 1i64), 1);
        e.apply_local_delta(&Payload::new().with("b", 2i64));

        assert_eq!(e.local_version, 2);
        assert_eq!(e.status, SyncStatus::Dirty);
        assert!(e.payload.get("a").is_some());
        assert!(e.payload.get("b").is_some());
    }

    #[test]
    fn clean_restores_invariant() {
        let mut e = Entity::created_locally("e1".into(), Payload::new());
        assert!(e.is_dirty());

        e.mark_clean(1);
        assert_eq!(e.status, SyncStatus::Clean);
        assert_eq!(e.local_version, 1);
        assert_eq!(e.remote_version, Some(1));
        assert!(e.invariant_holds());
    }

    #[test]
    fn delete_marks_status() {
        let mut e = Entity::from_remote("e1".into(), Payload::new(), 1);
        e.mark_deleted();
        assert_eq!(e.status, SyncStatus::Deleted);
        assert!(e.is_dirty());
    }
}
