//! Pending operations: queued, not-yet-acknowledged mutations.

use crate::entity::EntityId;
use crate::value::Payload;
use serde::{Deserialize, Serialize};

/// Kind of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// First local write of a new entity.
    Create,
    /// Field-level update of an existing entity.
    Update,
    /// Deletion of an entity.
    Delete,
}

/// A queued local mutation awaiting remote acknowledgement.
///
/// # Invariants
///
/// - `sequence` is strictly increasing and totals-orders operations
/// - Operations for the same entity reach the remote in enqueue order
/// - An entry is removed only on acknowledgement or when provably
///   superseded by a later entry for the same entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Logical enqueue sequence number; assigned by the log.
    pub sequence: u64,
    /// Entity this operation mutates.
    pub entity_id: EntityId,
    /// Create, Update, or Delete.
    pub kind: OperationKind,
    /// Field delta carried by the operation. Empty for Delete.
    pub delta: Payload,
    /// Remote version this operation was based on. `None` for an
    /// entity the remote has never seen.
    pub based_on: Option<u64>,
    /// Number of failed push attempts. Reset only by removal.
    pub attempt_count: u32,
}

impl PendingOperation {
    /// Creates an operation with an unassigned sequence number.
    pub fn new(
        entity_id: EntityId,
        kind: OperationKind,
        delta: Payload,
        based_on: Option<u64>,
    ) -> Self {
        Self {
            sequence: 0,
            entity_id,
            kind,
            delta,
            based_on,
            attempt_count: 0,
        }
    }

    /// Returns true if `later` may be coalesced into this entry
    /// instead of being appended separately.
    ///
    /// Safe coalescing cases:
    /// - Update after Create/Update: deltas merge, later fields win
    /// - Delete after anything: the delete replaces this entry
    ///
    /// Create after Delete is not coalesced; it is a distinct
    /// lifecycle and keeps its own entry.
    #[must_use]
    pub fn can_absorb(&self, later: &PendingOperation) -> bool {
        if self.entity_id != later.entity_id {
            return false;
        }
        match (self.kind, later.kind) {
            (OperationKind::Create | OperationKind::Update, OperationKind::Update) => true,
            (_, OperationKind::Delete) => true,
            _ => false,
        }
    }

    /// Coalesces `later` into this entry. Caller must have checked
    /// [`can_absorb`](Self::can_absorb). The entry keeps its original
    /// sequence number, so it is never reordered past other entries.
    pub fn absorb(&mut self, later: PendingOperation) {
        debug_assert!(self.can_absorb(&later));
        match later.kind {
            OperationKind::Update => {
                self.delta.merge_from(&later.delta);
            }
            OperationKind::Delete => {
                self.kind = OperationKind::Delete;
                self.delta = Payload::new();
            }
            OperationKind::Create => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(id: &str, kind: OperationKind, delta: Payload) -> PendingOperation {
        PendingOperation::new(id.into(), kind, delta, Some(1))
    }

    #[test]
    fn update_absorbs_update() {
        let mut first = op("e1", OperationKind::Update, Payload::new().with("a", 1i64));
        let later = op("e1", OperationKind::Update, Payload::new().with("b", 2i64));

        assert!(first.can_absorb(&later));
        first.absorb(later);

        assert_eq!(first.kind, OperationKind::Update);
        assert!(first.delta.get("a").is_some());
        assert!(first.delta.get("b").is_some());
    }

    #[test]
    fn later_field_wins_on_merge() {
        let mut first = op("e1", OperationKind::Update, Payload::new().with("a", 1i64));
        let later = op("e1", OperationKind::Update, Payload::new().with("a", 9i64));

        first.absorb(later);
        assert_eq!(
            first.delta.get("a"),
            Some(&crate::FieldValue::Integer(9))
        );
    }

    #[test]
    fn delete_replaces_prior() {
        let mut first = op("e1", OperationKind::Create, Payload::new().with("a", 1i64));
        let later = op("e1", OperationKind::Delete, Payload::new());

        assert!(first.can_absorb(&later));
        first.absorb(later);

        assert_eq!(first.kind, OperationKind::Delete);
        assert!(first.delta.is_empty());
    }

    #[test]
    fn create_after_delete_not_coalesced() {
        let first = op("e1", OperationKind::Delete, Payload::new());
        let later = op("e1", OperationKind::Create, Payload::new().with("a", 1i64));
        assert!(!first.can_absorb(&later));
    }

    #[test]
    fn different_entities_never_coalesce() {
        let first = op("e1", OperationKind::Update, Payload::new());
        let later = op("e2", OperationKind::Update, Payload::new());
        assert!(!first.can_absorb(&later));
    }
}
