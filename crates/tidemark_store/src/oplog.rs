//! In-memory state of the pending operation log.
//!
//! Durability lives in the journal; this module owns ordering,
//! coalescing, batching, and backoff eligibility.

use crate::error::{StoreError, StoreResult};
use std::collections::{HashSet, VecDeque};
use std::time::Instant;
use tidemark_types::{EntityId, PendingOperation};

/// A log entry plus its runtime backoff deadline.
///
/// `not_before` is deliberately not persisted: a restart retries
/// immediately, while the persisted `attempt_count` keeps the next
/// backoff interval honest.
#[derive(Debug, Clone)]
struct LogEntry {
    op: PendingOperation,
    not_before: Option<Instant>,
    /// Set while the entry is part of a batch being pushed. An
    /// in-flight entry must not absorb later mutations: the
    /// acknowledgement that removes it covers only the delta that was
    /// actually sent.
    in_flight: bool,
}

/// Outcome of offering an operation to the log.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Enqueued {
    /// Appended as a new entry with the assigned sequence number.
    Appended(PendingOperation),
    /// Coalesced into an existing entry; the updated entry is
    /// returned for journaling.
    Coalesced(PendingOperation),
}

impl Enqueued {
    /// The sequence number the mutation ended up under.
    pub(crate) fn sequence(&self) -> u64 {
        match self {
            Enqueued::Appended(op) | Enqueued::Coalesced(op) => op.sequence,
        }
    }
}

/// Ordered queue of not-yet-acknowledged mutations.
///
/// # Invariants
///
/// - Sequence numbers are strictly increasing, assigned at append
/// - Entries for one entity drain in enqueue order
/// - An entry leaves the log only on acknowledgement or supersession
#[derive(Debug, Default)]
pub(crate) struct OplogState {
    entries: VecDeque<LogEntry>,
    next_sequence: u64,
}

impl OplogState {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_sequence: 1,
        }
    }

    /// Offers an operation: coalesces into the entity's newest queued
    /// entry when safe, otherwise appends with a fresh sequence.
    ///
    /// In-flight entries are never coalesce targets; a mutation that
    /// arrives while its predecessor is being pushed gets its own
    /// entry behind it.
    pub(crate) fn offer(&mut self, mut op: PendingOperation) -> Enqueued {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .rev()
            .find(|e| e.op.entity_id == op.entity_id)
        {
            if !entry.in_flight && entry.op.can_absorb(&op) {
                entry.op.absorb(op);
                return Enqueued::Coalesced(entry.op.clone());
            }
        }

        op.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push_back(LogEntry {
            op: op.clone(),
            not_before: None,
            in_flight: false,
        });
        Enqueued::Appended(op)
    }

    /// Re-inserts an entry during journal replay, keeping its
    /// persisted sequence number.
    pub(crate) fn restore(&mut self, op: PendingOperation) {
        self.next_sequence = self.next_sequence.max(op.sequence + 1);
        self.entries.push_back(LogEntry {
            op,
            not_before: None,
            in_flight: false,
        });
    }

    /// Restores sequence order after replay. Concurrent mutations on
    /// different entities can journal their enqueue frames out of
    /// sequence order; batching depends on oldest-first.
    pub(crate) fn finish_restore(&mut self) {
        self.entries
            .make_contiguous()
            .sort_by_key(|e| e.op.sequence);
    }

    /// Returns up to `max` operations, oldest first, skipping entries
    /// still in backoff, and marks the returned entries in flight.
    /// Entries are not removed. An ineligible entry blocks every
    /// later entry for the same entity, so per-entity order is never
    /// bypassed.
    pub(crate) fn peek_batch(&mut self, max: usize, now: Instant) -> Vec<PendingOperation> {
        let mut blocked: HashSet<EntityId> = HashSet::new();
        let mut batch = Vec::new();

        for entry in &mut self.entries {
            if batch.len() >= max {
                break;
            }
            if blocked.contains(&entry.op.entity_id) {
                continue;
            }
            let eligible = entry.not_before.is_none_or(|t| t <= now);
            if eligible {
                entry.in_flight = true;
                batch.push(entry.op.clone());
            } else {
                blocked.insert(entry.op.entity_id.clone());
            }
        }

        batch
    }

    /// Clears all in-flight marks. Called when a push batch finishes,
    /// succeeds or not.
    pub(crate) fn release_batch(&mut self) {
        for entry in &mut self.entries {
            entry.in_flight = false;
        }
    }

    /// Removes the given entries. Absent sequence numbers are ignored
    /// (re-delivered acknowledgements are a no-op).
    pub(crate) fn acknowledge(&mut self, sequences: &[u64]) {
        self.entries.retain(|e| !sequences.contains(&e.op.sequence));
    }

    /// Records a failed attempt and its backoff deadline. Returns the
    /// new attempt count.
    pub(crate) fn mark_attempt(
        &mut self,
        sequence: u64,
        not_before: Instant,
    ) -> StoreResult<u32> {
        let entry = self.entry_mut(sequence)?;
        entry.op.attempt_count += 1;
        entry.not_before = Some(not_before);
        Ok(entry.op.attempt_count)
    }

    /// Restores a persisted attempt count during replay.
    pub(crate) fn restore_attempt(&mut self, sequence: u64, attempt_count: u32) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.op.sequence == sequence) {
            entry.op.attempt_count = attempt_count;
        }
    }

    /// Rebases an entry on a newer remote version. Returns the
    /// updated operation for journaling.
    pub(crate) fn rebase(
        &mut self,
        sequence: u64,
        remote_version: u64,
    ) -> StoreResult<PendingOperation> {
        let entry = self.entry_mut(sequence)?;
        entry.op.based_on = Some(remote_version);
        Ok(entry.op.clone())
    }

    /// Replaces an entry wholesale, matched by sequence number.
    pub(crate) fn replace(&mut self, op: PendingOperation) -> StoreResult<()> {
        let entry = self.entry_mut(op.sequence)?;
        entry.op = op;
        entry.not_before = None;
        Ok(())
    }

    /// Drops every entry for an entity (KeepRemote resolution).
    /// Returns the removed sequence numbers.
    pub(crate) fn drop_for_entity(&mut self, entity_id: &EntityId) -> Vec<u64> {
        let dropped: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| &e.op.entity_id == entity_id)
            .map(|e| e.op.sequence)
            .collect();
        self.entries.retain(|e| &e.op.entity_id != entity_id);
        dropped
    }

    pub(crate) fn has_pending(&self, entity_id: &EntityId) -> bool {
        self.entries.iter().any(|e| &e.op.entity_id == entity_id)
    }

    /// Returns the entity's queued operations in enqueue order.
    pub(crate) fn ops_for_entity(&self, entity_id: &EntityId) -> Vec<PendingOperation> {
        self.entries
            .iter()
            .filter(|e| &e.op.entity_id == entity_id)
            .map(|e| e.op.clone())
            .collect()
    }

    pub(crate) fn get(&self, sequence: u64) -> Option<&PendingOperation> {
        self.entries
            .iter()
            .find(|e| e.op.sequence == sequence)
            .map(|e| &e.op)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn entry_mut(&mut self, sequence: u64) -> StoreResult<&mut LogEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.op.sequence == sequence)
            .ok_or(StoreError::UnknownSequence(sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tidemark_types::{OperationKind, Payload};

    fn update(id: &str, field: &str, v: i64) -> PendingOperation {
        PendingOperation::new(
            id.into(),
            OperationKind::Update,
            Payload::new().with(field, v),
            Some(1),
        )
    }

    #[test]
    fn restore_reorders_entries_by_sequence() {
        // Journal frames for different entities can land out of
        // sequence order when mutations race to the append.
        let mut log = OplogState::new();

        let mut second = update("e2", "a", 1);
        second.sequence = 2;
        let mut first = update("e1", "a", 1);
        first.sequence = 1;

        log.restore(second);
        log.restore(first);
        log.finish_restore();

        let batch = log.peek_batch(10, Instant::now());
        assert_eq!(batch[0].sequence, 1);
        assert_eq!(batch[1].sequence, 2);

        // A fresh offer still gets the next sequence.
        let next = log.offer(update("e3", "a", 1));
        assert_eq!(next.sequence(), 3);
    }

    #[test]
    fn offer_assigns_increasing_sequences() {
        let mut log = OplogState::new();

        let a = log.offer(update("e1", "a", 1));
        let b = log.offer(update("e2", "a", 1));

        assert_eq!(a.sequence(), 1);
        assert_eq!(b.sequence(), 2);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn updates_coalesce_per_entity() {
        let mut log = OplogState::new();

        log.offer(update("e1", "a", 1));
        let second = log.offer(update("e1", "b", 2));

        assert!(matches!(second, Enqueued::Coalesced(_)));
        assert_eq!(log.len(), 1);

        let op = log.get(1).unwrap();
        assert!(op.delta.get("a").is_some());
        assert!(op.delta.get("b").is_some());
    }

    #[test]
    fn delete_supersedes_prior_entries() {
        let mut log = OplogState::new();

        log.offer(update("e1", "a", 1));
        let del = log.offer(PendingOperation::new(
            "e1".into(),
            OperationKind::Delete,
            Payload::new(),
            Some(1),
        ));

        assert!(matches!(del, Enqueued::Coalesced(_)));
        assert_eq!(log.get(1).unwrap().kind, OperationKind::Delete);
    }

    #[test]
    fn create_after_delete_is_a_new_entry() {
        let mut log = OplogState::new();

        log.offer(PendingOperation::new(
            "e1".into(),
            OperationKind::Delete,
            Payload::new(),
            Some(1),
        ));
        let create = log.offer(PendingOperation::new(
            "e1".into(),
            OperationKind::Create,
            Payload::new().with("a", 1i64),
            None,
        ));

        assert!(matches!(create, Enqueued::Appended(_)));
        assert_eq!(log.len(), 2);
        // Delete still drains before the create.
        let batch = log.peek_batch(10, Instant::now());
        assert_eq!(batch[0].kind, OperationKind::Delete);
        assert_eq!(batch[1].kind, OperationKind::Create);
    }

    #[test]
    fn peek_batch_is_oldest_first_and_bounded() {
        let mut log = OplogState::new();
        for i in 0..5 {
            log.offer(update(&format!("e{i}"), "a", i));
        }

        let batch = log.peek_batch(3, Instant::now());
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].sequence, 1);
        assert_eq!(batch[2].sequence, 3);
        // Peek does not remove.
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn backoff_makes_entry_ineligible() {
        let mut log = OplogState::new();
        log.offer(update("e1", "a", 1));
        log.offer(update("e2", "a", 1));

        let now = Instant::now();
        let attempts = log.mark_attempt(1, now + Duration::from_secs(10)).unwrap();
        assert_eq!(attempts, 1);

        let batch = log.peek_batch(10, now);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].entity_id, EntityId::new("e2"));

        // Eligible again once the deadline passes.
        let batch = log.peek_batch(10, now + Duration::from_secs(11));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn ineligible_entry_blocks_same_entity_successors() {
        let mut log = OplogState::new();
        log.offer(PendingOperation::new(
            "e1".into(),
            OperationKind::Delete,
            Payload::new(),
            Some(1),
        ));
        log.offer(PendingOperation::new(
            "e1".into(),
            OperationKind::Create,
            Payload::new(),
            None,
        ));

        let now = Instant::now();
        log.mark_attempt(1, now + Duration::from_secs(5)).unwrap();

        // The create must not jump the delete in line.
        assert!(log.peek_batch(10, now).is_empty());
    }

    #[test]
    fn in_flight_entries_are_not_coalesce_targets() {
        let mut log = OplogState::new();
        log.offer(update("e1", "a", 1));

        let batch = log.peek_batch(10, Instant::now());
        assert_eq!(batch.len(), 1);

        // Mutation arriving mid-push gets its own entry.
        let second = log.offer(update("e1", "b", 2));
        assert!(matches!(second, Enqueued::Appended(_)));
        assert_eq!(log.len(), 2);

        // Acknowledging the pushed entry leaves the newer one queued.
        log.acknowledge(&[1]);
        log.release_batch();
        assert_eq!(log.len(), 1);
        assert!(log.get(2).unwrap().delta.get("b").is_some());
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let mut log = OplogState::new();
        log.offer(update("e1", "a", 1));

        log.acknowledge(&[1]);
        assert_eq!(log.len(), 0);

        // Re-delivered acknowledgement: no-op.
        log.acknowledge(&[1]);
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn restore_keeps_sequence_numbering() {
        let mut log = OplogState::new();
        let mut op = update("e1", "a", 1);
        op.sequence = 7;
        log.restore(op);

        let next = log.offer(update("e2", "a", 1));
        assert_eq!(next.sequence(), 8);
    }

    #[test]
    fn drop_for_entity_removes_all() {
        let mut log = OplogState::new();
        log.offer(PendingOperation::new(
            "e1".into(),
            OperationKind::Delete,
            Payload::new(),
            Some(1),
        ));
        log.offer(PendingOperation::new(
            "e1".into(),
            OperationKind::Create,
            Payload::new(),
            None,
        ));
        log.offer(update("e2", "a", 1));

        let dropped = log.drop_for_entity(&EntityId::new("e1"));
        assert_eq!(dropped, vec![1, 2]);
        assert_eq!(log.len(), 1);
        assert!(!log.has_pending(&EntityId::new("e1")));
    }
}
