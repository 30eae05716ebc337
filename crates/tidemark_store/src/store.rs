//! The durable store facade.
//!
//! `SyncStore` owns the journal, the entity table, the pending
//! operation log, the persisted pull cursor, and the update feed. All
//! mutating operations append one journal frame and flush before
//! touching memory, so every change is durable before it returns and
//! multi-row updates commit atomically.

use crate::backend::StorageBackend;
use crate::error::{StoreError, StoreResult};
use crate::feed::{UpdateFeed, UpdateReceiver};
use crate::journal::{Journal, JournalRecord};
use crate::locks::EntityLocks;
use crate::memory::InMemoryBackend;
use crate::oplog::{Enqueued, OplogState};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime};
use tidemark_types::{
    Entity, EntityId, OperationKind, Payload, PendingOperation, SyncCursor, SyncStatus,
};
use tracing::debug;

/// Durable entity table + pending operation log + pull cursor.
///
/// One instance per journal file; the file backend's exclusive lock
/// rejects a second opener. The UI-facing enqueue path and the sync
/// engine serialize per entity through the striped lock pool and never
/// hold a lock across network I/O.
pub struct SyncStore {
    journal: Journal,
    entities: RwLock<BTreeMap<EntityId, Entity>>,
    oplog: Mutex<OplogState>,
    cursor: RwLock<SyncCursor>,
    locks: EntityLocks,
    feed: UpdateFeed,
}

impl SyncStore {
    /// Opens a store over the given backend, replaying the journal.
    pub fn open(backend: Box<dyn StorageBackend>) -> StoreResult<Self> {
        let journal = Journal::new(backend);
        let transactions = journal.replay()?;

        let mut entities = BTreeMap::new();
        let mut oplog = OplogState::new();
        let mut cursor = SyncCursor::start();

        for records in transactions {
            for record in records {
                match record {
                    JournalRecord::EntityPut(entity) => {
                        entities.insert(entity.id.clone(), entity);
                    }
                    JournalRecord::EntityPurge(id) => {
                        entities.remove(&id);
                    }
                    JournalRecord::OpEnqueue(op) => oplog.restore(op),
                    JournalRecord::OpReplace(op) => oplog
                        .replace(op)
                        .map_err(|e| StoreError::corrupted(format!("replay: {e}")))?,
                    JournalRecord::OpAck { sequences } => oplog.acknowledge(&sequences),
                    JournalRecord::OpAttempt {
                        sequence,
                        attempt_count,
                    } => oplog.restore_attempt(sequence, attempt_count),
                    JournalRecord::CursorSet(c) => cursor = c,
                }
            }
        }

        oplog.finish_restore();

        debug!(
            entities = entities.len(),
            pending = oplog.len(),
            "store opened"
        );

        Ok(Self {
            journal,
            entities: RwLock::new(entities),
            oplog: Mutex::new(oplog),
            cursor: RwLock::new(cursor),
            locks: EntityLocks::new(),
            feed: UpdateFeed::new(),
        })
    }

    /// Opens an ephemeral store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open(Box::new(InMemoryBackend::new()))
    }

    // ---- Local Store contract -------------------------------------

    /// Gets an entity by id.
    #[must_use]
    pub fn get(&self, entity_id: &EntityId) -> Option<Entity> {
        self.entities.read().get(entity_id).cloned()
    }

    /// Atomically replaces an entity, payload and metadata.
    pub fn put(&self, entity: Entity) -> StoreResult<()> {
        let _guard = self.locks.lock(&entity.id);
        self.journal
            .append_txn(&[JournalRecord::EntityPut(entity.clone())])?;
        self.entities.write().insert(entity.id.clone(), entity.clone());
        self.feed.emit(&entity);
        Ok(())
    }

    /// Returns a point-in-time snapshot of entities with
    /// unacknowledged local changes.
    #[must_use]
    pub fn scan_dirty(&self) -> Vec<Entity> {
        self.entities
            .read()
            .values()
            .filter(|e| e.is_dirty())
            .cloned()
            .collect()
    }

    /// Returns the number of entities, tombstones included.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.read().len()
    }

    // ---- Enqueue path (UI-facing) ---------------------------------

    /// Applies a local mutation and enqueues the matching pending
    /// operation in one atomic transaction.
    ///
    /// This is the only write path the UI goes through. It holds the
    /// entity's stripe lock for the duration and never touches the
    /// network. Returns the updated entity and the sequence number
    /// the mutation ended up queued under.
    pub fn mutate(
        &self,
        entity_id: &EntityId,
        kind: OperationKind,
        delta: Payload,
    ) -> StoreResult<(Entity, u64)> {
        let _guard = self.locks.lock(entity_id);

        let existing = self.entities.read().get(entity_id).cloned();
        let (entity, based_on) = match kind {
            OperationKind::Create => match existing {
                Some(mut e) if e.status == SyncStatus::Deleted => {
                    let based_on = e.remote_version;
                    e.payload = delta.clone();
                    e.local_version += 1;
                    e.status = SyncStatus::Dirty;
                    e.tombstoned_at = None;
                    (e, based_on)
                }
                Some(e) => return Err(StoreError::EntityExists(e.id.to_string())),
                None => (
                    Entity::created_locally(entity_id.clone(), delta.clone()),
                    None,
                ),
            },
            OperationKind::Update => {
                let mut e = existing
                    .ok_or_else(|| StoreError::UnknownEntity(entity_id.to_string()))?;
                let based_on = e.remote_version;
                e.apply_local_delta(&delta);
                (e, based_on)
            }
            OperationKind::Delete => {
                let mut e = existing
                    .ok_or_else(|| StoreError::UnknownEntity(entity_id.to_string()))?;
                let based_on = e.remote_version;
                e.mark_deleted();
                (e, based_on)
            }
        };

        let op = PendingOperation::new(entity_id.clone(), kind, delta, based_on);
        let (op_record, sequence) = {
            let mut oplog = self.oplog.lock();
            match oplog.offer(op) {
                Enqueued::Appended(op) => {
                    let seq = op.sequence;
                    (JournalRecord::OpEnqueue(op), seq)
                }
                Enqueued::Coalesced(op) => {
                    let seq = op.sequence;
                    (JournalRecord::OpReplace(op), seq)
                }
            }
        };

        self.journal
            .append_txn(&[JournalRecord::EntityPut(entity.clone()), op_record])?;
        self.entities
            .write()
            .insert(entity_id.clone(), entity.clone());
        self.feed.emit(&entity);

        Ok((entity, sequence))
    }

    // ---- Pending operation log contract ---------------------------

    /// Returns up to `max` eligible operations, oldest first, and
    /// marks them in flight. Does not remove them.
    pub fn peek_batch(&self, max: usize) -> Vec<PendingOperation> {
        self.oplog.lock().peek_batch(max, Instant::now())
    }

    /// Clears in-flight marks after a push batch concludes.
    pub fn release_batch(&self) {
        self.oplog.lock().release_batch();
    }

    /// Returns true if the entity has queued operations.
    #[must_use]
    pub fn has_pending(&self, entity_id: &EntityId) -> bool {
        self.oplog.lock().has_pending(entity_id)
    }

    /// Returns the entity's queued operations in enqueue order.
    #[must_use]
    pub fn pending_for(&self, entity_id: &EntityId) -> Vec<PendingOperation> {
        self.oplog.lock().ops_for_entity(entity_id)
    }

    /// Returns the number of queued operations.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.oplog.lock().len()
    }

    /// Acknowledges a pushed operation: removes its log entries and
    /// marks the entity clean at `remote_version`, as one transaction.
    ///
    /// When a newer mutation was enqueued while the push was in
    /// flight, the acknowledgement covers only the delta that was
    /// sent. The entity then stays dirty and the merge base becomes
    /// the acknowledged payload, not the current local one.
    pub fn acknowledge_clean(
        &self,
        entity_id: &EntityId,
        sequences: &[u64],
        remote_version: u64,
    ) -> StoreResult<()> {
        let _guard = self.locks.lock(entity_id);

        let Some(mut entity) = self.entities.read().get(entity_id).cloned() else {
            return Ok(());
        };

        let (acked_payload, has_later) = {
            let oplog = self.oplog.lock();
            let mut acked = entity.base_payload.clone().unwrap_or_default();
            for sequence in sequences {
                if let Some(op) = oplog.get(*sequence) {
                    match op.kind {
                        OperationKind::Create => acked = op.delta.clone(),
                        OperationKind::Update => acked.merge_from(&op.delta),
                        OperationKind::Delete => {}
                    }
                }
            }
            let has_later = oplog
                .ops_for_entity(entity_id)
                .iter()
                .any(|op| !sequences.contains(&op.sequence));
            (acked, has_later)
        };

        if has_later {
            entity.remote_version = Some(remote_version);
            entity.base_payload = Some(acked_payload);
        } else {
            entity.mark_clean(remote_version);
        }

        self.journal.append_txn(&[
            JournalRecord::EntityPut(entity.clone()),
            JournalRecord::OpAck {
                sequences: sequences.to_vec(),
            },
        ])?;

        self.oplog.lock().acknowledge(sequences);
        self.entities
            .write()
            .insert(entity_id.clone(), entity.clone());
        self.feed.emit(&entity);
        Ok(())
    }

    /// Acknowledges a pushed delete: removes its log entries and
    /// tombstones the entity, as one transaction. The tombstone is
    /// retained until the grace period elapses.
    ///
    /// A recreate enqueued while the delete was in flight keeps the
    /// entity live: the remote now holds nothing, so the merge base
    /// clears, but the entity's dirty state and payload survive.
    pub fn acknowledge_deleted(
        &self,
        entity_id: &EntityId,
        sequences: &[u64],
        remote_version: u64,
    ) -> StoreResult<()> {
        let _guard = self.locks.lock(entity_id);

        let Some(mut entity) = self.entities.read().get(entity_id).cloned() else {
            return Ok(());
        };

        let has_later = self
            .oplog
            .lock()
            .ops_for_entity(entity_id)
            .iter()
            .any(|op| !sequences.contains(&op.sequence));

        entity.remote_version = Some(remote_version);
        if has_later {
            entity.base_payload = None;
        } else {
            entity.status = SyncStatus::Deleted;
            entity.tombstoned_at = Some(now_ms());
        }

        self.journal.append_txn(&[
            JournalRecord::EntityPut(entity.clone()),
            JournalRecord::OpAck {
                sequences: sequences.to_vec(),
            },
        ])?;

        self.oplog.lock().acknowledge(sequences);
        self.entities.write().insert(entity_id.clone(), entity);
        Ok(())
    }

    /// Records a failed push attempt: increments the attempt count
    /// and makes the entry ineligible until
    /// `min(base * 2^attempt_count, max)` has elapsed.
    pub fn requeue_with_backoff(
        &self,
        sequence: u64,
        base: Duration,
        max: Duration,
    ) -> StoreResult<u32> {
        let attempt_count = {
            let mut oplog = self.oplog.lock();
            let current = oplog
                .get(sequence)
                .map(|op| op.attempt_count)
                .ok_or(StoreError::UnknownSequence(sequence))?;
            let delay = backoff_delay(base, max, current + 1);
            oplog.mark_attempt(sequence, Instant::now() + delay)?
        };

        self.journal.append_txn(&[JournalRecord::OpAttempt {
            sequence,
            attempt_count,
        }])?;
        Ok(attempt_count)
    }

    /// Rebases a queued operation on a newer remote version
    /// (KeepLocal resolution).
    pub fn rebase_operation(&self, sequence: u64, remote_version: u64) -> StoreResult<()> {
        let op = self.oplog.lock().rebase(sequence, remote_version)?;
        self.journal.append_txn(&[JournalRecord::OpReplace(op)])?;
        Ok(())
    }

    // ---- Pull / reconcile path (engine-facing) --------------------

    /// Applies a remote change to an entity with no pending local
    /// operations. `payload: None` is a remote delete.
    pub fn apply_remote(
        &self,
        entity_id: &EntityId,
        payload: Option<Payload>,
        remote_version: u64,
    ) -> StoreResult<()> {
        let _guard = self.locks.lock(entity_id);

        let existing = self.entities.read().get(entity_id).cloned();
        let entity = match payload {
            Some(payload) => match existing {
                Some(mut e) => {
                    // An unreviewed conflict marker survives further
                    // remote changes; only the host clears it.
                    let conflicted = e.status == SyncStatus::Conflicted;
                    e.adopt_remote(payload, remote_version);
                    if conflicted {
                        e.status = SyncStatus::Conflicted;
                    }
                    e
                }
                None => Entity::from_remote(entity_id.clone(), payload, remote_version),
            },
            None => {
                let Some(mut e) = existing else {
                    // Delete of an entity we never had.
                    return Ok(());
                };
                e.status = SyncStatus::Deleted;
                e.remote_version = Some(remote_version);
                e.tombstoned_at = Some(now_ms());
                e
            }
        };

        self.journal
            .append_txn(&[JournalRecord::EntityPut(entity.clone())])?;
        self.entities
            .write()
            .insert(entity_id.clone(), entity.clone());
        self.feed.emit(&entity);
        Ok(())
    }

    /// Adopts the remote side of a conflict: drops the entity's
    /// queued operations and replaces the local state, as one
    /// transaction. With `mark_conflicted` the entity is left in
    /// `Conflicted` status so the discarded local change can be
    /// surfaced for manual resolution.
    pub fn adopt_remote(
        &self,
        entity_id: &EntityId,
        payload: Option<Payload>,
        remote_version: u64,
        mark_conflicted: bool,
    ) -> StoreResult<()> {
        let _guard = self.locks.lock(entity_id);

        let dropped = self.oplog.lock().drop_for_entity(entity_id);
        let existing = self.entities.read().get(entity_id).cloned();

        let entity = match payload {
            Some(payload) => {
                let mut e = match existing {
                    Some(e) => e,
                    None => Entity::from_remote(entity_id.clone(), payload.clone(), remote_version),
                };
                e.adopt_remote(payload, remote_version);
                if mark_conflicted {
                    e.status = SyncStatus::Conflicted;
                }
                e
            }
            None => {
                let Some(mut e) = existing else {
                    self.journal
                        .append_txn(&[JournalRecord::OpAck { sequences: dropped }])?;
                    return Ok(());
                };
                e.status = SyncStatus::Deleted;
                e.remote_version = Some(remote_version);
                e.tombstoned_at = Some(now_ms());
                e
            }
        };

        self.journal.append_txn(&[
            JournalRecord::EntityPut(entity.clone()),
            JournalRecord::OpAck { sequences: dropped },
        ])?;
        self.entities
            .write()
            .insert(entity_id.clone(), entity.clone());
        self.feed.emit(&entity);
        Ok(())
    }

    /// Applies a field-level merge resolution: the entity adopts the
    /// merged payload with the remote payload as its new base, and
    /// the queued operation is rewritten against the observed remote
    /// version, as one transaction.
    pub fn apply_merge(
        &self,
        entity_id: &EntityId,
        remote_payload: &Payload,
        merged: Payload,
        remote_version: u64,
        sequence: u64,
    ) -> StoreResult<()> {
        let _guard = self.locks.lock(entity_id);

        let mut entity = self
            .entities
            .read()
            .get(entity_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownEntity(entity_id.to_string()))?;
        entity.payload = merged;
        entity.base_payload = Some(remote_payload.clone());
        entity.remote_version = Some(remote_version);
        entity.status = SyncStatus::Dirty;

        let op = {
            let mut oplog = self.oplog.lock();
            oplog.rebase(sequence, remote_version)?
        };

        self.journal.append_txn(&[
            JournalRecord::EntityPut(entity.clone()),
            JournalRecord::OpReplace(op),
        ])?;
        self.entities
            .write()
            .insert(entity_id.clone(), entity.clone());
        self.feed.emit(&entity);
        Ok(())
    }

    /// Clears a surfaced conflict marker after the host has reviewed
    /// it. The entity becomes clean at its current remote version.
    pub fn acknowledge_conflict(&self, entity_id: &EntityId) -> StoreResult<()> {
        let _guard = self.locks.lock(entity_id);

        let Some(mut entity) = self.entities.read().get(entity_id).cloned() else {
            return Ok(());
        };
        if entity.status != SyncStatus::Conflicted {
            return Ok(());
        }
        if let Some(remote_version) = entity.remote_version {
            entity.mark_clean(remote_version);
        }

        self.journal
            .append_txn(&[JournalRecord::EntityPut(entity.clone())])?;
        self.entities
            .write()
            .insert(entity_id.clone(), entity.clone());
        self.feed.emit(&entity);
        Ok(())
    }

    /// Physically removes acknowledged tombstones older than `grace`.
    /// Returns the purged ids.
    pub fn purge_expired_tombstones(&self, grace: Duration) -> StoreResult<Vec<EntityId>> {
        let cutoff = now_ms().saturating_sub(grace.as_millis() as u64);

        let expired: Vec<EntityId> = {
            let entities = self.entities.read();
            let oplog = self.oplog.lock();
            entities
                .values()
                .filter(|e| {
                    e.status == SyncStatus::Deleted
                        && e.tombstoned_at.is_some_and(|t| t <= cutoff)
                        && !oplog.has_pending(&e.id)
                })
                .map(|e| e.id.clone())
                .collect()
        };

        if expired.is_empty() {
            return Ok(expired);
        }

        let records: Vec<JournalRecord> = expired
            .iter()
            .map(|id| JournalRecord::EntityPurge(id.clone()))
            .collect();
        self.journal.append_txn(&records)?;

        let mut entities = self.entities.write();
        for id in &expired {
            entities.remove(id);
        }
        debug!(purged = expired.len(), "tombstones purged");
        Ok(expired)
    }

    // ---- Cursor ---------------------------------------------------

    /// Returns the persisted pull cursor.
    #[must_use]
    pub fn cursor(&self) -> SyncCursor {
        self.cursor.read().clone()
    }

    /// Persists an advanced pull cursor. Called by the sync engine
    /// only after a pull batch has been fully applied.
    pub fn set_cursor(&self, cursor: SyncCursor) -> StoreResult<()> {
        self.journal
            .append_txn(&[JournalRecord::CursorSet(cursor.clone())])?;
        *self.cursor.write() = cursor;
        Ok(())
    }

    // ---- Subscriptions --------------------------------------------

    /// Subscribes to committed updates for one entity, or all with
    /// `None`. The subscription ends when the receiver is dropped.
    pub fn subscribe(&self, filter: Option<EntityId>) -> UpdateReceiver {
        self.feed.subscribe(filter)
    }
}

/// `min(base * 2^attempts, max)`, saturating.
fn backoff_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempts.min(16));
    base.saturating_mul(factor).min(max)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
