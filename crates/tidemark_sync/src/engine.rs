//! Sync engine state machine.

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityHandle;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventFeed, EventReceiver, SyncEvent};
use crate::gateway::{PushOutcome, RemoteChange, RemoteGateway};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tidemark_store::SyncStore;
use tidemark_types::{
    resolve, ConflictRecord, EntityId, OperationKind, Payload, PendingOperation, Resolution,
};
use tracing::{debug, info, warn};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not syncing; waiting for a trigger.
    Idle,
    /// Pushing queued local operations to the gateway.
    Draining,
    /// Fetching remote changes since the cursor.
    Pulling,
    /// Applying a pull page and resolving conflicts.
    Reconciling,
    /// Stopped; no transitions fire until an identity is restored.
    Stopped,
}

impl EngineState {
    /// Returns true if a sync cycle is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            EngineState::Draining | EngineState::Pulling | EngineState::Reconciling
        )
    }
}

/// Statistics about sync activity.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Total number of operations acknowledged by the gateway.
    pub operations_pushed: u64,
    /// Total number of remote changes applied.
    pub operations_pulled: u64,
    /// Conflicts resolved automatically (rebase or merge).
    pub conflicts_resolved: u64,
    /// Conflicts surfaced for manual resolution.
    pub conflicts_surfaced: u64,
    /// Last error message, cleared on a successful cycle.
    pub last_error: Option<String>,
    /// When the last successful cycle finished.
    pub last_cycle_at: Option<Instant>,
}

/// Result of one completed sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    /// Operations acknowledged by the gateway.
    pub pushed: u64,
    /// Remote changes applied.
    pub pulled: u64,
    /// Conflicts resolved automatically.
    pub conflicts_resolved: u64,
    /// Conflicts surfaced for manual resolution.
    pub conflicts_surfaced: u64,
    /// Duration of the cycle.
    pub duration: Duration,
}

/// Orchestrates reconciliation between the local store and the remote
/// gateway.
///
/// One instance per store. A cycle is non-reentrant: a trigger that
/// arrives while a cycle runs is recorded and fires exactly one
/// follow-up cycle.
pub struct SyncEngine<G: RemoteGateway> {
    config: SyncConfig,
    store: Arc<SyncStore>,
    gateway: Arc<G>,
    connectivity: ConnectivityHandle,
    state: RwLock<EngineState>,
    stats: RwLock<SyncStats>,
    events: EventFeed,
    cancelled: AtomicBool,
    pending_trigger: AtomicBool,
    cycle_gate: Mutex<()>,
}

impl<G: RemoteGateway> SyncEngine<G> {
    /// Creates a new engine over a store and gateway.
    pub fn new(
        config: SyncConfig,
        store: Arc<SyncStore>,
        gateway: G,
        connectivity: ConnectivityHandle,
    ) -> Self {
        Self {
            config,
            store,
            gateway: Arc::new(gateway),
            connectivity,
            state: RwLock::new(EngineState::Idle),
            stats: RwLock::new(SyncStats::default()),
            events: EventFeed::new(),
            cancelled: AtomicBool::new(false),
            pending_trigger: AtomicBool::new(false),
            cycle_gate: Mutex::new(()),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Returns a snapshot of the stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns the store this engine reconciles.
    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    /// Returns the gateway this engine pushes to.
    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    /// Subscribes to engine events.
    pub fn events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Requests cancellation of the cycle in progress. The cycle
    /// halts at the next batch boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Stops the engine: the current identity was revoked. The cycle
    /// in progress is cancelled and no further cycle runs until
    /// [`restore_identity`](Self::restore_identity).
    pub fn revoke_identity(&self) {
        self.cancel();
        self.set_state(EngineState::Stopped);
        info!("identity revoked, engine stopped");
    }

    /// Restarts a stopped engine with a fresh identity.
    pub fn restore_identity(&self) {
        if self.state() == EngineState::Stopped {
            self.set_state(EngineState::Idle);
            info!("identity restored, engine idle");
        }
    }

    /// Clears and returns the recorded follow-up trigger.
    pub fn take_pending_trigger(&self) -> bool {
        self.pending_trigger.swap(false, Ordering::SeqCst)
    }

    /// Runs one full drain-pull-reconcile cycle.
    ///
    /// Returns `CycleInProgress` (recording a follow-up trigger) if a
    /// cycle is already running, `Stopped` if the engine is stopped,
    /// and `Offline`/`Cancelled` if the cycle aborted at a batch
    /// boundary. Queued work survives every abort.
    pub fn run_cycle(&self) -> SyncResult<CycleSummary> {
        let Some(_gate) = self.cycle_gate.try_lock() else {
            self.pending_trigger.store(true, Ordering::SeqCst);
            return Err(SyncError::CycleInProgress);
        };
        if self.state() == EngineState::Stopped {
            return Err(SyncError::Stopped);
        }

        self.cancelled.store(false, Ordering::SeqCst);
        let start = Instant::now();
        let mut summary = CycleSummary::default();

        let result = self.cycle_inner(&mut summary);
        summary.duration = start.elapsed();

        match result {
            Ok(()) => {
                self.settle_to_idle();
                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.operations_pushed += summary.pushed;
                stats.operations_pulled += summary.pulled;
                stats.conflicts_resolved += summary.conflicts_resolved;
                stats.conflicts_surfaced += summary.conflicts_surfaced;
                stats.last_error = None;
                stats.last_cycle_at = Some(Instant::now());
                drop(stats);

                debug!(
                    pushed = summary.pushed,
                    pulled = summary.pulled,
                    "sync cycle complete"
                );
                self.events.emit(&SyncEvent::CycleCompleted(summary.clone()));
                Ok(summary)
            }
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    fn cycle_inner(&self, summary: &mut CycleSummary) -> SyncResult<()> {
        self.set_state(EngineState::Draining);
        self.drain(summary)?;

        self.pull(summary)?;

        self.set_state(EngineState::Reconciling);
        self.store.purge_expired_tombstones(self.config.tombstone_grace)?;
        Ok(())
    }

    /// Halts the cycle if cancellation was requested or connectivity
    /// dropped. Checked at batch boundaries only; in-flight gateway
    /// calls run to completion.
    fn check_interrupted(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        Ok(())
    }

    // ---- Draining -------------------------------------------------

    fn drain(&self, summary: &mut CycleSummary) -> SyncResult<()> {
        loop {
            self.check_interrupted()?;

            let batch = self.store.peek_batch(self.config.push_batch_size);
            if batch.is_empty() {
                return Ok(());
            }

            let outcomes = match self.gateway.push_batch(&batch) {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    self.store.release_batch();
                    return Err(e);
                }
            };
            let result = self.apply_push_outcomes(&batch, outcomes, summary);
            self.store.release_batch();
            result?;
        }
    }

    fn apply_push_outcomes(
        &self,
        batch: &[PendingOperation],
        outcomes: Vec<PushOutcome>,
        summary: &mut CycleSummary,
    ) -> SyncResult<()> {
        if outcomes.len() != batch.len() {
            return Err(SyncError::Protocol(format!(
                "pushed {} operations, got {} outcomes",
                batch.len(),
                outcomes.len()
            )));
        }

        for (op, outcome) in batch.iter().zip(outcomes) {
            match outcome {
                PushOutcome::Acknowledged { remote_version } => {
                    match op.kind {
                        OperationKind::Delete => self.store.acknowledge_deleted(
                            &op.entity_id,
                            &[op.sequence],
                            remote_version,
                        )?,
                        _ => self.store.acknowledge_clean(
                            &op.entity_id,
                            &[op.sequence],
                            remote_version,
                        )?,
                    }
                    summary.pushed += 1;
                }
                PushOutcome::VersionConflict {
                    remote_version,
                    remote_payload,
                } => {
                    self.resolve_divergence(
                        &op.entity_id,
                        op.sequence,
                        op.delta.clone(),
                        remote_version,
                        remote_payload,
                        summary,
                    )?;
                }
                PushOutcome::TransientFailure { message } => {
                    let attempts = self.store.requeue_with_backoff(
                        op.sequence,
                        self.config.retry.base_delay,
                        self.config.retry.max_delay,
                    )?;
                    warn!(
                        entity = %op.entity_id,
                        attempts,
                        "push failed, requeued with backoff: {message}"
                    );
                }
            }
        }
        Ok(())
    }

    // ---- Pulling / reconciling ------------------------------------

    fn pull(&self, summary: &mut CycleSummary) -> SyncResult<()> {
        loop {
            self.check_interrupted()?;
            self.set_state(EngineState::Pulling);

            let cursor = self.store.cursor();
            let page = self
                .gateway
                .pull_since(&cursor, self.config.pull_batch_size)?;

            if page.changes.is_empty() && !page.has_more {
                if page.cursor != cursor {
                    self.store.set_cursor(page.cursor)?;
                }
                return Ok(());
            }

            // The cursor moves only after the whole page, conflicts
            // included, is applied. A crash mid-page replays the page.
            self.set_state(EngineState::Reconciling);
            for change in &page.changes {
                self.apply_change(change, summary)?;
            }
            self.store.set_cursor(page.cursor)?;

            if !page.has_more {
                return Ok(());
            }
        }
    }

    fn apply_change(&self, change: &RemoteChange, summary: &mut CycleSummary) -> SyncResult<()> {
        let pending = self.store.pending_for(&change.entity_id);

        if let Some(op) = pending.last() {
            // Local operations outstanding: this entity diverged.
            // An echo of our own acknowledged push has no pending ops
            // and never lands here.
            self.resolve_divergence(
                &change.entity_id,
                op.sequence,
                op.delta.clone(),
                change.remote_version,
                change.payload.clone(),
                summary,
            )?;
        } else {
            self.store.apply_remote(
                &change.entity_id,
                change.payload.clone(),
                change.remote_version,
            )?;
            summary.pulled += 1;
        }
        Ok(())
    }

    /// Routes a diverged entity through the resolver and applies the
    /// resolution to the store.
    fn resolve_divergence(
        &self,
        entity_id: &EntityId,
        sequence: u64,
        local_delta: Payload,
        remote_version: u64,
        remote_payload: Option<Payload>,
        summary: &mut CycleSummary,
    ) -> SyncResult<()> {
        let Some(local) = self.store.get(entity_id) else {
            // No local state left; adopt the remote side outright.
            self.store
                .adopt_remote(entity_id, remote_payload, remote_version, false)?;
            return Ok(());
        };

        let record = ConflictRecord {
            entity_id: entity_id.clone(),
            local,
            local_delta,
            remote_version,
            remote_payload,
        };

        match resolve(&record) {
            Resolution::KeepLocal => {
                self.store.rebase_operation(sequence, remote_version)?;
                summary.conflicts_resolved += 1;
                debug!(entity = %entity_id, "conflict resolved: keep local, rebased");
            }
            Resolution::KeepRemote { resurface } => {
                self.store.adopt_remote(
                    entity_id,
                    record.remote_payload,
                    remote_version,
                    resurface,
                )?;
                if resurface {
                    summary.conflicts_surfaced += 1;
                    warn!(entity = %entity_id, "conflict surfaced for manual resolution");
                    self.events.emit(&SyncEvent::ConflictSurfaced {
                        entity_id: entity_id.clone(),
                    });
                } else {
                    summary.conflicts_resolved += 1;
                }
            }
            Resolution::Merge(merged) => {
                match &record.remote_payload {
                    Some(remote_payload) => self.store.apply_merge(
                        entity_id,
                        remote_payload,
                        merged,
                        remote_version,
                        sequence,
                    )?,
                    // The resolver never merges against a tombstone.
                    None => self.store.rebase_operation(sequence, remote_version)?,
                }
                summary.conflicts_resolved += 1;
                debug!(entity = %entity_id, "conflict resolved: field-level merge");
            }
        }
        Ok(())
    }

    // ---- Bookkeeping ----------------------------------------------

    fn set_state(&self, state: EngineState) {
        let changed = {
            let mut current = self.state.write();
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        };
        if changed {
            self.events.emit(&SyncEvent::StateChanged(state));
        }
    }

    fn handle_error(&self, error: &SyncError) {
        match error {
            SyncError::Auth(message) => {
                self.set_state(EngineState::Stopped);
                self.events
                    .emit(&SyncEvent::AuthRequired(message.clone()));
                warn!("authentication failure, engine stopped: {message}");
            }
            SyncError::Storage(e) => {
                self.settle_to_idle();
                self.events
                    .emit(&SyncEvent::StorageDiagnostic(e.to_string()));
                warn!("storage failure aborted sync cycle: {e}");
            }
            SyncError::Cancelled | SyncError::Offline => {
                self.settle_to_idle();
                debug!("sync cycle aborted: {error}");
            }
            _ => {
                self.settle_to_idle();
                warn!("sync cycle failed: {error}");
            }
        }
        self.stats.write().last_error = Some(error.to_string());
    }

    /// A cycle aborted while a revocation put the engine in
    /// `Stopped`; `Stopped` wins over the abort's `Idle`.
    fn settle_to_idle(&self) {
        if self.state() != EngineState::Stopped {
            self.set_state(EngineState::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use tidemark_types::SyncStatus;

    fn engine() -> SyncEngine<MemoryGateway> {
        let store = Arc::new(SyncStore::open_in_memory().unwrap());
        SyncEngine::new(
            SyncConfig::new(),
            store,
            MemoryGateway::new(),
            ConnectivityHandle::always_online(),
        )
    }

    #[test]
    fn initial_state_is_idle() {
        let engine = engine();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.stats().cycles_completed, 0);
    }

    #[test]
    fn empty_cycle_completes() {
        let engine = engine();
        let summary = engine.run_cycle().unwrap();

        assert_eq!(summary.pushed, 0);
        assert_eq!(summary.pulled, 0);
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.stats().cycles_completed, 1);
    }

    #[test]
    fn local_create_reaches_remote_and_cleans_up() {
        let engine = engine();
        let id = EntityId::new("e1");
        engine
            .store()
            .mutate(&id, OperationKind::Create, Payload::new().with("a", 1i64))
            .unwrap();

        let summary = engine.run_cycle().unwrap();
        assert_eq!(summary.pushed, 1);

        let entity = engine.store().get(&id).unwrap();
        assert_eq!(entity.status, SyncStatus::Clean);
        assert_eq!(entity.remote_version, Some(1));
        assert_eq!(engine.store().pending_count(), 0);

        let (version, payload) = engine.gateway.document(&id).unwrap();
        assert_eq!(version, 1);
        assert!(payload.unwrap().get("a").is_some());
    }

    #[test]
    fn stopped_engine_refuses_cycles() {
        let engine = engine();
        engine.revoke_identity();

        assert!(matches!(engine.run_cycle(), Err(SyncError::Stopped)));

        engine.restore_identity();
        assert!(engine.run_cycle().is_ok());
    }

    #[test]
    fn auth_failure_stops_engine() {
        let engine = engine();
        let events = engine.events();
        engine
            .store()
            .mutate(
                &EntityId::new("e1"),
                OperationKind::Create,
                Payload::new().with("a", 1i64),
            )
            .unwrap();
        engine.gateway.expire_auth();

        assert!(matches!(engine.run_cycle(), Err(SyncError::Auth(_))));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(events
            .try_iter()
            .any(|e| matches!(e, SyncEvent::AuthRequired(_))));

        // The queued operation survives.
        assert_eq!(engine.store().pending_count(), 1);
    }

    #[test]
    fn transient_push_failure_backs_off_and_keeps_work() {
        let engine = engine();
        let id = EntityId::new("e1");
        engine
            .store()
            .mutate(&id, OperationKind::Create, Payload::new().with("a", 1i64))
            .unwrap();
        engine.gateway.fail_next_pushes(1);

        let err = engine.run_cycle().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(engine.store().pending_count(), 1);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn reentrant_trigger_is_recorded() {
        let engine = engine();
        let _gate = engine.cycle_gate.try_lock().unwrap();

        assert!(matches!(
            engine.run_cycle(),
            Err(SyncError::CycleInProgress)
        ));
        assert!(engine.take_pending_trigger());
        assert!(!engine.take_pending_trigger());
    }
}
