//! UI-facing client facade.

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::driver::SyncDriver;
use crate::engine::{EngineState, SyncEngine, SyncStats};
use crate::events::EventReceiver;
use crate::gateway::RemoteGateway;
use std::sync::Arc;
use tidemark_store::{StoreResult, SyncStore, UpdateReceiver};
use tidemark_types::{Entity, EntityId, OperationKind, Payload};

/// The surface the host application talks to.
///
/// Mutations apply locally and enqueue durably before this returns;
/// no call here ever blocks on the network. The background driver
/// pushes the queue when connectivity allows.
pub struct SyncClient<G: RemoteGateway + 'static> {
    store: Arc<SyncStore>,
    engine: Arc<SyncEngine<G>>,
    driver: SyncDriver,
}

impl<G: RemoteGateway + 'static> SyncClient<G> {
    /// Starts a client: wires the engine to the store and gateway and
    /// spawns the background driver.
    pub fn start(
        config: SyncConfig,
        store: Arc<SyncStore>,
        gateway: G,
        monitor: &ConnectivityMonitor,
    ) -> Self {
        let poll_interval = config.poll_interval;
        let engine = Arc::new(SyncEngine::new(
            config,
            Arc::clone(&store),
            gateway,
            monitor.handle(),
        ));
        let driver = SyncDriver::spawn(Arc::clone(&engine), monitor, poll_interval);
        Self {
            store,
            engine,
            driver,
        }
    }

    /// Applies a local mutation. Durable and visible to readers when
    /// this returns; synced in the background.
    pub fn mutate(
        &self,
        entity_id: &EntityId,
        kind: OperationKind,
        delta: Payload,
    ) -> StoreResult<Entity> {
        let (entity, _) = self.store.mutate(entity_id, kind, delta)?;
        self.driver.nudge();
        Ok(entity)
    }

    /// Reads an entity.
    pub fn read(&self, entity_id: &EntityId) -> Option<Entity> {
        self.store.get(entity_id)
    }

    /// Subscribes to committed updates of one entity. The
    /// subscription ends when the receiver is dropped.
    pub fn subscribe(&self, entity_id: EntityId) -> UpdateReceiver {
        self.store.subscribe(Some(entity_id))
    }

    /// Subscribes to committed updates of all entities.
    pub fn subscribe_all(&self) -> UpdateReceiver {
        self.store.subscribe(None)
    }

    /// Clears a surfaced conflict marker after it was reviewed; the
    /// entity stays on the remote side's value.
    pub fn acknowledge_conflict(&self, entity_id: &EntityId) -> StoreResult<()> {
        self.store.acknowledge_conflict(entity_id)
    }

    /// Subscribes to engine events (state changes, surfaced
    /// conflicts, diagnostics).
    pub fn events(&self) -> EventReceiver {
        self.engine.events()
    }

    /// Asks for a sync cycle soon.
    pub fn sync_now(&self) {
        self.driver.nudge();
    }

    /// Returns the engine's current state.
    pub fn state(&self) -> EngineState {
        self.engine.state()
    }

    /// Returns a snapshot of sync statistics.
    pub fn stats(&self) -> SyncStats {
        self.engine.stats()
    }

    /// Stops the engine after an identity revocation.
    pub fn revoke_identity(&self) {
        self.engine.revoke_identity();
    }

    /// Restarts a stopped engine with a fresh identity.
    pub fn restore_identity(&self) {
        self.engine.restore_identity();
        self.driver.nudge();
    }

    /// Shuts the background driver down, cancelling any cycle in
    /// progress. Queued work stays durable for the next start.
    pub fn shutdown(self) {
        self.engine.cancel();
        self.driver.shutdown();
    }
}
