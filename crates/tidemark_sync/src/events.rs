//! Engine events surfaced to the host.

use crate::engine::{CycleSummary, EngineState};
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};
use tidemark_types::EntityId;

/// Receiver half of an event subscription.
pub type EventReceiver = Receiver<SyncEvent>;

/// Something the host may want to react to.
///
/// Errors the engine recovers from on its own (transient network
/// failures, backoff) are not events; conflicts needing manual
/// resolution and failures needing outside intervention are.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The engine's state changed.
    StateChanged(EngineState),
    /// A sync cycle finished.
    CycleCompleted(CycleSummary),
    /// A local change was discarded in favor of the remote side and
    /// needs manual resolution. The entity is left `Conflicted`.
    ConflictSurfaced {
        /// Entity whose local change was discarded.
        entity_id: EntityId,
    },
    /// The local store reported a failure; the cycle was aborted and
    /// will be retried, but the host should know.
    StorageDiagnostic(String),
    /// The gateway rejected the session's identity. The engine is
    /// stopped until a new identity is supplied.
    AuthRequired(String),
}

/// Fan-out of [`SyncEvent`]s to subscribers.
#[derive(Default)]
pub struct EventFeed {
    senders: Mutex<Vec<Sender<SyncEvent>>>,
}

impl EventFeed {
    /// Creates an empty feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to events. The subscription ends when the receiver
    /// is dropped.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::channel();
        self.senders.lock().push(tx);
        rx
    }

    /// Delivers an event to all live subscribers.
    pub fn emit(&self, event: &SyncEvent) {
        self.senders
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_reach_all_subscribers() {
        let feed = EventFeed::new();
        let a = feed.subscribe();
        let b = feed.subscribe();

        feed.emit(&SyncEvent::StateChanged(EngineState::Draining));

        assert_eq!(
            a.try_recv().unwrap(),
            SyncEvent::StateChanged(EngineState::Draining)
        );
        assert_eq!(
            b.try_recv().unwrap(),
            SyncEvent::StateChanged(EngineState::Draining)
        );
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let feed = EventFeed::new();
        drop(feed.subscribe());

        feed.emit(&SyncEvent::StorageDiagnostic("disk full".into()));
        assert_eq!(feed.senders.lock().len(), 0);
    }
}
