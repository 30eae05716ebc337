//! Update feed for observing committed entity writes.
//!
//! The feed emits an [`Entity`] snapshot after every committed write,
//! backing the UI-facing `subscribe` operation. Subscriptions are
//! per-entity or firehose; a dropped receiver is pruned on the next
//! emit, which is how a subscription terminates.

use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};
use tidemark_types::{Entity, EntityId};

/// Receiving half of an update subscription.
pub type UpdateReceiver = Receiver<Entity>;

struct Subscription {
    /// `None` subscribes to every entity.
    filter: Option<EntityId>,
    sender: Sender<Entity>,
}

/// Distributes committed entity updates to subscribers.
///
/// Emission order matches commit order. Thread-safe.
#[derive(Default)]
pub struct UpdateFeed {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl UpdateFeed {
    /// Creates an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to updates for one entity (`Some`) or all entities
    /// (`None`). The subscription ends when the receiver is dropped.
    pub fn subscribe(&self, filter: Option<EntityId>) -> UpdateReceiver {
        let (tx, rx) = mpsc::channel();
        self.subscriptions.write().push(Subscription {
            filter,
            sender: tx,
        });
        rx
    }

    /// Emits a committed entity snapshot to matching subscribers,
    /// pruning any whose receiver is gone.
    pub fn emit(&self, entity: &Entity) {
        let mut subs = self.subscriptions.write();
        subs.retain(|sub| {
            let matches = sub
                .filter
                .as_ref()
                .is_none_or(|id| id == &entity.id);
            if matches {
                sub.sender.send(entity.clone()).is_ok()
            } else {
                // Keep silent subscriptions; they may match later.
                true
            }
        });
    }

    /// Returns the number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_types::Payload;

    fn entity(id: &str, v: i64) -> Entity {
        Entity::created_locally(id.into(), Payload::new().with("v", v))
    }

    #[test]
    fn firehose_receives_everything() {
        let feed = UpdateFeed::new();
        let rx = feed.subscribe(None);

        feed.emit(&entity("e1", 1));
        feed.emit(&entity("e2", 2));

        assert_eq!(rx.recv().unwrap().id, EntityId::new("e1"));
        assert_eq!(rx.recv().unwrap().id, EntityId::new("e2"));
    }

    #[test]
    fn filtered_subscription_sees_only_its_entity() {
        let feed = UpdateFeed::new();
        let rx = feed.subscribe(Some(EntityId::new("e2")));

        feed.emit(&entity("e1", 1));
        feed.emit(&entity("e2", 2));

        let got = rx.recv().unwrap();
        assert_eq!(got.id, EntityId::new("e2"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let feed = UpdateFeed::new();
        let rx = feed.subscribe(None);
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit(&entity("e1", 1));
        assert_eq!(feed.subscriber_count(), 0);
    }
}
