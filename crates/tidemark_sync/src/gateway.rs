//! Remote gateway capability interface.
//!
//! The engine talks to the remote document store through this narrow
//! interface only; any backend satisfying push-batch / pull-since
//! semantics can sit behind it.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tidemark_types::{EntityId, OperationKind, Payload, PendingOperation, SyncCursor};

/// Outcome of one pushed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// The remote applied the operation and assigned a version.
    Acknowledged {
        /// Server-assigned version after the write.
        remote_version: u64,
    },
    /// The remote's current version differs from the version the
    /// operation was based on.
    VersionConflict {
        /// The remote's current version.
        remote_version: u64,
        /// The remote's current payload. `None` means the remote
        /// deleted the entity.
        remote_payload: Option<Payload>,
    },
    /// The remote could not process the operation right now; retry
    /// with backoff.
    TransientFailure {
        /// Error message.
        message: String,
    },
}

/// One remote-side change reported by a pull.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    /// Entity that changed.
    pub entity_id: EntityId,
    /// Payload after the change. `None` means the entity was deleted.
    pub payload: Option<Payload>,
    /// Server version after the change.
    pub remote_version: u64,
}

/// One page of remote changes.
#[derive(Debug, Clone)]
pub struct PullPage {
    /// Changes in the order the remote store reports them.
    pub changes: Vec<RemoteChange>,
    /// Cursor past this page.
    pub cursor: SyncCursor,
    /// Whether another page follows.
    pub has_more: bool,
}

/// Capability interface to the remote document store.
pub trait RemoteGateway: Send + Sync {
    /// Pushes a batch of operations. Returns one outcome per
    /// operation, in order.
    fn push_batch(&self, operations: &[PendingOperation]) -> SyncResult<Vec<PushOutcome>>;

    /// Pulls changes after `cursor`, at most `limit` of them.
    fn pull_since(&self, cursor: &SyncCursor, limit: usize) -> SyncResult<PullPage>;
}

#[derive(Debug, Clone)]
struct RemoteDoc {
    version: u64,
    /// `None` once deleted; the version keeps advancing.
    payload: Option<Payload>,
}

#[derive(Default)]
struct GatewayInner {
    documents: BTreeMap<EntityId, RemoteDoc>,
    changes: Vec<RemoteChange>,
    pushed: Vec<EntityId>,
    fail_pushes: u32,
    fail_pulls: u32,
    auth_expired: bool,
}

/// An in-memory gateway for tests and demos.
///
/// Behaves like a versioned document store: every write bumps the
/// entity's version, every change lands on an ordered change log that
/// pulls page through. Failures can be injected.
#[derive(Default)]
pub struct MemoryGateway {
    inner: Mutex<GatewayInner>,
}

impl MemoryGateway {
    /// Creates an empty gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an independent server-side write.
    pub fn remote_write(&self, entity_id: EntityId, payload: Payload) {
        let mut inner = self.inner.lock();
        inner.apply(&entity_id, Some(payload));
    }

    /// Simulates an independent server-side delete.
    pub fn remote_delete(&self, entity_id: EntityId) {
        let mut inner = self.inner.lock();
        inner.apply(&entity_id, None);
    }

    /// Returns an entity's current version and payload.
    pub fn document(&self, entity_id: &EntityId) -> Option<(u64, Option<Payload>)> {
        self.inner
            .lock()
            .documents
            .get(entity_id)
            .map(|d| (d.version, d.payload.clone()))
    }

    /// Entity ids in the order their operations were acknowledged.
    pub fn pushed(&self) -> Vec<EntityId> {
        self.inner.lock().pushed.clone()
    }

    /// Makes the next `n` push calls fail with a retryable network
    /// error.
    pub fn fail_next_pushes(&self, n: u32) {
        self.inner.lock().fail_pushes = n;
    }

    /// Makes the next `n` pull calls fail with a retryable network
    /// error.
    pub fn fail_next_pulls(&self, n: u32) {
        self.inner.lock().fail_pulls = n;
    }

    /// Makes every call fail with an authentication error until
    /// [`restore_auth`](Self::restore_auth).
    pub fn expire_auth(&self) {
        self.inner.lock().auth_expired = true;
    }

    /// Clears an injected authentication failure.
    pub fn restore_auth(&self) {
        self.inner.lock().auth_expired = false;
    }
}

impl GatewayInner {
    fn apply(&mut self, entity_id: &EntityId, payload: Option<Payload>) -> u64 {
        let version = self
            .documents
            .get(entity_id)
            .map_or(1, |d| d.version + 1);
        self.documents.insert(
            entity_id.clone(),
            RemoteDoc {
                version,
                payload: payload.clone(),
            },
        );
        self.changes.push(RemoteChange {
            entity_id: entity_id.clone(),
            payload,
            remote_version: version,
        });
        version
    }

    fn check_auth(&self) -> SyncResult<()> {
        if self.auth_expired {
            Err(SyncError::Auth("token expired".into()))
        } else {
            Ok(())
        }
    }
}

impl RemoteGateway for MemoryGateway {
    fn push_batch(&self, operations: &[PendingOperation]) -> SyncResult<Vec<PushOutcome>> {
        let mut inner = self.inner.lock();
        inner.check_auth()?;

        if inner.fail_pushes > 0 {
            inner.fail_pushes -= 1;
            return Err(SyncError::network_retryable("injected push failure"));
        }

        let mut outcomes = Vec::with_capacity(operations.len());
        for op in operations {
            let current = inner.documents.get(&op.entity_id).cloned();

            if let Some(current) = &current {
                if Some(current.version) != op.based_on {
                    outcomes.push(PushOutcome::VersionConflict {
                        remote_version: current.version,
                        remote_payload: current.payload.clone(),
                    });
                    continue;
                }
            }

            let payload = match op.kind {
                OperationKind::Delete => None,
                OperationKind::Create => Some(op.delta.clone()),
                OperationKind::Update => {
                    let base = current
                        .and_then(|d| d.payload)
                        .unwrap_or_default();
                    Some(base.merged_with(&op.delta))
                }
            };

            let remote_version = inner.apply(&op.entity_id, payload);
            inner.pushed.push(op.entity_id.clone());
            outcomes.push(PushOutcome::Acknowledged { remote_version });
        }

        Ok(outcomes)
    }

    fn pull_since(&self, cursor: &SyncCursor, limit: usize) -> SyncResult<PullPage> {
        let mut inner = self.inner.lock();
        inner.check_auth()?;

        if inner.fail_pulls > 0 {
            inner.fail_pulls -= 1;
            return Err(SyncError::network_retryable("injected pull failure"));
        }

        let start: usize = cursor.token().parse().unwrap_or(0);
        let start = start.min(inner.changes.len());
        let end = (start + limit).min(inner.changes.len());

        Ok(PullPage {
            changes: inner.changes[start..end].to_vec(),
            cursor: SyncCursor::from_token(end.to_string()),
            has_more: end < inner.changes.len(),
        })
    }
}
