//! Conflict records and the deterministic resolver.
//!
//! A conflict arises when the remote version observed during
//! reconciliation differs from the version a local mutation was based
//! on. Resolution is a pure function of the record: same inputs, same
//! outcome, no hidden state.

use crate::entity::{Entity, EntityId, SyncStatus};
use crate::value::Payload;
use std::collections::BTreeSet;

/// Divergence between a local entity and its remote counterpart.
///
/// Holds both sides' payloads for resolution; destroyed once resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    /// Entity in conflict.
    pub entity_id: EntityId,
    /// Local entity state, delta already applied.
    pub local: Entity,
    /// The fields the pending local operation touched.
    pub local_delta: Payload,
    /// The remote store's current version.
    pub remote_version: u64,
    /// The remote store's current payload. `None` means the remote
    /// deleted the entity.
    pub remote_payload: Option<Payload>,
}

/// Outcome of conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Re-push the local change, rebased on the observed remote
    /// version.
    KeepLocal,
    /// Adopt the remote payload and discard the pending local
    /// operation. When `resurface` is set the discarded change could
    /// not be auto-merged and must be surfaced for manual resolution.
    KeepRemote {
        /// Surface the dropped local operation to the caller.
        resurface: bool,
    },
    /// Adopt a field-level merge of both sides and re-push it.
    Merge(Payload),
}

/// Resolves a conflict.
///
/// Policy (the safest general default; see DESIGN.md):
/// - Remote deleted, local mutated → `KeepLocal` (re-push; no silent
///   data loss). Remote deleted and local also deleted → `KeepRemote`
///   (both agree).
/// - Local delete vs. remote update → `KeepRemote` with the delete
///   re-surfaced for manual handling.
/// - Both updated: fields the remote changed (relative to the merge
///   base) are compared against the local delta. Disjoint, or equal
///   where they meet → `Merge` (remote payload overlaid with the
///   local delta). A field both sides changed to different values →
///   `KeepRemote` with the local operation re-surfaced.
#[must_use]
pub fn resolve(record: &ConflictRecord) -> Resolution {
    let Some(remote) = &record.remote_payload else {
        // Remote tombstone.
        return if record.local.status == SyncStatus::Deleted {
            Resolution::KeepRemote { resurface: false }
        } else {
            Resolution::KeepLocal
        };
    };

    if record.local.status == SyncStatus::Deleted {
        return Resolution::KeepRemote { resurface: true };
    }

    let remote_changed = changed_fields(record.local.base_payload.as_ref(), remote);

    let contested = record.local_delta.field_names().any(|name| {
        remote_changed.contains(name) && remote.get(name) != record.local_delta.get(name)
    });

    if contested {
        Resolution::KeepRemote { resurface: true }
    } else {
        Resolution::Merge(remote.merged_with(&record.local_delta))
    }
}

/// Field names whose value differs between the merge base and the
/// remote payload. Without a base (never synced) every remote field
/// counts as changed.
fn changed_fields<'a>(base: Option<&Payload>, remote: &'a Payload) -> BTreeSet<&'a str> {
    match base {
        None => remote.field_names().collect(),
        Some(base) => remote
            .field_names()
            .filter(|name| base.get(name) != remote.get(name))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    fn record(
        local: Entity,
        local_delta: Payload,
        remote_version: u64,
        remote_payload: Option<Payload>,
    ) -> ConflictRecord {
        ConflictRecord {
            entity_id: local.id.clone(),
            local,
            local_delta,
            remote_version,
            remote_payload,
        }
    }

    fn synced_entity(base: Payload) -> Entity {
        Entity::from_remote("e1".into(), base, 1)
    }

    #[test]
    fn disjoint_fields_merge() {
        // Base {a:1, b:1}; local changed b, remote changed a.
        let base = Payload::new().with("a", 1i64).with("b", 1i64);
        let mut local = synced_entity(base.clone());
        let delta = Payload::new().with("b", 2i64);
        local.apply_local_delta(&delta);

        let remote = Payload::new().with("a", 9i64).with("b", 1i64);
        let r = record(local, delta, 2, Some(remote));

        match resolve(&r) {
            Resolution::Merge(merged) => {
                assert_eq!(merged.get("a"), Some(&crate::FieldValue::Integer(9)));
                assert_eq!(merged.get("b"), Some(&crate::FieldValue::Integer(2)));
            }
            other => panic!("expected Merge, got {other:?}"),
        }
    }

    #[test]
    fn contested_field_falls_back_to_remote() {
        let base = Payload::new().with("a", 1i64);
        let mut local = synced_entity(base);
        let delta = Payload::new().with("a", 2i64);
        local.apply_local_delta(&delta);

        let remote = Payload::new().with("a", 3i64);
        let r = record(local, delta, 2, Some(remote));

        assert_eq!(resolve(&r), Resolution::KeepRemote { resurface: true });
    }

    #[test]
    fn same_value_on_both_sides_is_not_contested() {
        let base = Payload::new().with("a", 1i64);
        let mut local = synced_entity(base);
        let delta = Payload::new().with("a", 5i64);
        local.apply_local_delta(&delta);

        // Remote independently wrote the same value.
        let remote = Payload::new().with("a", 5i64);
        let r = record(local, delta, 2, Some(remote));

        assert!(matches!(resolve(&r), Resolution::Merge(_)));
    }

    #[test]
    fn remote_delete_keeps_local_mutation() {
        let mut local = synced_entity(Payload::new().with("a", 1i64));
        let delta = Payload::new().with("a", 2i64);
        local.apply_local_delta(&delta);

        let r = record(local, delta, 2, None);
        assert_eq!(resolve(&r), Resolution::KeepLocal);
    }

    #[test]
    fn both_deleted_agree() {
        let mut local = synced_entity(Payload::new());
        local.mark_deleted();

        let r = record(local, Payload::new(), 2, None);
        assert_eq!(resolve(&r), Resolution::KeepRemote { resurface: false });
    }

    #[test]
    fn local_delete_vs_remote_update_resurfaces() {
        let mut local = synced_entity(Payload::new().with("a", 1i64));
        local.mark_deleted();

        let r = record(local, Payload::new(), 2, Some(Payload::new().with("a", 2i64)));
        assert_eq!(resolve(&r), Resolution::KeepRemote { resurface: true });
    }

    #[test]
    fn resolution_is_deterministic() {
        let base = Payload::new().with("a", 1i64).with("b", 1i64);
        let mut local = synced_entity(base);
        let delta = Payload::new().with("b", 7i64);
        local.apply_local_delta(&delta);

        let r = record(local, delta, 3, Some(Payload::new().with("a", 4i64).with("b", 1i64)));
        assert_eq!(resolve(&r), resolve(&r));
    }
}
