//! Three-way field reconciliation between local and remote record state.
//!
//! The last acknowledged remote state (`EntityRecord::base`) is the common
//! ancestor. A field is in conflict only when both sides changed it to
//! different values; disjoint edits merge.

use std::collections::BTreeSet;

use crate::models::{EntityRecord, FieldMap, RecordSnapshot, DELETED_FIELD};

/// Result of comparing a local record with an incoming remote snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// The remote version is already reflected locally
    Skip,
    /// Take the remote snapshot as-is
    Adopt,
    /// Keep local edits on top of the remote snapshot
    Merge(RecordSnapshot),
    /// Both sides changed the same fields
    Conflict {
        fields: BTreeSet<String>,
        local: RecordSnapshot,
    },
}

/// Decide how a remote snapshot combines with the local record, if any.
pub fn reconcile(local: Option<&EntityRecord>, remote: &RecordSnapshot) -> Reconciliation {
    let Some(local) = local else {
        return Reconciliation::Adopt;
    };
    if remote.version <= local.acked_version {
        return Reconciliation::Skip;
    }
    if !local.dirty {
        return Reconciliation::Adopt;
    }

    let diff = FieldDiff::new(local, remote);
    if !diff.conflicts.is_empty() {
        return Reconciliation::Conflict {
            fields: diff.conflicts,
            local: local.snapshot(),
        };
    }

    let merged_fields = diff.merged();
    if merged_fields == diff.remote {
        return Reconciliation::Adopt;
    }
    let mut merged = remote.clone().with_sync_fields(merged_fields);
    merged.updated_at = remote.updated_at.max(local.updated_at);
    Reconciliation::Merge(merged)
}

/// Fields changed on both sides to different values.
pub fn conflicting_fields(local: &EntityRecord, remote: &RecordSnapshot) -> BTreeSet<String> {
    FieldDiff::new(local, remote).conflicts
}

struct FieldDiff {
    base: FieldMap,
    local: FieldMap,
    remote: FieldMap,
    conflicts: BTreeSet<String>,
}

impl FieldDiff {
    fn new(local: &EntityRecord, remote: &RecordSnapshot) -> Self {
        let base = local
            .base
            .as_ref()
            .map(RecordSnapshot::sync_fields)
            .unwrap_or_default();
        let local_fields = local.snapshot().sync_fields();
        let remote_fields = remote.sync_fields();

        let mut diff = Self {
            base,
            local: local_fields,
            remote: remote_fields,
            conflicts: BTreeSet::new(),
        };
        let both_deleted = local.is_tombstone() && remote.is_tombstone();

        for key in diff.keys() {
            // Two deletions agree regardless of when they happened
            if both_deleted && key == DELETED_FIELD {
                continue;
            }
            if diff.local_changed(&key)
                && diff.remote_changed(&key)
                && diff.local.get(&key) != diff.remote.get(&key)
            {
                diff.conflicts.insert(key);
            }
        }

        // A delete on one side against an edit on the other is a conflict on
        // the tombstone itself.
        if local.is_tombstone() != remote.is_tombstone() {
            let deleter_local = local.is_tombstone();
            let deletion_is_new = if deleter_local {
                diff.local_changed(DELETED_FIELD)
            } else {
                diff.remote_changed(DELETED_FIELD)
            };
            let other_side_edited = diff.keys().into_iter().any(|key| {
                key != DELETED_FIELD
                    && if deleter_local {
                        diff.remote_changed(&key)
                    } else {
                        diff.local_changed(&key)
                    }
            });
            if deletion_is_new && other_side_edited {
                diff.conflicts.insert(DELETED_FIELD.to_string());
            }
        }

        diff
    }

    fn keys(&self) -> BTreeSet<String> {
        self.base
            .keys()
            .chain(self.local.keys())
            .chain(self.remote.keys())
            .cloned()
            .collect()
    }

    fn local_changed(&self, key: &str) -> bool {
        self.local.get(key) != self.base.get(key)
    }

    fn remote_changed(&self, key: &str) -> bool {
        self.remote.get(key) != self.base.get(key)
    }

    /// Remote state plus every field only the local side changed.
    fn merged(&self) -> FieldMap {
        let mut merged = self.remote.clone();
        for key in self.keys() {
            if key == DELETED_FIELD && self.remote.contains_key(DELETED_FIELD) {
                continue;
            }
            if self.local_changed(&key) && !self.remote_changed(&key) {
                match self.local.get(&key) {
                    Some(value) => {
                        merged.insert(key, value.clone());
                    }
                    None => {
                        merged.remove(&key);
                    }
                }
            }
        }
        merged
    }
}
