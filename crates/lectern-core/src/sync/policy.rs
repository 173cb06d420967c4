//! Named conflict policies.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::models::{RecordSnapshot, Resolution};

/// What a policy decided for a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    LocalWins,
    RemoteWins,
    /// Leave the conflict pending for a caller to resolve
    Defer,
}

impl PolicyDecision {
    pub const fn resolution(self) -> Option<Resolution> {
        match self {
            Self::LocalWins => Some(Resolution::LocalWins),
            Self::RemoteWins => Some(Resolution::RemoteWins),
            Self::Defer => None,
        }
    }
}

/// Decides the outcome of concurrent edits to the same fields.
pub trait ConflictPolicy: Send + Sync {
    /// Stored with every conflict the policy handles.
    fn name(&self) -> &'static str;

    fn decide(
        &self,
        local: &RecordSnapshot,
        remote: &RecordSnapshot,
        conflicting_fields: &BTreeSet<String>,
    ) -> PolicyDecision;
}

/// Whole-record last-write-wins on `updated_at`; the remote side wins ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictPolicy for LastWriteWins {
    fn name(&self) -> &'static str {
        "last-write-wins"
    }

    fn decide(
        &self,
        local: &RecordSnapshot,
        remote: &RecordSnapshot,
        _conflicting_fields: &BTreeSet<String>,
    ) -> PolicyDecision {
        if local.updated_at > remote.updated_at {
            PolicyDecision::LocalWins
        } else {
            PolicyDecision::RemoteWins
        }
    }
}

/// Never resolves automatically.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualResolution;

impl ConflictPolicy for ManualResolution {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn decide(
        &self,
        _local: &RecordSnapshot,
        _remote: &RecordSnapshot,
        _conflicting_fields: &BTreeSet<String>,
    ) -> PolicyDecision {
        PolicyDecision::Defer
    }
}

/// Look a policy up by name.
pub fn policy_from_name(name: &str) -> Option<Arc<dyn ConflictPolicy>> {
    match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "last-write-wins" | "lww" => Some(Arc::new(LastWriteWins)),
        "manual" | "manual-resolution" => Some(Arc::new(ManualResolution)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityRecord, EntityType, FieldMap};

    fn snapshot(updated_at: i64) -> RecordSnapshot {
        let mut snapshot =
            EntityRecord::new_local(EntityType::Sermon, "owner", None, FieldMap::new(), 0)
                .snapshot();
        snapshot.updated_at = updated_at;
        snapshot
    }

    #[test]
    fn test_last_write_wins_prefers_later_and_remote_on_tie() {
        let fields = BTreeSet::new();
        let policy = LastWriteWins;
        assert_eq!(
            policy.decide(&snapshot(20), &snapshot(10), &fields),
            PolicyDecision::LocalWins
        );
        assert_eq!(
            policy.decide(&snapshot(10), &snapshot(20), &fields),
            PolicyDecision::RemoteWins
        );
        assert_eq!(
            policy.decide(&snapshot(10), &snapshot(10), &fields),
            PolicyDecision::RemoteWins
        );
    }

    #[test]
    fn test_manual_always_defers() {
        let decision = ManualResolution.decide(&snapshot(20), &snapshot(10), &BTreeSet::new());
        assert_eq!(decision, PolicyDecision::Defer);
        assert_eq!(decision.resolution(), None);
    }

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(policy_from_name("LWW").unwrap().name(), "last-write-wins");
        assert_eq!(policy_from_name("manual").unwrap().name(), "manual");
        assert!(policy_from_name("first-write-wins").is_none());
    }
}
