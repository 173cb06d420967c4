//! Session summaries and engine status.

use serde::{Deserialize, Serialize};

use crate::models::{ConflictSummary, EntityType, OperationId, RecordId};
use crate::services::CompactionStats;

/// Engine lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Pushing,
    Pulling,
    Reconciling,
    Failed,
}

impl SyncPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pushing => "pushing",
            Self::Pulling => "pulling",
            Self::Reconciling => "reconciling",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A push the remote store refused, or one that ran out of retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub operation_id: OperationId,
    pub entity_type: EntityType,
    pub entity_id: RecordId,
    pub error: String,
    pub retry_count: u32,
    /// No further automatic retries; needs a requeue
    pub exhausted: bool,
}

/// Outcome of one sync session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Operations confirmed by the remote store
    pub pushed: usize,
    /// Remote records that changed local state
    pub pulled: usize,
    /// Conflicts detected this session, resolved or pending
    pub conflicts: Vec<ConflictSummary>,
    pub failed_operations: Vec<FailedOperation>,
    /// Types whose push or pull pass stopped early; retried next session
    pub deferred_entity_types: Vec<EntityType>,
    /// Records quarantined this session
    pub blocked_records: Vec<RecordId>,
    pub compaction: CompactionStats,
    pub started_at: i64,
    pub finished_at: i64,
}

impl SyncReport {
    pub(crate) fn defer(&mut self, entity_type: EntityType) {
        if !self.deferred_entity_types.contains(&entity_type) {
            self.deferred_entity_types.push(entity_type);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.deferred_entity_types.is_empty() && self.failed_operations.is_empty()
    }
}

/// Snapshot of the engine and its queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub last_sync_at: Option<i64>,
    /// Pending plus in-flight operations
    pub pending_operations: u64,
    pub failed_operations: u64,
    pub pending_conflicts: u64,
    pub blocked_records: usize,
    pub last_error: Option<String>,
}
