//! Sync conflict model

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;
use crate::models::{EntityType, RecordId, RecordSnapshot};

/// Conflict row identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

impl ConflictStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
        }
    }
}

impl FromStr for ConflictStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            other => Err(Error::Database(format!("unknown conflict status '{other}'"))),
        }
    }
}

/// How a conflict was (or should be) resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
    Merged,
}

impl Resolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalWins => "local_wins",
            Self::RemoteWins => "remote_wins",
            Self::Merged => "merged",
        }
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "local_wins" | "local" => Ok(Self::LocalWins),
            "remote_wins" | "remote" => Ok(Self::RemoteWins),
            "merged" | "merge" => Ok(Self::Merged),
            other => Err(Error::InvalidInput(format!("unknown resolution '{other}'"))),
        }
    }
}

/// Divergent concurrent edits detected during reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: ConflictId,
    pub entity_type: EntityType,
    pub entity_id: RecordId,
    pub local_snapshot: RecordSnapshot,
    pub remote_snapshot: RecordSnapshot,
    /// Fields modified on both sides since the last common version
    pub conflicting_fields: BTreeSet<String>,
    pub status: ConflictStatus,
    pub resolution: Option<Resolution>,
    /// Name of the policy that handled the conflict
    pub strategy: String,
    /// Detection timestamp (unix ms)
    pub created_at: i64,
    /// Resolution timestamp (unix ms)
    pub resolved_at: Option<i64>,
}

impl SyncConflict {
    /// Create a pending conflict
    #[must_use]
    pub fn new(
        local_snapshot: RecordSnapshot,
        remote_snapshot: RecordSnapshot,
        conflicting_fields: BTreeSet<String>,
        strategy: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            entity_type: remote_snapshot.entity_type,
            entity_id: remote_snapshot.id,
            local_snapshot,
            remote_snapshot,
            conflicting_fields,
            status: ConflictStatus::Pending,
            resolution: None,
            strategy: strategy.into(),
            created_at: now,
            resolved_at: None,
        }
    }

    /// Mark as resolved
    #[must_use]
    pub const fn resolved(mut self, resolution: Resolution, now: i64) -> Self {
        self.status = ConflictStatus::Resolved;
        self.resolution = Some(resolution);
        self.resolved_at = Some(now);
        self
    }

    #[must_use]
    pub fn summary(&self) -> ConflictSummary {
        ConflictSummary {
            id: self.id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            conflicting_fields: self.conflicting_fields.iter().cloned().collect(),
            status: self.status,
            resolution: self.resolution,
        }
    }
}

/// Compact view of a conflict returned in sync reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSummary {
    pub id: ConflictId,
    pub entity_type: EntityType,
    pub entity_id: RecordId,
    pub conflicting_fields: Vec<String>,
    pub status: ConflictStatus,
    pub resolution: Option<Resolution>,
}
