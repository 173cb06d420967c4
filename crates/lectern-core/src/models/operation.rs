//! Operation log entries

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::models::{EntityType, RecordId, RecordSnapshot};

/// Deterministic operation identifier: `<entity id>:<local write sequence>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    #[must_use]
    pub fn from_parts(entity_id: &RecordId, seq: i64) -> Self {
        Self(format!("{entity_id}:{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for OperationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of local mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::Database(format!("unknown operation kind '{other}'"))),
        }
    }
}

/// Lifecycle of an operation log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Failed,
    Completed,
}

impl OperationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            other => Err(Error::Database(format!(
                "unknown operation status '{other}'"
            ))),
        }
    }
}

/// A pending (or settled) local mutation awaiting push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEntry {
    pub id: OperationId,
    /// Device-wide local write sequence number
    pub seq: i64,
    pub entity_type: EntityType,
    pub entity_id: RecordId,
    pub kind: OperationKind,
    /// Record state when the entry was enqueued
    pub payload: RecordSnapshot,
    /// The record's `sync_version` right after the write
    pub local_version: i64,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Earliest time (Unix ms) the entry may be claimed again
    pub next_attempt_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OperationEntry {
    /// Create a pending entry for a local write
    #[must_use]
    pub fn new(
        seq: i64,
        kind: OperationKind,
        payload: RecordSnapshot,
        local_version: i64,
        now: i64,
    ) -> Self {
        Self {
            id: OperationId::from_parts(&payload.id, seq),
            seq,
            entity_type: payload.entity_type,
            entity_id: payload.id,
            kind,
            payload,
            local_version,
            status: OperationStatus::Pending,
            retry_count: 0,
            last_error: None,
            next_attempt_at: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Keep only the newest entry per record, in sequence order.
///
/// Returns `(to_push, superseded)`.
pub fn coalesce(entries: Vec<OperationEntry>) -> (Vec<OperationEntry>, Vec<OperationEntry>) {
    let mut newest: Vec<OperationEntry> = Vec::with_capacity(entries.len());
    let mut superseded = Vec::new();

    for entry in entries {
        if let Some(position) = newest
            .iter()
            .position(|existing| existing.entity_id == entry.entity_id)
        {
            if newest[position].seq < entry.seq {
                superseded.push(newest.remove(position));
                newest.push(entry);
            } else {
                superseded.push(entry);
            }
        } else {
            newest.push(entry);
        }
    }

    newest.sort_by_key(|entry| entry.seq);
    (newest, superseded)
}
