//! Entity records and their sync metadata

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;
use crate::models::PullPosition;

/// Opaque domain fields of a record (title, body, tags, ...)
pub type FieldMap = BTreeMap<String, Value>;

/// Pseudo-field name used for `parent_id` when diffing records
pub const PARENT_FIELD: &str = "parent_id";
/// Pseudo-field name used for `deleted_at` when diffing records
pub const DELETED_FIELD: &str = "deleted_at";

/// Content types that take part in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Series,
    Sermon,
}

impl EntityType {
    /// All entity types, parents before children
    pub const ALL: [Self; 2] = [Self::Series, Self::Sermon];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Series => "series",
            Self::Sermon => "sermon",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "series" => Ok(Self::Series),
            "sermon" | "sermons" => Ok(Self::Sermon),
            other => Err(Error::InvalidInput(format!("unknown entity type '{other}'"))),
        }
    }
}

/// A client-generated record identifier, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Point-in-time state of a record as exchanged with the remote store.
///
/// Used for operation log payloads, remote pull results, conflict snapshots
/// and the last acknowledged base of a local record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub id: RecordId,
    pub entity_type: EntityType,
    pub owner_id: String,
    #[serde(default)]
    pub parent_id: Option<RecordId>,
    #[serde(default)]
    pub fields: FieldMap,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted_at: Option<i64>,
    /// Version assigned by the remote store (0 = never acknowledged)
    #[serde(default)]
    pub version: i64,
}

impl RecordSnapshot {
    pub const fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Position of this record in a pull feed
    pub const fn position(&self) -> PullPosition {
        PullPosition {
            updated_at: self.updated_at,
            id: Some(self.id),
        }
    }

    /// Every field that takes part in conflict diffing: the domain fields
    /// plus the parent reference and the tombstone marker.
    pub fn sync_fields(&self) -> FieldMap {
        let mut fields = self.fields.clone();
        if let Some(parent_id) = self.parent_id {
            fields.insert(PARENT_FIELD.to_string(), Value::String(parent_id.as_str()));
        }
        if let Some(deleted_at) = self.deleted_at {
            fields.insert(DELETED_FIELD.to_string(), Value::from(deleted_at));
        }
        fields
    }

    /// Inverse of [`Self::sync_fields`]: replaces content with a diffed field map.
    #[must_use]
    pub fn with_sync_fields(mut self, mut fields: FieldMap) -> Self {
        self.parent_id = fields
            .remove(PARENT_FIELD)
            .and_then(|value| value.as_str().and_then(|raw| raw.parse().ok()));
        self.deleted_at = fields.remove(DELETED_FIELD).and_then(|value| value.as_i64());
        self.fields = fields;
        self
    }
}

/// A locally stored record plus its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: RecordId,
    pub entity_type: EntityType,
    pub owner_id: String,
    /// Weak reference to another record (a sermon's series)
    pub parent_id: Option<RecordId>,
    pub fields: FieldMap,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms), never decreases
    pub updated_at: i64,
    /// Tombstone timestamp; set means soft-deleted
    pub deleted_at: Option<i64>,
    /// Local changes not yet confirmed by the remote store
    pub dirty: bool,
    /// Incremented on every local write; equals `acked_version` when clean
    pub sync_version: i64,
    /// Last version acknowledged by the remote store
    pub acked_version: i64,
    /// Last acknowledged remote state, the common ancestor for field diffs
    pub base: Option<RecordSnapshot>,
    /// Automatic sync halted after an invariant violation
    pub blocked: bool,
}

impl EntityRecord {
    /// Create a new, never-synced local record
    #[must_use]
    pub fn new_local(
        entity_type: EntityType,
        owner_id: impl Into<String>,
        parent_id: Option<RecordId>,
        fields: FieldMap,
        now: i64,
    ) -> Self {
        Self {
            id: RecordId::new(),
            entity_type,
            owner_id: owner_id.into(),
            parent_id,
            fields,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            dirty: true,
            sync_version: 1,
            acked_version: 0,
            base: None,
            blocked: false,
        }
    }

    /// Build a clean local record from acknowledged remote state
    #[must_use]
    pub fn from_remote(remote: &RecordSnapshot) -> Self {
        Self {
            id: remote.id,
            entity_type: remote.entity_type,
            owner_id: remote.owner_id.clone(),
            parent_id: remote.parent_id,
            fields: remote.fields.clone(),
            created_at: remote.created_at,
            updated_at: remote.updated_at,
            deleted_at: remote.deleted_at,
            dirty: false,
            sync_version: remote.version,
            acked_version: remote.version,
            base: Some(remote.clone()),
            blocked: false,
        }
    }

    pub const fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Current content as a snapshot; `version` is the last acknowledged one.
    #[must_use]
    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            id: self.id,
            entity_type: self.entity_type,
            owner_id: self.owner_id.clone(),
            parent_id: self.parent_id,
            fields: self.fields.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            version: self.acked_version,
        }
    }

    /// Register a local write: bump the version, mark dirty, advance `updated_at`.
    pub fn touch(&mut self, now: i64) {
        self.updated_at = self.updated_at.max(now);
        self.sync_version += 1;
        self.dirty = true;
    }

    /// Overwrite content with confirmed remote state and clear dirty.
    pub fn adopt_remote(&mut self, remote: &RecordSnapshot) {
        self.set_content(remote);
        self.updated_at = remote.updated_at;
        self.dirty = false;
        self.sync_version = remote.version;
        self.acked_version = remote.version;
        self.base = Some(remote.clone());
    }

    /// Keep `content` as local state on top of `remote`, dirty for a follow-up push.
    pub fn rebase_onto(&mut self, content: &RecordSnapshot, remote: &RecordSnapshot) {
        self.set_content(content);
        self.updated_at = content.updated_at.max(self.updated_at);
        self.dirty = true;
        self.acked_version = remote.version;
        self.sync_version = remote.version + 1;
        self.base = Some(remote.clone());
    }

    fn set_content(&mut self, snapshot: &RecordSnapshot) {
        self.owner_id.clone_from(&snapshot.owner_id);
        self.parent_id = snapshot.parent_id;
        self.fields.clone_from(&snapshot.fields);
        self.deleted_at = snapshot.deleted_at;
    }

    /// Check the local sync invariants.
    ///
    /// A clean record must sit exactly at its acknowledged version; a dirty
    /// one must be ahead of it.
    pub fn check_invariants(&self) -> Result<(), String> {
        if !self.dirty && self.sync_version != self.acked_version {
            return Err(format!(
                "clean record {} has sync_version {} but acked_version {}",
                self.id, self.sync_version, self.acked_version
            ));
        }
        if self.dirty && self.sync_version <= self.acked_version {
            return Err(format!(
                "dirty record {} has stale sync_version {} (acked {})",
                self.id, self.sync_version, self.acked_version
            ));
        }
        Ok(())
    }
}

/// Validate that caller-supplied domain fields don't shadow sync pseudo-fields
pub fn validate_fields(fields: &FieldMap) -> crate::Result<()> {
    for reserved in [PARENT_FIELD, DELETED_FIELD] {
        if fields.contains_key(reserved) {
            return Err(Error::InvalidInput(format!(
                "field '{reserved}' is reserved"
            )));
        }
    }
    Ok(())
}

/// Apply a field patch; `null` values remove the field.
pub fn apply_patch(fields: &mut FieldMap, patch: FieldMap) {
    for (key, value) in patch {
        if value.is_null() {
            fields.remove(&key);
        } else {
            fields.insert(key, value);
        }
    }
}
