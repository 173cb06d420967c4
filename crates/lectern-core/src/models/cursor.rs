//! Per-entity-type sync watermarks

use serde::{Deserialize, Serialize};

use crate::models::{EntityType, RecordId};

/// Position in a remote change feed.
///
/// Ordered by `(updated_at, id)` so records sharing a timestamp are still
/// told apart by id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PullPosition {
    pub updated_at: i64,
    #[serde(default)]
    pub id: Option<RecordId>,
}

impl PullPosition {
    /// Start of the feed
    pub const ORIGIN: Self = Self {
        updated_at: 0,
        id: None,
    };
}

/// Watermarks for one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub entity_type: EntityType,
    /// Time (Unix ms) of the last push pass that fully drained this type
    pub last_pushed_at: Option<i64>,
    /// Position of the last record seen by a completed pull pass
    pub last_pulled: PullPosition,
}

impl SyncCursor {
    pub const fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            last_pushed_at: None,
            last_pulled: PullPosition::ORIGIN,
        }
    }

    pub const fn last_pulled_at(&self) -> i64 {
        self.last_pulled.updated_at
    }
}
