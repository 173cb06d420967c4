//! Data models for Lectern

mod content;
mod cursor;
mod operation;
mod record;
mod sync_conflict;

pub use content::{normalize_tags, Content, Sermon, SermonStatus, Series, Visibility};
pub use cursor::{PullPosition, SyncCursor};
pub use operation::{coalesce, OperationEntry, OperationId, OperationKind, OperationStatus};
pub use record::{
    apply_patch, validate_fields, EntityRecord, EntityType, FieldMap, RecordId, RecordSnapshot,
    DELETED_FIELD, PARENT_FIELD,
};
pub use sync_conflict::{ConflictId, ConflictStatus, ConflictSummary, Resolution, SyncConflict};
