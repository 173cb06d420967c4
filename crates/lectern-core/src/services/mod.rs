//! Services shared by every Lectern client

pub mod cascade;
mod store;

pub use cascade::soft_delete_cascade;
pub use store::{ApplyOutcome, CompactionStats, ConflictWrite, LocalApply, SyncStore};
