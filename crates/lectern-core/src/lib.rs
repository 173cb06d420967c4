//! lectern-core - Core library for Lectern
//!
//! Offline-first storage and multi-device sync for sermon and series
//! authoring: the local store and operation log, conflict detection and
//! resolution, and the sync engine shared by every Lectern interface.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod sync;
pub mod util;

pub use config::{RetryPolicy, SyncConfig};
pub use error::{Error, Result};
pub use models::{EntityRecord, EntityType, RecordId, RecordSnapshot, Sermon, Series};
pub use services::SyncStore;
pub use sync::{SyncEngine, SyncError, SyncReport};
