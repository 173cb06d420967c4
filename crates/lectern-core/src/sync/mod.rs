//! Offline-first synchronization.
//!
//! [`SyncEngine`] pushes the operation log to a [`RemoteGateway`], pulls
//! remote changes per entity type, and reconciles them with local state
//! under a [`ConflictPolicy`].

mod auth;
mod engine;
mod error;
mod gateway;
mod http;
mod memory;
mod policy;
pub mod reconcile;
mod report;
mod session;

pub use auth::{AuthError, CredentialProvider, StaticCredentialProvider};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use gateway::{
    AccessToken, GatewayError, PullBatch, PullRequest, PushOutcome, PushRequest, RemoteGateway,
};
pub use http::HttpGateway;
pub use memory::MemoryGateway;
pub use policy::{policy_from_name, ConflictPolicy, LastWriteWins, ManualResolution, PolicyDecision};
pub use report::{FailedOperation, SyncPhase, SyncReport, SyncStatus};
