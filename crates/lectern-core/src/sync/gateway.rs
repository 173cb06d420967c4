//! Remote Gateway abstraction.
//!
//! The engine talks to the canonical store only through [`RemoteGateway`].
//! A concrete backend is chosen once, at construction, and passed in as a
//! trait object.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{EntityType, OperationId, PullPosition, RecordSnapshot};

/// Bearer credential for gateway calls.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("AccessToken([REDACTED])")
    }
}

/// Push one record with an optimistic-concurrency precondition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Idempotency key; a backend may deduplicate retried pushes by it
    pub operation_id: OperationId,
    pub entity_type: EntityType,
    pub record: RecordSnapshot,
    /// Remote version the local edit is based on (0 for a first push)
    pub expected_version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PushOutcome {
    /// Stored; the remote store assigned `version` and `updated_at`
    Accepted { version: i64, updated_at: i64 },
    /// The remote record moved past `expected_version`
    VersionConflict { current: RecordSnapshot },
}

/// Request the changes of one type after `since`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub entity_type: EntityType,
    pub since: PullPosition,
    pub limit: usize,
}

/// One page of remote changes, tombstones included, ordered by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullBatch {
    pub records: Vec<RecordSnapshot>,
    pub next_cursor: PullPosition,
    #[serde(default)]
    pub has_more: bool,
}

/// Gateway call failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network or server-side failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The call did not finish within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// Credential missing, expired or refused.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote store refused this payload.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// Whether the call should be retried with backoff.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }
}

/// Capability to push to and pull from the canonical remote store.
///
/// Both calls must be safe to retry with the same arguments.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    async fn push(
        &self,
        token: &AccessToken,
        request: &PushRequest,
    ) -> Result<PushOutcome, GatewayError>;

    async fn pull(
        &self,
        token: &AccessToken,
        request: &PullRequest,
    ) -> Result<PullBatch, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_token_debug_redacts_secret() {
        let token = AccessToken::new("secret-value");
        let debug = format!("{token:?}");
        assert!(!debug.contains("secret-value"));
        assert!(debug.contains("[REDACTED]"));
        assert_eq!(token.secret(), "secret-value");
    }

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::Timeout.is_transient());
        assert!(GatewayError::Transport("reset".into()).is_transient());
        assert!(!GatewayError::Unauthorized("expired".into()).is_transient());
        assert!(!GatewayError::Protocol("bad json".into()).is_transient());
        assert!(!GatewayError::Rejected("too long".into()).is_transient());
    }
}
