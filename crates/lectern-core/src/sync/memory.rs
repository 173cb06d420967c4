//! In-process remote store.
//!
//! Behaves like the canonical backend: assigns versions and feed timestamps,
//! enforces the version precondition, deduplicates pushes by operation id,
//! and serves ordered change feeds. Several devices can share one instance
//! by cloning it. Faults can be queued to exercise retry and recovery paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::models::{EntityType, OperationId, RecordId, RecordSnapshot};
use crate::sync::{
    AccessToken, GatewayError, PullBatch, PullRequest, PushOutcome, PushRequest, RemoteGateway,
};

enum PushFault {
    Fail(GatewayError),
    /// Store the push, then lose the response
    DropResponse,
}

#[derive(Default)]
struct State {
    records: HashMap<RecordId, RecordSnapshot>,
    accepted: HashMap<OperationId, PushOutcome>,
    high_water: i64,
    required_token: Option<String>,
    push_faults: VecDeque<PushFault>,
    pull_faults: Vec<(Option<EntityType>, GatewayError)>,
    push_count: usize,
    pull_count: usize,
}

/// Shared in-memory [`RemoteGateway`].
#[derive(Clone, Default)]
pub struct MemoryGateway {
    state: Arc<Mutex<State>>,
    latency: Duration,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse calls that don't present `token`.
    #[must_use]
    pub fn with_required_token(self, token: impl Into<String>) -> Self {
        self.state.lock().required_token = Some(token.into());
        self
    }

    /// Delay every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Insert a record directly, as if another client had pushed it.
    pub fn seed(&self, record: RecordSnapshot) {
        let mut state = self.state.lock();
        state.high_water = state.high_water.max(record.updated_at);
        state.records.insert(record.id, record);
    }

    pub fn record(&self, id: &RecordId) -> Option<RecordSnapshot> {
        self.state.lock().records.get(id).cloned()
    }

    /// All stored records of a type, in feed order.
    pub fn records(&self, entity_type: EntityType) -> Vec<RecordSnapshot> {
        let state = self.state.lock();
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|record| record.entity_type == entity_type)
            .cloned()
            .collect();
        records.sort_by_key(RecordSnapshot::position);
        records
    }

    pub fn fail_next_push(&self, error: GatewayError) {
        self.state.lock().push_faults.push_back(PushFault::Fail(error));
    }

    /// Apply the next push but answer it with a timeout.
    pub fn drop_next_push_response(&self) {
        self.state.lock().push_faults.push_back(PushFault::DropResponse);
    }

    pub fn fail_next_pull(&self, error: GatewayError) {
        self.state.lock().pull_faults.push((None, error));
    }

    /// Fail the next pull of one entity type.
    pub fn fail_next_pull_of(&self, entity_type: EntityType, error: GatewayError) {
        self.state.lock().pull_faults.push((Some(entity_type), error));
    }

    /// Pushes that reached the store, faults included.
    pub fn push_count(&self) -> usize {
        self.state.lock().push_count
    }

    pub fn pull_count(&self) -> usize {
        self.state.lock().pull_count
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl State {
    fn authorize(&self, token: &AccessToken) -> Result<(), GatewayError> {
        match &self.required_token {
            Some(required) if required != token.secret() => {
                Err(GatewayError::Unauthorized("invalid access token".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn apply_push(&mut self, request: &PushRequest) -> Result<PushOutcome, GatewayError> {
        if let Some(outcome) = self.accepted.get(&request.operation_id) {
            return Ok(outcome.clone());
        }

        let incoming = &request.record;
        if incoming.entity_type != request.entity_type {
            return Err(GatewayError::Rejected(format!(
                "record {} is a {}, not a {}",
                incoming.id, incoming.entity_type, request.entity_type
            )));
        }
        if incoming.owner_id.trim().is_empty() {
            return Err(GatewayError::Rejected("owner_id is required".to_string()));
        }

        let current = self.records.get(&incoming.id);
        let current_version = current.map_or(0, |record| record.version);
        if request.expected_version != current_version {
            return match current {
                Some(current) => Ok(PushOutcome::VersionConflict {
                    current: current.clone(),
                }),
                None => Err(GatewayError::Rejected(format!(
                    "record {} does not exist at version {}",
                    incoming.id, request.expected_version
                ))),
            };
        }

        let updated_at = incoming.updated_at.max(self.high_water + 1);
        let mut stored = incoming.clone();
        if let Some(current) = current {
            stored.created_at = current.created_at;
        }
        stored.version = current_version + 1;
        stored.updated_at = updated_at;
        self.high_water = updated_at;

        let outcome = PushOutcome::Accepted {
            version: stored.version,
            updated_at,
        };
        self.records.insert(stored.id, stored);
        self.accepted
            .insert(request.operation_id.clone(), outcome.clone());
        Ok(outcome)
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push(
        &self,
        token: &AccessToken,
        request: &PushRequest,
    ) -> Result<PushOutcome, GatewayError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.authorize(token)?;
        state.push_count += 1;
        match state.push_faults.pop_front() {
            Some(PushFault::Fail(error)) => Err(error),
            Some(PushFault::DropResponse) => {
                state.apply_push(request)?;
                Err(GatewayError::Timeout)
            }
            None => state.apply_push(request),
        }
    }

    async fn pull(
        &self,
        token: &AccessToken,
        request: &PullRequest,
    ) -> Result<PullBatch, GatewayError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.authorize(token)?;
        state.pull_count += 1;
        let fault = state
            .pull_faults
            .iter()
            .position(|(target, _)| target.is_none() || *target == Some(request.entity_type));
        if let Some(index) = fault {
            return Err(state.pull_faults.remove(index).1);
        }

        let mut changes: Vec<_> = state
            .records
            .values()
            .filter(|record| {
                record.entity_type == request.entity_type && record.position() > request.since
            })
            .cloned()
            .collect();
        changes.sort_by_key(RecordSnapshot::position);

        let limit = request.limit.max(1);
        let has_more = changes.len() > limit;
        changes.truncate(limit);
        let next_cursor = changes
            .last()
            .map_or(request.since, RecordSnapshot::position);

        Ok(PullBatch {
            records: changes,
            next_cursor,
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityRecord, FieldMap, PullPosition};
    use pretty_assertions::assert_eq;

    fn token() -> AccessToken {
        AccessToken::new("token")
    }

    fn push_request(record: &RecordSnapshot, seq: i64, expected_version: i64) -> PushRequest {
        PushRequest {
            operation_id: OperationId::from_parts(&record.id, seq),
            entity_type: record.entity_type,
            record: record.clone(),
            expected_version,
        }
    }

    fn new_snapshot(entity_type: EntityType, now: i64) -> RecordSnapshot {
        EntityRecord::new_local(entity_type, "owner", None, FieldMap::new(), now).snapshot()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_push_assigns_versions_and_checks_precondition() {
        let gateway = MemoryGateway::new();
        let record = new_snapshot(EntityType::Sermon, 500);

        let outcome = gateway.push(&token(), &push_request(&record, 1, 0)).await.unwrap();
        assert_eq!(outcome, PushOutcome::Accepted { version: 1, updated_at: 500 });

        let outcome = gateway.push(&token(), &push_request(&record, 2, 1)).await.unwrap();
        assert_eq!(outcome, PushOutcome::Accepted { version: 2, updated_at: 501 });

        let stale = gateway.push(&token(), &push_request(&record, 3, 1)).await.unwrap();
        let PushOutcome::VersionConflict { current } = stale else {
            panic!("expected version conflict");
        };
        assert_eq!(current.version, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retried_push_is_deduplicated() {
        let gateway = MemoryGateway::new();
        let record = new_snapshot(EntityType::Sermon, 10);
        let request = push_request(&record, 1, 0);

        gateway.drop_next_push_response();
        assert_eq!(
            gateway.push(&token(), &request).await,
            Err(GatewayError::Timeout)
        );
        let replay = gateway.push(&token(), &request).await.unwrap();
        assert_eq!(replay, PushOutcome::Accepted { version: 1, updated_at: 10 });
        assert_eq!(gateway.record(&record.id).unwrap().version, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pull_pages_in_feed_order() {
        let gateway = MemoryGateway::new();
        for now in [30, 10, 20] {
            let record = new_snapshot(EntityType::Series, now);
            gateway.push(&token(), &push_request(&record, 1, 0)).await.unwrap();
        }
        gateway
            .push(&token(), &push_request(&new_snapshot(EntityType::Sermon, 5), 1, 0))
            .await
            .unwrap();

        let first = gateway
            .pull(
                &token(),
                &PullRequest {
                    entity_type: EntityType::Series,
                    since: PullPosition::ORIGIN,
                    limit: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(first.records.len(), 2);
        assert!(first.has_more);

        let second = gateway
            .pull(
                &token(),
                &PullRequest {
                    entity_type: EntityType::Series,
                    since: first.next_cursor,
                    limit: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(!second.has_more);
        assert!(second.records[0].position() > first.next_cursor);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_required_token_is_enforced() {
        let gateway = MemoryGateway::new().with_required_token("right");
        let result = gateway
            .pull(
                &AccessToken::new("wrong"),
                &PullRequest {
                    entity_type: EntityType::Sermon,
                    since: PullPosition::ORIGIN,
                    limit: 10,
                },
            )
            .await;
        assert!(matches!(result, Err(GatewayError::Unauthorized(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_owner_is_rejected() {
        let gateway = MemoryGateway::new();
        let mut record = new_snapshot(EntityType::Sermon, 10);
        record.owner_id = " ".into();
        let result = gateway.push(&token(), &push_request(&record, 1, 0)).await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
    }
}
