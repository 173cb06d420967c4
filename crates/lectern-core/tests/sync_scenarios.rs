//! Multi-device sync scenarios against a shared in-memory remote store.

use std::sync::Arc;
use std::time::Duration;

use lectern_core::db::{Database, LibSqlRecordRepository, RecordQuery, RecordRepository};
use lectern_core::models::{
    ConflictStatus, EntityRecord, EntityType, FieldMap, PullPosition, Resolution,
};
use lectern_core::services::soft_delete_cascade;
use async_trait::async_trait;
use lectern_core::sync::{
    AccessToken, ConflictPolicy, GatewayError, ManualResolution, MemoryGateway, PullBatch,
    PullRequest, PushOutcome, PushRequest, RemoteGateway, StaticCredentialProvider, SyncError,
};
use lectern_core::util::ManualClock;
use lectern_core::{RetryPolicy, SyncConfig, SyncEngine, SyncStore};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

struct Device {
    engine: SyncEngine,
    clock: Arc<ManualClock>,
}

impl Device {
    async fn new(gateway: &MemoryGateway) -> Self {
        let store = SyncStore::open_in_memory().await.unwrap();
        Self::with_store(gateway, store, "token")
    }

    fn with_store(gateway: &MemoryGateway, store: SyncStore, token: &str) -> Self {
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = SyncEngine::new(
            store.with_clock(clock.clone()),
            Arc::new(gateway.clone()),
            Arc::new(StaticCredentialProvider::new(token)),
            config(),
        );
        Self { engine, clock }
    }

    fn with_policy(self, policy: Arc<dyn ConflictPolicy>) -> Self {
        Self {
            engine: self.engine.with_policy(policy),
            clock: self.clock,
        }
    }

    fn store(&self) -> &SyncStore {
        self.engine.store()
    }
}

/// Serves the first page of each pull pass and fails every later one.
struct FirstPageOnly {
    inner: MemoryGateway,
    error: GatewayError,
}

#[async_trait]
impl RemoteGateway for FirstPageOnly {
    fn name(&self) -> &str {
        "first-page-only"
    }

    async fn push(
        &self,
        token: &AccessToken,
        request: &PushRequest,
    ) -> Result<PushOutcome, GatewayError> {
        self.inner.push(token, request).await
    }

    async fn pull(
        &self,
        token: &AccessToken,
        request: &PullRequest,
    ) -> Result<PullBatch, GatewayError> {
        if request.since == PullPosition::ORIGIN {
            self.inner.pull(token, request).await
        } else {
            Err(self.error.clone())
        }
    }
}

fn first_page_only_engine(
    gateway: &MemoryGateway,
    store: SyncStore,
    error: GatewayError,
) -> SyncEngine {
    SyncEngine::new(
        store,
        Arc::new(FirstPageOnly {
            inner: gateway.clone(),
            error,
        }),
        Arc::new(StaticCredentialProvider::new("token")),
        config(),
    )
}

fn config() -> SyncConfig {
    SyncConfig::default()
        .with_retry(RetryPolicy::new(3).with_base_delay(Duration::from_millis(1)))
        .with_pull_batch_size(2)
}

fn fields(pairs: &[(&str, Value)]) -> FieldMap {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disjoint_offline_edits_merge_without_conflict() {
    let gateway = MemoryGateway::new();
    let a = Device::new(&gateway).await;
    let b = Device::new(&gateway).await;

    let sermon = a
        .store()
        .create(
            EntityType::Sermon,
            "pastor",
            None,
            fields(&[("title", json!("Grace")), ("tags", json!(["grace"]))]),
        )
        .await
        .unwrap();
    assert_eq!(a.engine.trigger_sync().await.unwrap().pushed, 1);
    assert_eq!(b.engine.trigger_sync().await.unwrap().pulled, 1);

    a.clock.set(2_000);
    a.store()
        .update_fields(&sermon.id, fields(&[("title", json!("Amazing Grace"))]))
        .await
        .unwrap();
    a.engine.trigger_sync().await.unwrap();

    b.clock.set(3_000);
    b.store()
        .update_fields(&sermon.id, fields(&[("tags", json!(["grace", "hymn"]))]))
        .await
        .unwrap();
    let report = b.engine.trigger_sync().await.unwrap();
    assert!(report.conflicts.is_empty());

    let merged = b.store().get(&sermon.id).await.unwrap();
    assert_eq!(merged.fields["title"], json!("Amazing Grace"));
    assert_eq!(merged.fields["tags"], json!(["grace", "hymn"]));
    assert!(!merged.dirty);

    a.engine.trigger_sync().await.unwrap();
    let converged = a.store().get(&sermon.id).await.unwrap();
    assert_eq!(converged.fields, merged.fields);
    assert_eq!(converged.acked_version, merged.acked_version);
    assert!(b.store().list_conflicts(None, None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_title_edits_resolve_to_latest_write() {
    let gateway = MemoryGateway::new();
    let a = Device::new(&gateway).await;
    let b = Device::new(&gateway).await;

    let sermon = a
        .store()
        .create(EntityType::Sermon, "pastor", None, fields(&[("title", json!("Draft"))]))
        .await
        .unwrap();
    a.engine.trigger_sync().await.unwrap();
    b.engine.trigger_sync().await.unwrap();

    a.clock.set(2_000);
    a.store()
        .update_fields(&sermon.id, fields(&[("title", json!("Earlier"))]))
        .await
        .unwrap();
    b.clock.set(3_000);
    b.store()
        .update_fields(&sermon.id, fields(&[("title", json!("Later"))]))
        .await
        .unwrap();

    a.engine.trigger_sync().await.unwrap();
    let report = b.engine.trigger_sync().await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].resolution, Some(Resolution::LocalWins));
    a.engine.trigger_sync().await.unwrap();

    for device in [&a, &b] {
        let record = device.store().get(&sermon.id).await.unwrap();
        assert_eq!(record.fields["title"], json!("Later"));
        assert!(!record.dirty);
    }
    assert_eq!(gateway.record(&sermon.id).unwrap().fields["title"], json!("Later"));

    let conflicts = b.store().list_conflicts(None, None).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].status, ConflictStatus::Resolved);
    assert_eq!(conflicts[0].strategy, "last-write-wins");
    assert!(a.store().list_conflicts(None, None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_older_local_edit_loses_to_remote() {
    let gateway = MemoryGateway::new();
    let a = Device::new(&gateway).await;
    let b = Device::new(&gateway).await;

    let series = a
        .store()
        .create(EntityType::Series, "pastor", None, fields(&[("title", json!("Psalms"))]))
        .await
        .unwrap();
    a.engine.trigger_sync().await.unwrap();
    b.engine.trigger_sync().await.unwrap();

    b.clock.set(2_000);
    b.store()
        .update_fields(&series.id, fields(&[("title", json!("Old idea"))]))
        .await
        .unwrap();
    a.clock.set(3_000);
    a.store()
        .update_fields(&series.id, fields(&[("title", json!("New idea"))]))
        .await
        .unwrap();

    a.engine.trigger_sync().await.unwrap();
    let report = b.engine.trigger_sync().await.unwrap();
    assert_eq!(report.conflicts[0].resolution, Some(Resolution::RemoteWins));
    assert_eq!(report.pushed, 0);

    let record = b.store().get(&series.id).await.unwrap();
    assert_eq!(record.fields["title"], json!("New idea"));
    assert!(!record.dirty);
    assert_eq!(b.engine.sync_status().await.unwrap().pending_operations, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cascade_delete_propagates_tombstones() {
    let gateway = MemoryGateway::new();
    let a = Device::new(&gateway).await;
    let b = Device::new(&gateway).await;

    let series = a
        .store()
        .create(EntityType::Series, "pastor", None, fields(&[("title", json!("Romans"))]))
        .await
        .unwrap();
    let sermon = a
        .store()
        .create(
            EntityType::Sermon,
            "pastor",
            Some(series.id),
            fields(&[("title", json!("Romans 8"))]),
        )
        .await
        .unwrap();
    a.engine.trigger_sync().await.unwrap();
    b.engine.trigger_sync().await.unwrap();
    assert_eq!(b.store().list_children(&series.id).await.unwrap().len(), 1);

    a.clock.set(2_000);
    let deleted = soft_delete_cascade(a.store(), &series.id).await.unwrap();
    assert_eq!(deleted.len(), 2);
    assert_eq!(a.engine.trigger_sync().await.unwrap().pushed, 2);
    assert!(gateway.record(&sermon.id).unwrap().is_tombstone());

    let report = b.engine.trigger_sync().await.unwrap();
    assert_eq!(report.pulled, 2);
    assert!(b.store().get(&series.id).await.is_err());
    assert!(b.store().get_any(&sermon.id).await.unwrap().unwrap().is_tombstone());
    let live = b
        .store()
        .list(&RecordQuery::live(EntityType::Sermon, 10))
        .await
        .unwrap();
    assert!(live.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_pull_defers_only_that_type() {
    let gateway = MemoryGateway::new();
    let a = Device::new(&gateway).await;
    let b = Device::new(&gateway).await;

    a.store()
        .create(EntityType::Series, "pastor", None, fields(&[("title", json!("John"))]))
        .await
        .unwrap();
    for title in ["One", "Two", "Three"] {
        a.store()
            .create(EntityType::Sermon, "pastor", None, fields(&[("title", json!(title))]))
            .await
            .unwrap();
    }
    a.engine.trigger_sync().await.unwrap();

    for _ in 0..3 {
        gateway.fail_next_pull_of(
            EntityType::Sermon,
            GatewayError::Transport("connection reset".into()),
        );
    }
    let report = b.engine.trigger_sync().await.unwrap();
    assert_eq!(report.pulled, 1);
    assert_eq!(report.deferred_entity_types, vec![EntityType::Sermon]);

    let series_cursor = b.store().cursor(EntityType::Series).await.unwrap();
    let sermon_cursor = b.store().cursor(EntityType::Sermon).await.unwrap();
    assert!(series_cursor.last_pulled_at() > 0);
    assert_eq!(sermon_cursor.last_pulled_at(), 0);

    let report = b.engine.trigger_sync().await.unwrap();
    assert_eq!(report.pulled, 3);
    assert!(report.deferred_entity_types.is_empty());

    let last = gateway.records(EntityType::Sermon).pop().unwrap();
    let advanced = b.store().cursor(EntityType::Sermon).await.unwrap();
    assert_eq!(advanced.last_pulled, last.position());

    // Nothing new: the cursor stays put and nothing is re-applied
    let report = b.engine.trigger_sync().await.unwrap();
    assert_eq!(report.pulled, 0);
    assert_eq!(
        b.store().cursor(EntityType::Sermon).await.unwrap().last_pulled,
        advanced.last_pulled
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_later_page_leaves_pull_cursor_unmoved() {
    let gateway = MemoryGateway::new();
    let a = Device::new(&gateway).await;
    for title in ["One", "Two", "Three"] {
        a.store()
            .create(EntityType::Sermon, "pastor", None, fields(&[("title", json!(title))]))
            .await
            .unwrap();
    }
    a.engine.trigger_sync().await.unwrap();

    let store = SyncStore::open_in_memory().await.unwrap();

    let fatal = first_page_only_engine(
        &gateway,
        store.clone(),
        GatewayError::Protocol("garbage".into()),
    );
    let result = fatal.trigger_sync().await;
    assert!(matches!(result, Err(SyncError::Protocol(_))));
    assert_eq!(
        store.cursor(EntityType::Sermon).await.unwrap().last_pulled,
        PullPosition::ORIGIN
    );

    let transient = first_page_only_engine(
        &gateway,
        store.clone(),
        GatewayError::Transport("connection reset".into()),
    );
    let report = transient.trigger_sync().await.unwrap();
    assert_eq!(report.deferred_entity_types, vec![EntityType::Sermon]);
    assert_eq!(
        store.cursor(EntityType::Sermon).await.unwrap().last_pulled,
        PullPosition::ORIGIN
    );

    // A complete pass moves the cursor to the end of the feed
    let healthy = Device::with_store(&gateway, store.clone(), "token");
    let report = healthy.engine.trigger_sync().await.unwrap();
    assert!(report.deferred_entity_types.is_empty());
    let last = gateway.records(EntityType::Sermon).pop().unwrap();
    assert_eq!(
        store.cursor(EntityType::Sermon).await.unwrap().last_pulled,
        last.position()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lost_push_response_does_not_duplicate() {
    let gateway = MemoryGateway::new();
    let a = Device::new(&gateway).await;

    let sermon = a
        .store()
        .create(EntityType::Sermon, "pastor", None, fields(&[("title", json!("Hope"))]))
        .await
        .unwrap();
    gateway.drop_next_push_response();

    let report = a.engine.trigger_sync().await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.deferred_entity_types, vec![EntityType::Sermon]);

    a.clock.advance(60_000);
    a.engine.trigger_sync().await.unwrap();

    let record = a.store().get(&sermon.id).await.unwrap();
    assert!(!record.dirty);
    assert_eq!(record.acked_version, 1);
    assert_eq!(gateway.records(EntityType::Sermon).len(), 1);
    assert_eq!(gateway.record(&sermon.id).unwrap().version, 1);
    assert!(a.store().list_conflicts(None, None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pending_writes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lectern.db");
    let gateway = MemoryGateway::new();

    let sermon_id = {
        let store = SyncStore::open_path(&path).await.unwrap();
        let sermon = store
            .create(EntityType::Sermon, "pastor", None, fields(&[("title", json!("Faith"))]))
            .await
            .unwrap();
        // Leased by a session that never finished
        let claimed = store
            .claim_pending(EntityType::Sermon, 0, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        sermon.id
    };

    let store = SyncStore::open_path(&path).await.unwrap();
    let device = Device::with_store(&gateway, store, "token");
    assert_eq!(device.store().get(&sermon_id).await.unwrap().fields["title"], json!("Faith"));

    let report = device.engine.trigger_sync().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert!(gateway.record(&sermon_id).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_session_keeps_unpushed_work() {
    let gateway = MemoryGateway::new().with_latency(Duration::from_millis(300));
    let a = Device::new(&gateway).await;
    let sermon = a
        .store()
        .create(EntityType::Sermon, "pastor", None, fields(&[("title", json!("Peace"))]))
        .await
        .unwrap();

    let (result, ()) = tokio::join!(a.engine.trigger_sync(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.engine.cancel();
    });
    assert_eq!(result, Err(SyncError::Cancelled));

    let status = a.engine.sync_status().await.unwrap();
    assert_eq!(status.pending_operations, 1);
    assert_eq!(status.failed_operations, 0);
    assert!(a.store().get(&sermon.id).await.unwrap().dirty);

    let report = a.engine.trigger_sync().await.unwrap();
    assert_eq!(report.pushed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_triggers_share_one_session() {
    let gateway = MemoryGateway::new().with_latency(Duration::from_millis(50));
    let a = Device::new(&gateway).await;
    a.store()
        .create(EntityType::Series, "pastor", None, fields(&[("title", json!("Acts"))]))
        .await
        .unwrap();

    let (first, second) = tokio::join!(a.engine.trigger_sync(), a.engine.trigger_sync());
    let first = first.unwrap();
    assert_eq!(first, second.unwrap());
    assert_eq!(first.pushed, 1);
    assert_eq!(gateway.push_count(), 1);
    assert!(!a.engine.is_syncing());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refused_credential_leaves_queue_untouched() {
    let gateway = MemoryGateway::new().with_required_token("valid");
    let store = SyncStore::open_in_memory().await.unwrap();
    let device = Device::with_store(&gateway, store, "expired");
    device
        .store()
        .create(EntityType::Sermon, "pastor", None, fields(&[("title", json!("Joy"))]))
        .await
        .unwrap();

    let result = device.engine.trigger_sync().await;
    assert!(matches!(result, Err(SyncError::Authentication(_))));

    let status = device.engine.sync_status().await.unwrap();
    assert_eq!(status.pending_operations, 1);
    assert_eq!(status.failed_operations, 0);
    assert!(status.last_error.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exhausted_retries_wait_for_requeue() {
    let gateway = MemoryGateway::new();
    let a = Device::new(&gateway).await;
    let sermon = a
        .store()
        .create(EntityType::Sermon, "pastor", None, fields(&[("title", json!("Love"))]))
        .await
        .unwrap();

    for _ in 0..3 {
        gateway.fail_next_push(GatewayError::Transport("bad gateway".into()));
    }
    let mut exhausted = None;
    for _ in 0..3 {
        let report = a.engine.trigger_sync().await.unwrap();
        exhausted = report.failed_operations.into_iter().find(|op| op.exhausted);
        a.clock.advance(60_000);
    }
    let failed = exhausted.expect("operation should exhaust its retries");
    assert_eq!(failed.entity_id, sermon.id);
    assert_eq!(failed.retry_count, 3);

    let report = a.engine.trigger_sync().await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(a.engine.sync_status().await.unwrap().failed_operations, 1);

    assert_eq!(a.engine.requeue_failed(Some(&sermon.id)).await.unwrap(), 1);
    let report = a.engine.trigger_sync().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert!(!a.store().get(&sermon.id).await.unwrap().dirty);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auto_merge_keeps_rejected_push_failed() {
    let gateway = MemoryGateway::new();
    let a = Device::new(&gateway).await;
    let clock = Arc::new(ManualClock::new(1_000));
    let b = SyncEngine::new(
        SyncStore::open_in_memory()
            .await
            .unwrap()
            .with_clock(clock.clone()),
        Arc::new(gateway.clone()),
        Arc::new(StaticCredentialProvider::new("token")),
        config().with_retry(RetryPolicy::new(1)),
    );

    let sermon = a
        .store()
        .create(EntityType::Sermon, "pastor", None, fields(&[("title", json!("Mercy"))]))
        .await
        .unwrap();
    a.engine.trigger_sync().await.unwrap();
    b.trigger_sync().await.unwrap();

    clock.set(2_000);
    b.store()
        .update_fields(&sermon.id, fields(&[("tags", json!(["mercy"]))]))
        .await
        .unwrap();
    gateway.fail_next_push(GatewayError::Rejected("tags not allowed".into()));
    let report = b.trigger_sync().await.unwrap();
    assert!(report.failed_operations[0].exhausted);
    assert_eq!(b.sync_status().await.unwrap().failed_operations, 1);

    a.clock.set(3_000);
    a.store()
        .update_fields(&sermon.id, fields(&[("title", json!("Tender Mercy"))]))
        .await
        .unwrap();
    a.engine.trigger_sync().await.unwrap();

    clock.set(4_000);
    let report = b.trigger_sync().await.unwrap();
    assert!(report.conflicts.is_empty());
    assert_eq!(report.pushed, 0);
    let merged = b.store().get(&sermon.id).await.unwrap();
    assert_eq!(merged.fields["title"], json!("Tender Mercy"));
    assert_eq!(merged.fields["tags"], json!(["mercy"]));

    let status = b.sync_status().await.unwrap();
    assert_eq!(status.failed_operations, 1);
    assert_eq!(status.pending_operations, 0);
    assert!(gateway.record(&sermon.id).unwrap().fields.get("tags").is_none());

    assert_eq!(b.requeue_failed(Some(&sermon.id)).await.unwrap(), 1);
    let report = b.trigger_sync().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(
        gateway.record(&sermon.id).unwrap().fields["tags"],
        json!(["mercy"])
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manual_merge_resolution_is_pushed() {
    let gateway = MemoryGateway::new();
    let a = Device::new(&gateway).await;
    let b = Device::new(&gateway)
        .await
        .with_policy(Arc::new(ManualResolution));

    let sermon = a
        .store()
        .create(EntityType::Sermon, "pastor", None, fields(&[("body", json!("v1"))]))
        .await
        .unwrap();
    a.engine.trigger_sync().await.unwrap();
    b.engine.trigger_sync().await.unwrap();

    a.store()
        .update_fields(&sermon.id, fields(&[("body", json!("from a"))]))
        .await
        .unwrap();
    b.store()
        .update_fields(&sermon.id, fields(&[("body", json!("from b"))]))
        .await
        .unwrap();
    a.engine.trigger_sync().await.unwrap();
    b.engine.trigger_sync().await.unwrap();

    let pending = b.engine.list_pending_conflicts(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    let conflict = &pending[0];
    assert_eq!(conflict.local_snapshot.fields["body"], json!("from b"));
    assert_eq!(conflict.remote_snapshot.fields["body"], json!("from a"));

    let mut merged = conflict.remote_snapshot.clone();
    merged.fields.insert("body".into(), json!("from a and b"));
    b.engine
        .resolve_conflict(&conflict.id, Resolution::Merged, Some(merged))
        .await
        .unwrap();
    let again = b
        .engine
        .resolve_conflict(&conflict.id, Resolution::RemoteWins, None)
        .await;
    assert!(again.is_err());

    assert_eq!(b.engine.trigger_sync().await.unwrap().pushed, 1);
    a.engine.trigger_sync().await.unwrap();
    assert_eq!(
        a.store().get(&sermon.id).await.unwrap().fields["body"],
        json!("from a and b")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_corrupted_record_is_quarantined_until_released() {
    let gateway = MemoryGateway::new();
    let a = Device::new(&gateway).await;
    let sermon = a
        .store()
        .create(EntityType::Sermon, "pastor", None, fields(&[("title", json!("Mercy"))]))
        .await
        .unwrap();
    a.engine.trigger_sync().await.unwrap();

    a.clock.set(2_000);
    a.store()
        .update_fields(&sermon.id, fields(&[("title", json!("Mercy, revised"))]))
        .await
        .unwrap();
    a.engine.trigger_sync().await.unwrap();

    // Device B holds the first version but with broken sync metadata
    let mut first = gateway.record(&sermon.id).unwrap();
    first.version = 1;
    first.updated_at = 1_000;
    first.fields.insert("title".into(), json!("Mercy"));
    let mut broken = EntityRecord::from_remote(&first);
    broken.sync_version = 4;
    let db = Database::open_in_memory().await.unwrap();
    LibSqlRecordRepository::new(db.connection())
        .save(&broken)
        .await
        .unwrap();
    let b = Device::with_store(&gateway, SyncStore::from_database(db), "token");

    let report = b.engine.trigger_sync().await.unwrap();
    assert_eq!(report.blocked_records, vec![sermon.id]);
    assert_eq!(b.engine.sync_status().await.unwrap().blocked_records, 1);
    assert_eq!(
        b.store().get(&sermon.id).await.unwrap().fields["title"],
        json!("Mercy")
    );

    let released = b.engine.unblock_record(&sermon.id).await.unwrap();
    assert!(!released.blocked);
    assert!(released.dirty);

    b.engine.trigger_sync().await.unwrap();
    let record = b.store().get(&sermon.id).await.unwrap();
    assert!(!record.blocked);
    assert!(!record.dirty);
    assert_eq!(record.fields["title"], json!("Mercy, revised"));
}
