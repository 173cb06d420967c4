//! Local Store, Operation Log, Sync Cursor Store and Conflict Store behind one
//! thread-safe service.
//!
//! Every local write commits together with its operation log entry in one
//! transaction. The sync engine never holds the lock across a network call,
//! so local edits keep working while a session is in progress.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::RetryPolicy;
use crate::db::{
    finish, ConflictRepository, CursorRepository, Database, LibSqlConflictRepository,
    LibSqlCursorRepository, LibSqlMetaRepository, LibSqlOperationLogRepository,
    LibSqlRecordRepository, MetaRepository, OperationCounts, OperationLogRepository, RecordQuery,
    RecordRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    apply_patch, validate_fields, ConflictId, ConflictStatus, Content, EntityRecord, EntityType,
    FieldMap, OperationEntry, OperationId, OperationKind, OperationStatus, PullPosition, RecordId,
    RecordSnapshot, Resolution, SyncConflict, SyncCursor,
};
use crate::util::{Clock, SystemClock};

/// Local state change decided by reconciliation
#[derive(Debug, Clone, PartialEq)]
pub enum LocalApply {
    /// Overwrite local state with confirmed remote state and clear dirty
    Adopt(RecordSnapshot),
    /// Keep `content` as a dirty local write on top of `remote` and enqueue it
    Rebase {
        content: RecordSnapshot,
        remote: RecordSnapshot,
    },
}

/// Conflict row written alongside a reconciliation
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictWrite {
    Insert(SyncConflict),
    /// Refresh an existing conflict (new remote snapshot or resolution)
    Update(SyncConflict),
}

/// Result of [`SyncStore::apply_reconciliation`]
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Applied; carries the operation enqueued for a rebase
    Applied(Option<OperationEntry>),
    /// The record changed locally since it was read; nothing was written
    Stale,
}

/// Rows removed by [`SyncStore::compact`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionStats {
    pub operations_deleted: u64,
    pub tombstones_purged: u64,
}

/// Thread-safe service over the local database.
#[derive(Clone)]
pub struct SyncStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl SyncStore {
    /// Open a store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path).await?;
        let mut store = Self::from_database(db);
        store.db_path = Some(db_path);
        Ok(store)
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory().await?))
    }

    /// Wrap an already opened database.
    pub fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
        }
    }

    /// Use a different time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a different backoff policy for failed pushes.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Filesystem path of the database, if not in memory.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Current time from the store's clock (Unix ms).
    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    // --- Local Store -----------------------------------------------------

    /// Create a new local record.
    pub async fn create(
        &self,
        entity_type: EntityType,
        owner_id: &str,
        parent_id: Option<RecordId>,
        fields: FieldMap,
    ) -> Result<EntityRecord> {
        validate_fields(&fields)?;
        let record = EntityRecord::new_local(entity_type, owner_id, parent_id, fields, self.now());
        self.upsert(record).await
    }

    /// Create a record from typed content.
    pub async fn create_content<C: Content>(
        &self,
        owner_id: &str,
        parent_id: Option<RecordId>,
        content: &C,
    ) -> Result<EntityRecord> {
        self.create(C::ENTITY_TYPE, owner_id, parent_id, content.to_fields()?)
            .await
    }

    /// Local write of a whole record.
    ///
    /// An existing row takes the given content and gets a new `sync_version`;
    /// an unknown id is inserted as a never-synced record. Either way the
    /// record ends up dirty and an operation is enqueued in the same
    /// transaction.
    pub async fn upsert(&self, record: EntityRecord) -> Result<EntityRecord> {
        validate_fields(&record.fields)?;
        let now = self.now();
        let db = self.db.lock().await;
        let conn = db.connection();

        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result: Result<EntityRecord> = async {
            let records = LibSqlRecordRepository::new(conn);
            let stored = match records.get(&record.id).await? {
                Some(mut existing) => {
                    if existing.entity_type != record.entity_type {
                        return Err(Error::InvalidInput(format!(
                            "record {} is a {}, not a {}",
                            record.id, existing.entity_type, record.entity_type
                        )));
                    }
                    existing.owner_id = record.owner_id;
                    existing.parent_id = record.parent_id;
                    existing.fields = record.fields;
                    existing.deleted_at = record.deleted_at;
                    existing.touch(now);
                    existing
                }
                None => {
                    let mut fresh = EntityRecord::new_local(
                        record.entity_type,
                        record.owner_id,
                        record.parent_id,
                        record.fields,
                        now,
                    );
                    fresh.id = record.id;
                    fresh.deleted_at = record.deleted_at;
                    fresh
                }
            };
            Self::commit_local_write(conn, &stored, now).await?;
            Ok(stored)
        }
        .await;
        finish(conn, result).await
    }

    /// Patch domain fields of a live record (`null` removes a field).
    pub async fn update_fields(&self, id: &RecordId, patch: FieldMap) -> Result<EntityRecord> {
        validate_fields(&patch)?;
        self.modify_live(id, |record| {
            apply_patch(&mut record.fields, patch);
            Ok(())
        })
        .await
    }

    /// Point a live record at a different parent (or none).
    pub async fn set_parent(
        &self,
        id: &RecordId,
        parent_id: Option<RecordId>,
    ) -> Result<EntityRecord> {
        if parent_id.as_ref() == Some(id) {
            return Err(Error::InvalidInput("a record cannot be its own parent".into()));
        }
        self.modify_live(id, |record| {
            record.parent_id = parent_id;
            Ok(())
        })
        .await
    }

    /// Replace a live record's content with typed content.
    pub async fn update_content<C: Content>(
        &self,
        id: &RecordId,
        content: &C,
    ) -> Result<EntityRecord> {
        let fields = content.to_fields()?;
        self.modify_live(id, |record| {
            if record.entity_type != C::ENTITY_TYPE {
                return Err(Error::InvalidInput(format!(
                    "record {} is a {}, not a {}",
                    record.id,
                    record.entity_type,
                    C::ENTITY_TYPE
                )));
            }
            record.fields = fields;
            Ok(())
        })
        .await
    }

    /// Soft-delete a live record, producing a synced tombstone.
    pub async fn soft_delete(&self, id: &RecordId) -> Result<EntityRecord> {
        let now = self.now();
        self.modify_live(id, |record| {
            record.deleted_at = Some(now.max(record.updated_at));
            Ok(())
        })
        .await
    }

    async fn modify_live<F>(&self, id: &RecordId, mutate: F) -> Result<EntityRecord>
    where
        F: FnOnce(&mut EntityRecord) -> Result<()>,
    {
        let now = self.now();
        let db = self.db.lock().await;
        let conn = db.connection();

        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result: Result<EntityRecord> = async {
            let records = LibSqlRecordRepository::new(conn);
            let mut record = records
                .get(id)
                .await?
                .filter(|record| !record.is_tombstone())
                .ok_or_else(|| Error::NotFound(format!("record {id}")))?;
            mutate(&mut record)?;
            record.touch(now);
            Self::commit_local_write(conn, &record, now).await?;
            Ok(record)
        }
        .await;
        finish(conn, result).await
    }

    /// Save a locally written record and append its operation log entry.
    async fn commit_local_write(
        conn: &libsql::Connection,
        record: &EntityRecord,
        now: i64,
    ) -> Result<OperationEntry> {
        LibSqlRecordRepository::new(conn).save(record).await?;

        let seq = LibSqlMetaRepository::new(conn).next_sequence().await?;
        let entry = OperationEntry::new(
            seq,
            Self::kind_for(record),
            record.snapshot(),
            record.sync_version,
            now,
        );
        LibSqlOperationLogRepository::new(conn)
            .insert(&entry)
            .await?;
        tracing::debug!(
            "Enqueued {} {} for {} {}",
            entry.kind.as_str(),
            entry.id,
            record.entity_type,
            record.id
        );
        Ok(entry)
    }

    const fn kind_for(record: &EntityRecord) -> OperationKind {
        if record.is_tombstone() {
            OperationKind::Delete
        } else if record.acked_version == 0 {
            OperationKind::Create
        } else {
            OperationKind::Update
        }
    }

    /// Fetch a live record.
    pub async fn get(&self, id: &RecordId) -> Result<EntityRecord> {
        self.get_any(id)
            .await?
            .filter(|record| !record.is_tombstone())
            .ok_or_else(|| Error::NotFound(format!("record {id}")))
    }

    /// Fetch a record including tombstones.
    pub async fn get_any(&self, id: &RecordId) -> Result<Option<EntityRecord>> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.get(id).await
    }

    /// Fetch a live record as typed content.
    pub async fn get_content<C: Content>(&self, id: &RecordId) -> Result<C> {
        let record = self.get(id).await?;
        if record.entity_type != C::ENTITY_TYPE {
            return Err(Error::InvalidInput(format!(
                "record {id} is a {}, not a {}",
                record.entity_type,
                C::ENTITY_TYPE
            )));
        }
        C::from_fields(&record.fields)
    }

    /// List records newest first.
    pub async fn list(&self, query: &RecordQuery) -> Result<Vec<EntityRecord>> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.list(query).await
    }

    /// List live records referencing `parent_id`.
    pub async fn list_children(&self, parent_id: &RecordId) -> Result<Vec<EntityRecord>> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.list_children(parent_id).await
    }

    /// List records with unconfirmed local changes.
    pub async fn list_dirty(&self, entity_type: EntityType) -> Result<Vec<EntityRecord>> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.list_dirty(entity_type).await
    }

    /// Resolve a (possibly abbreviated) record id.
    pub async fn find_ids_by_prefix(&self, prefix: &str) -> Result<Vec<RecordId>> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.find_ids_by_prefix(prefix).await
    }

    /// Mark a record as confirmed by the remote store at `acked_version`.
    ///
    /// Clears dirty, aligns `sync_version` and settles every queued
    /// operation for the record.
    pub async fn mark_clean(&self, id: &RecordId, acked_version: i64) -> Result<EntityRecord> {
        let now = self.now();
        let db = self.db.lock().await;
        let conn = db.connection();

        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result: Result<EntityRecord> = async {
            let records = LibSqlRecordRepository::new(conn);
            let mut record = records
                .get(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("record {id}")))?;
            let mut confirmed = record.snapshot();
            confirmed.version = acked_version;
            record.adopt_remote(&confirmed);
            records.save(&record).await?;
            LibSqlOperationLogRepository::new(conn)
                .supersede_all(id, now)
                .await?;
            Ok(record)
        }
        .await;
        finish(conn, result).await
    }

    // --- Operation Log ---------------------------------------------------

    /// Append an entry; a second enqueue of the same id is a no-op.
    pub async fn enqueue(&self, entry: &OperationEntry) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlOperationLogRepository::new(db.connection());
        repo.insert(entry).await
    }

    /// Lease up to `limit` due entries of a type with `seq > after_seq`.
    pub async fn claim_pending(
        &self,
        entity_type: EntityType,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<OperationEntry>> {
        let now = self.now();
        let db = self.db.lock().await;
        let conn = db.connection();

        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = LibSqlOperationLogRepository::new(conn)
            .claim_pending(entity_type, after_seq, limit, now)
            .await;
        finish(conn, result).await
    }

    /// Mark an entry completed.
    pub async fn complete(&self, id: &OperationId) -> Result<()> {
        let now = self.now();
        let db = self.db.lock().await;
        let repo = LibSqlOperationLogRepository::new(db.connection());
        repo.complete(id, now).await
    }

    /// Record a failed attempt and schedule the next one.
    ///
    /// Returns `Failed` once the retry budget is exhausted, `Pending`
    /// otherwise.
    pub async fn fail(&self, id: &OperationId, error: &str) -> Result<OperationStatus> {
        let now = self.now();
        let db = self.db.lock().await;
        let repo = LibSqlOperationLogRepository::new(db.connection());

        let entry = repo
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("operation {id}")))?;
        let attempts = entry.retry_count.saturating_add(1);

        if self.retry.is_exhausted(attempts) {
            tracing::warn!("Operation {id} failed after {attempts} attempts: {error}");
            repo.record_failure(id, OperationStatus::Failed, attempts, error, entry.next_attempt_at, now)
                .await?;
            return Ok(OperationStatus::Failed);
        }

        let delay = self.retry.delay_for_attempt(attempts);
        let next_attempt_at =
            now.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
        tracing::debug!("Operation {id} attempt {attempts} failed, retrying in {delay:?}: {error}");
        repo.record_failure(id, OperationStatus::Pending, attempts, error, next_attempt_at, now)
            .await?;
        Ok(OperationStatus::Pending)
    }

    /// Return a leased entry to pending without counting an attempt.
    pub async fn release(&self, id: &OperationId) -> Result<()> {
        let now = self.now();
        let db = self.db.lock().await;
        let repo = LibSqlOperationLogRepository::new(db.connection());
        repo.release(id, now).await
    }

    /// Return every leased entry to pending.
    pub async fn release_in_flight(&self) -> Result<u64> {
        let now = self.now();
        let db = self.db.lock().await;
        let repo = LibSqlOperationLogRepository::new(db.connection());
        let released = repo.release_in_flight(now).await?;
        if released > 0 {
            tracing::info!("Returned {released} in-flight operations to pending");
        }
        Ok(released)
    }

    /// Give failed entries a fresh retry budget.
    pub async fn requeue_failed(&self, entity_id: Option<&RecordId>) -> Result<u64> {
        let now = self.now();
        let db = self.db.lock().await;
        let repo = LibSqlOperationLogRepository::new(db.connection());
        repo.requeue_failed(entity_id, now).await
    }

    pub async fn operation(&self, id: &OperationId) -> Result<Option<OperationEntry>> {
        let db = self.db.lock().await;
        let repo = LibSqlOperationLogRepository::new(db.connection());
        repo.get(id).await
    }

    pub async fn list_operations(
        &self,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<OperationEntry>> {
        let db = self.db.lock().await;
        let repo = LibSqlOperationLogRepository::new(db.connection());
        repo.list(status, limit).await
    }

    pub async fn operation_counts(&self) -> Result<OperationCounts> {
        let db = self.db.lock().await;
        let repo = LibSqlOperationLogRepository::new(db.connection());
        repo.counts().await
    }

    /// Settle a pushed entry after the remote store accepted it.
    ///
    /// Older entries for the record are superseded. The record is cleaned
    /// unless it was written again after this entry was enqueued, in which
    /// case only its acknowledged base moves forward.
    pub async fn acknowledge_push(
        &self,
        entry: &OperationEntry,
        version: i64,
        updated_at: i64,
    ) -> Result<Option<EntityRecord>> {
        let now = self.now();
        let db = self.db.lock().await;
        let conn = db.connection();

        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result: Result<Option<EntityRecord>> = async {
            let oplog = LibSqlOperationLogRepository::new(conn);
            let records = LibSqlRecordRepository::new(conn);

            oplog.complete(&entry.id, now).await?;
            oplog
                .supersede_before(&entry.entity_id, entry.seq, now)
                .await?;

            let Some(mut record) = records.get(&entry.entity_id).await? else {
                return Ok(None);
            };

            let mut confirmed = entry.payload.clone();
            confirmed.version = version;
            confirmed.updated_at = updated_at.max(confirmed.updated_at);

            if oplog
                .has_unsettled_after(&entry.entity_id, entry.seq)
                .await?
            {
                record.acked_version = version;
                record.sync_version = record.sync_version.max(version + 1);
                record.base = Some(confirmed);
            } else {
                let local_updated_at = record.updated_at;
                record.adopt_remote(&confirmed);
                record.updated_at = record.updated_at.max(local_updated_at);
            }
            records.save(&record).await?;
            Ok(Some(record))
        }
        .await;
        finish(conn, result).await
    }

    // --- Sync Cursor Store -----------------------------------------------

    pub async fn cursor(&self, entity_type: EntityType) -> Result<SyncCursor> {
        let db = self.db.lock().await;
        let repo = LibSqlCursorRepository::new(db.connection());
        repo.get(entity_type).await
    }

    /// Move the pull watermark forward (no-op for earlier positions).
    pub async fn advance_pulled(
        &self,
        entity_type: EntityType,
        position: PullPosition,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlCursorRepository::new(db.connection());
        repo.advance_pulled(entity_type, position).await
    }

    /// Move the push watermark forward (no-op for earlier timestamps).
    pub async fn advance_pushed(&self, entity_type: EntityType, timestamp: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlCursorRepository::new(db.connection());
        repo.advance_pushed(entity_type, timestamp).await
    }

    // --- Conflict Store --------------------------------------------------

    /// Persist a conflict.
    pub async fn record_conflict(&self, conflict: &SyncConflict) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        repo.insert(conflict).await
    }

    pub async fn conflict(&self, id: &ConflictId) -> Result<Option<SyncConflict>> {
        let db = self.db.lock().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        repo.get(id).await
    }

    /// Pending conflicts, optionally for one type, oldest first.
    pub async fn list_pending_conflicts(
        &self,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<SyncConflict>> {
        self.list_conflicts(Some(ConflictStatus::Pending), entity_type)
            .await
    }

    pub async fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        repo.list(status, entity_type).await
    }

    /// The pending conflict for a record, if any.
    pub async fn pending_conflict_for(&self, entity_id: &RecordId) -> Result<Option<SyncConflict>> {
        let db = self.db.lock().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        repo.pending_for(entity_id).await
    }

    pub async fn count_pending_conflicts(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlConflictRepository::new(db.connection());
        repo.count_pending().await
    }

    /// Resolve a pending conflict.
    ///
    /// `LocalWins` re-enqueues the current local content on top of the
    /// remote snapshot, `RemoteWins` adopts the remote snapshot and clears
    /// dirty, `Merged` requires `merged` and makes it the new dirty local
    /// state.
    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        resolution: Resolution,
        merged: Option<RecordSnapshot>,
    ) -> Result<EntityRecord> {
        let now = self.now();
        let db = self.db.lock().await;
        let conn = db.connection();

        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result: Result<EntityRecord> = async {
            let conflicts = LibSqlConflictRepository::new(conn);
            let records = LibSqlRecordRepository::new(conn);
            let oplog = LibSqlOperationLogRepository::new(conn);

            let conflict = conflicts
                .get(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?;
            if conflict.status == ConflictStatus::Resolved {
                return Err(Error::InvalidInput(format!("conflict {id} is already resolved")));
            }

            let remote = &conflict.remote_snapshot;
            let mut record = records
                .get(&conflict.entity_id)
                .await?
                .unwrap_or_else(|| EntityRecord::from_remote(&conflict.local_snapshot));

            match resolution {
                Resolution::RemoteWins => {
                    record.adopt_remote(remote);
                    records.save(&record).await?;
                    oplog.supersede_all(&record.id, now).await?;
                }
                Resolution::LocalWins | Resolution::Merged => {
                    let mut content = if resolution == Resolution::Merged {
                        let merged = merged.ok_or_else(|| {
                            Error::InvalidInput("a merged resolution needs a merged snapshot".into())
                        })?;
                        if merged.id != conflict.entity_id {
                            return Err(Error::InvalidInput(format!(
                                "merged snapshot is for {}, not {}",
                                merged.id, conflict.entity_id
                            )));
                        }
                        validate_fields(&merged.fields)?;
                        merged
                    } else {
                        record.snapshot()
                    };
                    content.updated_at = now.max(remote.updated_at).max(record.updated_at);
                    record.rebase_onto(&content, remote);
                    oplog.supersede_all(&record.id, now).await?;
                    Self::commit_local_write(conn, &record, now).await?;
                }
            }

            conflicts.update(&conflict.resolved(resolution, now)).await?;
            tracing::info!(
                "Resolved conflict {id} on {} {} as {}",
                record.entity_type,
                record.id,
                resolution.as_str()
            );
            Ok(record)
        }
        .await;
        finish(conn, result).await
    }

    // --- Reconciliation --------------------------------------------------

    /// Apply a reconciliation decision atomically.
    ///
    /// `expected_version` is the local `sync_version` the decision was made
    /// against (`None` if the record did not exist). If the record changed
    /// since, nothing is written and `Stale` is returned so the caller can
    /// decide again.
    pub async fn apply_reconciliation(
        &self,
        entity_id: &RecordId,
        expected_version: Option<i64>,
        change: Option<LocalApply>,
        conflict: Option<ConflictWrite>,
    ) -> Result<ApplyOutcome> {
        let now = self.now();
        let db = self.db.lock().await;
        let conn = db.connection();

        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result: Result<ApplyOutcome> = async {
            let records = LibSqlRecordRepository::new(conn);
            let oplog = LibSqlOperationLogRepository::new(conn);

            let current = records.get(entity_id).await?;
            if current.as_ref().map(|record| record.sync_version) != expected_version {
                return Ok(ApplyOutcome::Stale);
            }

            let enqueued = match change {
                None => None,
                Some(LocalApply::Adopt(remote)) => {
                    let record = match current {
                        Some(mut record) => {
                            record.adopt_remote(&remote);
                            record
                        }
                        None => EntityRecord::from_remote(&remote),
                    };
                    records.save(&record).await?;
                    oplog.supersede_all(entity_id, now).await?;
                    None
                }
                Some(LocalApply::Rebase { content, remote }) => {
                    let mut record =
                        current.unwrap_or_else(|| EntityRecord::from_remote(&remote));
                    record.rebase_onto(&content, &remote);
                    let failed = oplog.latest_failed(entity_id).await?;
                    oplog.supersede_all(entity_id, now).await?;
                    let mut entry = Self::commit_local_write(conn, &record, now).await?;
                    // A failed push stays failed until requeued, whatever its payload
                    if let Some(failed) = failed {
                        let error = failed.last_error.unwrap_or_else(|| "failed".to_string());
                        oplog
                            .record_failure(
                                &entry.id,
                                OperationStatus::Failed,
                                failed.retry_count,
                                &error,
                                failed.next_attempt_at,
                                now,
                            )
                            .await?;
                        entry.status = OperationStatus::Failed;
                        entry.retry_count = failed.retry_count;
                        entry.last_error = Some(error);
                        entry.next_attempt_at = failed.next_attempt_at;
                    }
                    Some(entry)
                }
            };

            match conflict {
                Some(ConflictWrite::Insert(conflict)) => {
                    LibSqlConflictRepository::new(conn).insert(&conflict).await?;
                }
                Some(ConflictWrite::Update(conflict)) => {
                    LibSqlConflictRepository::new(conn).update(&conflict).await?;
                }
                None => {}
            }

            Ok(ApplyOutcome::Applied(enqueued))
        }
        .await;
        finish(conn, result).await
    }

    // --- Quarantine ------------------------------------------------------

    /// Halt automatic sync for a record that violates local invariants.
    pub async fn block_record(&self, id: &RecordId, reason: &str) -> Result<bool> {
        tracing::error!("Quarantining record {id}: {reason}");
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.set_blocked(id, true).await
    }

    /// Lift quarantine and repair the record's sync metadata.
    ///
    /// The record is re-marked dirty one version past its acknowledged base
    /// and its content is re-enqueued, so the next push either confirms it
    /// or routes it through conflict detection.
    pub async fn unblock_record(&self, id: &RecordId) -> Result<EntityRecord> {
        let now = self.now();
        let db = self.db.lock().await;
        let conn = db.connection();

        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result: Result<EntityRecord> = async {
            let records = LibSqlRecordRepository::new(conn);
            let mut record = records
                .get(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("record {id}")))?;
            record.blocked = false;
            record.dirty = true;
            record.sync_version = record.acked_version + 1;
            record.updated_at = record.updated_at.max(now);
            LibSqlOperationLogRepository::new(conn)
                .supersede_all(id, now)
                .await?;
            Self::commit_local_write(conn, &record, now).await?;
            tracing::info!("Released record {id} from quarantine");
            Ok(record)
        }
        .await;
        finish(conn, result).await
    }

    pub async fn blocked_records(&self) -> Result<Vec<EntityRecord>> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.list_blocked().await
    }

    // --- Session metadata and housekeeping -------------------------------

    pub async fn last_sync_at(&self) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        let repo = LibSqlMetaRepository::new(db.connection());
        repo.last_sync_at().await
    }

    pub async fn set_last_sync_at(&self, timestamp: i64) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlMetaRepository::new(db.connection());
        repo.set_last_sync_at(timestamp).await
    }

    /// Delete old completed entries and purge acknowledged tombstones.
    pub async fn compact(
        &self,
        tombstone_retention: Duration,
        completed_retention: Duration,
    ) -> Result<CompactionStats> {
        let now = self.now();
        let cutoff = |retention: Duration| {
            now.saturating_sub(i64::try_from(retention.as_millis()).unwrap_or(i64::MAX))
        };

        let db = self.db.lock().await;
        let conn = db.connection();

        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result: Result<CompactionStats> = async {
            let operations_deleted = LibSqlOperationLogRepository::new(conn)
                .delete_completed_before(cutoff(completed_retention))
                .await?;
            let tombstones_purged = LibSqlRecordRepository::new(conn)
                .purge_tombstones(cutoff(tombstone_retention))
                .await?;
            Ok(CompactionStats {
                operations_deleted,
                tombstones_purged,
            })
        }
        .await;
        let stats = finish(conn, result).await?;

        if stats != CompactionStats::default() {
            tracing::debug!(
                "Compacted {} operations and {} tombstones",
                stats.operations_deleted,
                stats.tombstones_purged
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sermon;
    use crate::util::ManualClock;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeSet;

    async fn setup() -> (SyncStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = SyncStore::open_in_memory()
            .await
            .unwrap()
            .with_clock(clock.clone())
            .with_retry_policy(
                RetryPolicy::new(3).with_base_delay(Duration::from_millis(100)),
            );
        (store, clock)
    }

    fn title(value: &str) -> FieldMap {
        FieldMap::from([("title".to_string(), json!(value))])
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_local_write_appends_operation() {
        let (store, _) = setup().await;
        let record = store
            .create(EntityType::Sermon, "owner", None, title("Grace"))
            .await
            .unwrap();

        assert!(record.dirty);
        let ops = store.list_operations(None, 10).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Create);
        assert_eq!(ops[0].entity_id, record.id);
        assert_eq!(ops[0].payload, record.snapshot());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_and_soft_delete() {
        let (store, clock) = setup().await;
        let record = store
            .create(EntityType::Sermon, "owner", None, title("Grace"))
            .await
            .unwrap();

        clock.advance(10);
        let updated = store
            .update_fields(&record.id, title("Amazing Grace"))
            .await
            .unwrap();
        assert_eq!(updated.sync_version, 2);
        assert_eq!(updated.updated_at, 1_010);

        clock.advance(10);
        let deleted = store.soft_delete(&record.id).await.unwrap();
        assert_eq!(deleted.deleted_at, Some(1_020));
        assert!(matches!(
            store.get(&record.id).await,
            Err(Error::NotFound(_))
        ));
        assert!(store.get_any(&record.id).await.unwrap().is_some());
        assert!(store.soft_delete(&record.id).await.is_err());

        let kinds: Vec<OperationKind> = store
            .list_operations(None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|op| op.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![OperationKind::Create, OperationKind::Create, OperationKind::Delete]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reserved_fields_rejected() {
        let (store, _) = setup().await;
        let fields = FieldMap::from([("deleted_at".to_string(), json!(1))]);
        let result = store.create(EntityType::Series, "owner", None, fields).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(store.operation_counts().await.unwrap(), OperationCounts::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fail_backs_off_then_fails() {
        let (store, clock) = setup().await;
        let record = store
            .create(EntityType::Sermon, "owner", None, title("Grace"))
            .await
            .unwrap();
        let claimed = store.claim_pending(EntityType::Sermon, 0, 10).await.unwrap();
        let id = claimed[0].id.clone();

        assert_eq!(store.fail(&id, "timeout").await.unwrap(), OperationStatus::Pending);
        let entry = store.operation(&id).await.unwrap().unwrap();
        assert_eq!(entry.next_attempt_at, 1_100);
        assert!(store
            .claim_pending(EntityType::Sermon, 0, 10)
            .await
            .unwrap()
            .is_empty());

        clock.advance(100);
        assert_eq!(store.claim_pending(EntityType::Sermon, 0, 10).await.unwrap().len(), 1);
        assert_eq!(store.fail(&id, "timeout").await.unwrap(), OperationStatus::Pending);
        assert_eq!(store.operation(&id).await.unwrap().unwrap().next_attempt_at, 1_300);

        clock.advance(1_000);
        store.claim_pending(EntityType::Sermon, 0, 10).await.unwrap();
        assert_eq!(store.fail(&id, "timeout").await.unwrap(), OperationStatus::Failed);
        clock.advance(10_000);
        assert!(store
            .claim_pending(EntityType::Sermon, 0, 10)
            .await
            .unwrap()
            .is_empty());

        assert_eq!(store.requeue_failed(Some(&record.id)).await.unwrap(), 1);
        assert_eq!(store.claim_pending(EntityType::Sermon, 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_acknowledge_cleans_record() {
        let (store, _) = setup().await;
        let record = store
            .create(EntityType::Sermon, "owner", None, title("Grace"))
            .await
            .unwrap();
        let entry = store.claim_pending(EntityType::Sermon, 0, 10).await.unwrap()[0].clone();

        let acked = store
            .acknowledge_push(&entry, 1, 1_000)
            .await
            .unwrap()
            .unwrap();
        assert!(!acked.dirty);
        assert_eq!(acked.sync_version, 1);
        assert_eq!(acked.acked_version, 1);
        assert_eq!(acked.base.as_ref().map(|base| base.version), Some(1));
        assert_eq!(store.list_dirty(EntityType::Sermon).await.unwrap(), vec![]);
        assert_eq!(
            store.operation(&entry.id).await.unwrap().unwrap().status,
            OperationStatus::Completed
        );
        assert_eq!(store.get(&record.id).await.unwrap(), acked);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_acknowledge_keeps_newer_local_edit_dirty() {
        let (store, clock) = setup().await;
        let record = store
            .create(EntityType::Sermon, "owner", None, title("Grace"))
            .await
            .unwrap();
        let entry = store.claim_pending(EntityType::Sermon, 0, 10).await.unwrap()[0].clone();

        clock.advance(5);
        store
            .update_fields(&record.id, title("Amazing Grace"))
            .await
            .unwrap();

        let acked = store
            .acknowledge_push(&entry, 1, 1_000)
            .await
            .unwrap()
            .unwrap();
        assert!(acked.dirty);
        assert_eq!(acked.acked_version, 1);
        assert!(acked.sync_version > acked.acked_version);
        assert_eq!(acked.fields, title("Amazing Grace"));
        assert!(acked.check_invariants().is_ok());
        assert_eq!(store.operation_counts().await.unwrap().pending, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_clean_settles_queue() {
        let (store, _) = setup().await;
        let record = store
            .create(EntityType::Series, "owner", None, title("Advent"))
            .await
            .unwrap();
        store.update_fields(&record.id, title("Lent")).await.unwrap();

        let clean = store.mark_clean(&record.id, 7).await.unwrap();
        assert!(!clean.dirty);
        assert_eq!(clean.sync_version, 7);
        assert_eq!(store.operation_counts().await.unwrap().pending, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_apply_reconciliation_detects_stale_reads() {
        let (store, _) = setup().await;
        let record = store
            .create(EntityType::Sermon, "owner", None, title("Grace"))
            .await
            .unwrap();
        let mut remote = record.snapshot();
        remote.version = 3;

        store.update_fields(&record.id, title("Edited")).await.unwrap();

        let outcome = store
            .apply_reconciliation(
                &record.id,
                Some(record.sync_version),
                Some(LocalApply::Adopt(remote)),
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(store.get(&record.id).await.unwrap().fields, title("Edited"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_apply_reconciliation_rebase_enqueues() {
        let (store, _) = setup().await;
        let record = store
            .create(EntityType::Sermon, "owner", None, title("Grace"))
            .await
            .unwrap();
        let mut remote = record.snapshot();
        remote.version = 4;
        remote.fields = title("Remote");

        let outcome = store
            .apply_reconciliation(
                &record.id,
                Some(record.sync_version),
                Some(LocalApply::Rebase {
                    content: record.snapshot(),
                    remote,
                }),
                None,
            )
            .await
            .unwrap();

        let ApplyOutcome::Applied(Some(entry)) = outcome else {
            panic!("expected an enqueued operation, got {outcome:?}");
        };
        assert_eq!(entry.kind, OperationKind::Update);
        let stored = store.get(&record.id).await.unwrap();
        assert_eq!(stored.acked_version, 4);
        assert_eq!(stored.sync_version, 5);
        assert_eq!(stored.fields, title("Grace"));

        let counts = store.operation_counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.completed, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rebase_keeps_failed_operation_failed() {
        let (store, _) = setup().await;
        let record = store
            .create(EntityType::Sermon, "owner", None, title("Grace"))
            .await
            .unwrap();
        let entry = store
            .list_operations(Some(OperationStatus::Pending), 10)
            .await
            .unwrap()
            .remove(0);
        let mut status = OperationStatus::Pending;
        for _ in 0..3 {
            status = store.fail(&entry.id, "rejected: title too long").await.unwrap();
        }
        assert_eq!(status, OperationStatus::Failed);

        let mut remote = record.snapshot();
        remote.version = 2;
        remote.fields.insert("tags".into(), json!(["hope"]));
        let outcome = store
            .apply_reconciliation(
                &record.id,
                Some(record.sync_version),
                Some(LocalApply::Rebase {
                    content: record.snapshot(),
                    remote,
                }),
                None,
            )
            .await
            .unwrap();

        let ApplyOutcome::Applied(Some(rebased)) = outcome else {
            panic!("expected an enqueued operation, got {outcome:?}");
        };
        assert_eq!(rebased.status, OperationStatus::Failed);
        assert_eq!(rebased.retry_count, 3);
        assert_eq!(rebased.last_error.as_deref(), Some("rejected: title too long"));

        let counts = store.operation_counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 0);
        assert!(store
            .claim_pending(EntityType::Sermon, 0, 10)
            .await
            .unwrap()
            .is_empty());

        // Only an explicit requeue brings it back
        assert_eq!(store.requeue_failed(Some(&record.id)).await.unwrap(), 1);
        let claimed = store.claim_pending(EntityType::Sermon, 0, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, rebased.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resolve_conflict_paths() {
        let (store, _) = setup().await;
        let sermon = Sermon::new("Local");
        let record = store.create_content("owner", None, &sermon).await.unwrap();
        let mut remote = record.snapshot();
        remote.version = 2;
        remote.fields = Sermon::new("Remote").to_fields().unwrap();

        let conflict = SyncConflict::new(
            record.snapshot(),
            remote.clone(),
            BTreeSet::from(["title".to_string()]),
            "manual",
            store.now(),
        );
        store.record_conflict(&conflict).await.unwrap();
        assert_eq!(store.list_pending_conflicts(None).await.unwrap().len(), 1);
        assert!(store
            .claim_pending(EntityType::Sermon, 0, 10)
            .await
            .unwrap()
            .is_empty());

        let missing = store
            .resolve_conflict(&conflict.id, Resolution::Merged, None)
            .await;
        assert!(matches!(missing, Err(Error::InvalidInput(_))));

        let resolved = store
            .resolve_conflict(&conflict.id, Resolution::RemoteWins, None)
            .await
            .unwrap();
        assert!(!resolved.dirty);
        assert_eq!(
            store.get_content::<Sermon>(&record.id).await.unwrap().title,
            "Remote"
        );
        assert_eq!(store.count_pending_conflicts().await.unwrap(), 0);
        assert_eq!(store.operation_counts().await.unwrap().pending, 0);

        let again = store
            .resolve_conflict(&conflict.id, Resolution::LocalWins, None)
            .await;
        assert!(matches!(again, Err(Error::InvalidInput(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resolve_local_wins_requeues() {
        let (store, _) = setup().await;
        let record = store
            .create(EntityType::Sermon, "owner", None, title("Local"))
            .await
            .unwrap();
        let mut remote = record.snapshot();
        remote.version = 2;
        remote.fields = title("Remote");
        let conflict = SyncConflict::new(
            record.snapshot(),
            remote,
            BTreeSet::from(["title".to_string()]),
            "manual",
            store.now(),
        );
        store.record_conflict(&conflict).await.unwrap();

        let resolved = store
            .resolve_conflict(&conflict.id, Resolution::LocalWins, None)
            .await
            .unwrap();
        assert!(resolved.dirty);
        assert_eq!(resolved.acked_version, 2);
        assert_eq!(resolved.fields, title("Local"));

        let claimed = store.claim_pending(EntityType::Sermon, 0, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload.fields, title("Local"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_block_and_unblock() {
        let (store, _) = setup().await;
        let record = store
            .create(EntityType::Sermon, "owner", None, title("Grace"))
            .await
            .unwrap();

        assert!(store.block_record(&record.id, "test").await.unwrap());
        assert_eq!(store.blocked_records().await.unwrap().len(), 1);
        assert!(store
            .claim_pending(EntityType::Sermon, 0, 10)
            .await
            .unwrap()
            .is_empty());

        let repaired = store.unblock_record(&record.id).await.unwrap();
        assert!(!repaired.blocked);
        assert!(repaired.check_invariants().is_ok());
        assert_eq!(store.claim_pending(EntityType::Sermon, 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_compact_purges_old_state() {
        let (store, clock) = setup().await;
        let record = store
            .create(EntityType::Sermon, "owner", None, title("Grace"))
            .await
            .unwrap();
        store.soft_delete(&record.id).await.unwrap();
        let version = store.get_any(&record.id).await.unwrap().unwrap().sync_version;
        store.mark_clean(&record.id, version).await.unwrap();

        let stats = store
            .compact(Duration::from_secs(60), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(stats, CompactionStats::default());

        clock.advance(120_000);
        let stats = store
            .compact(Duration::from_secs(60), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(stats.operations_deleted, 2);
        assert_eq!(stats.tombstones_purged, 1);
        assert!(store.get_any(&record.id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_store_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("lectern.db");

        let id = {
            let store = SyncStore::open_path(&path).await.unwrap();
            store
                .create(EntityType::Sermon, "owner", None, title("Draft"))
                .await
                .unwrap()
                .id
        };

        let store = SyncStore::open_path(&path).await.unwrap();
        let record = store.get(&id).await.unwrap();
        assert!(record.dirty);
        assert_eq!(record.fields, title("Draft"));
        assert_eq!(store.operation_counts().await.unwrap().pending, 1);
    }
}
