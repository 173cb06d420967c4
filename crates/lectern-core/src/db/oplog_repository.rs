//! Operation log repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT
#![allow(clippy::cast_sign_loss)]

use libsql::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use super::{nullable, opt_text, parse_column};
use crate::error::Result;
use crate::models::{EntityType, OperationEntry, OperationId, OperationStatus, RecordId};

const COLUMNS: &str = "id, seq, entity_type, entity_id, kind, payload, local_version, status, \
                       retry_count, last_error, next_attempt_at, created_at, updated_at";

const UNSETTLED: &str = "('pending', 'in_flight', 'failed')";

/// Entry counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub failed: u64,
    pub completed: u64,
}

/// Trait for operation log storage operations (async)
#[allow(async_fn_in_trait)]
pub trait OperationLogRepository {
    /// Append an entry; returns false if an entry with the same id exists
    async fn insert(&self, entry: &OperationEntry) -> Result<bool>;

    /// Get an entry by ID
    async fn get(&self, id: &OperationId) -> Result<Option<OperationEntry>>;

    /// Lease due pending entries of a type with `seq > after_seq`, oldest
    /// first, skipping quarantined records and records with pending conflicts
    async fn claim_pending(
        &self,
        entity_type: EntityType,
        after_seq: i64,
        limit: usize,
        now: i64,
    ) -> Result<Vec<OperationEntry>>;

    /// Mark an entry completed
    async fn complete(&self, id: &OperationId, now: i64) -> Result<()>;

    /// Return a leased entry to pending without counting an attempt
    async fn release(&self, id: &OperationId, now: i64) -> Result<()>;

    /// Record a failed attempt
    async fn record_failure(
        &self,
        id: &OperationId,
        status: OperationStatus,
        retry_count: u32,
        error: &str,
        next_attempt_at: i64,
        now: i64,
    ) -> Result<()>;

    /// Settle every unsettled entry of a record older than `seq`
    async fn supersede_before(&self, entity_id: &RecordId, seq: i64, now: i64) -> Result<u64>;

    /// Settle every unsettled entry of a record
    async fn supersede_all(&self, entity_id: &RecordId, now: i64) -> Result<u64>;

    /// Whether a record has an unsettled entry newer than `seq`
    async fn has_unsettled_after(&self, entity_id: &RecordId, seq: i64) -> Result<bool>;

    /// Newest failed entry of a record, if any
    async fn latest_failed(&self, entity_id: &RecordId) -> Result<Option<OperationEntry>>;

    /// Return every leased entry to pending (crash/cancel recovery)
    async fn release_in_flight(&self, now: i64) -> Result<u64>;

    /// Return failed entries to pending with a fresh retry budget
    async fn requeue_failed(&self, entity_id: Option<&RecordId>, now: i64) -> Result<u64>;

    /// List entries, optionally by status, oldest first
    async fn list(&self, status: Option<OperationStatus>, limit: usize)
        -> Result<Vec<OperationEntry>>;

    /// Count entries by status
    async fn counts(&self) -> Result<OperationCounts>;

    /// Delete completed entries last touched before `before`
    async fn delete_completed_before(&self, before: i64) -> Result<u64>;
}

/// libSQL implementation of `OperationLogRepository`
pub struct LibSqlOperationLogRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlOperationLogRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_entry(row: &Row) -> Result<OperationEntry> {
        let id: String = row.get(0)?;
        let entity_type: String = row.get(2)?;
        let entity_id: String = row.get(3)?;
        let kind: String = row.get(4)?;
        let payload: String = row.get(5)?;
        let status: String = row.get(7)?;

        Ok(OperationEntry {
            id: OperationId::from(id),
            seq: row.get(1)?,
            entity_type: parse_column(&entity_type, "entity type")?,
            entity_id: parse_column(&entity_id, "entity id")?,
            kind: kind.parse()?,
            payload: serde_json::from_str(&payload)?,
            local_version: row.get(6)?,
            status: status.parse()?,
            retry_count: u32::try_from(row.get::<i64>(8)?).unwrap_or(u32::MAX),
            last_error: opt_text(row, 9)?,
            next_attempt_at: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    async fn collect(&self, mut rows: libsql::Rows) -> Result<Vec<OperationEntry>> {
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(Self::parse_entry(&row)?);
        }
        Ok(entries)
    }

    async fn set_status(&self, id: &OperationId, status: OperationStatus, now: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE operation_log SET status = ?, updated_at = ? WHERE id = ?",
                params![status.as_str(), now, id.as_str()],
            )
            .await?;
        Ok(())
    }
}

impl OperationLogRepository for LibSqlOperationLogRepository<'_> {
    async fn insert(&self, entry: &OperationEntry) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO operation_log ({COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    entry.id.as_str(),
                    entry.seq,
                    entry.entity_type.as_str(),
                    entry.entity_id.as_str(),
                    entry.kind.as_str(),
                    serde_json::to_string(&entry.payload)?,
                    entry.local_version,
                    entry.status.as_str(),
                    i64::from(entry.retry_count),
                    nullable(entry.last_error.clone()),
                    entry.next_attempt_at,
                    entry.created_at,
                    entry.updated_at
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn get(&self, id: &OperationId) -> Result<Option<OperationEntry>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {COLUMNS} FROM operation_log WHERE id = ?"),
                [id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_entry(&row)?)),
            None => Ok(None),
        }
    }

    async fn claim_pending(
        &self,
        entity_type: EntityType,
        after_seq: i64,
        limit: usize,
        now: i64,
    ) -> Result<Vec<OperationEntry>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM operation_log
                     WHERE status = 'pending'
                       AND entity_type = ?1
                       AND seq > ?2
                       AND next_attempt_at <= ?3
                       AND entity_id NOT IN (SELECT id FROM records WHERE blocked = 1)
                       AND entity_id NOT IN (
                           SELECT entity_id FROM sync_conflicts WHERE status = 'pending'
                       )
                     ORDER BY seq
                     LIMIT ?4"
                ),
                params![entity_type.as_str(), after_seq, now, limit as i64],
            )
            .await?;
        let mut claimed = self.collect(rows).await?;

        for entry in &mut claimed {
            self.set_status(&entry.id, OperationStatus::InFlight, now)
                .await?;
            entry.status = OperationStatus::InFlight;
            entry.updated_at = now;
        }
        Ok(claimed)
    }

    async fn complete(&self, id: &OperationId, now: i64) -> Result<()> {
        self.set_status(id, OperationStatus::Completed, now).await
    }

    async fn release(&self, id: &OperationId, now: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE operation_log SET status = 'pending', updated_at = ?
                 WHERE id = ? AND status = 'in_flight'",
                params![now, id.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        id: &OperationId,
        status: OperationStatus,
        retry_count: u32,
        error: &str,
        next_attempt_at: i64,
        now: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE operation_log
                 SET status = ?, retry_count = ?, last_error = ?, next_attempt_at = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    status.as_str(),
                    i64::from(retry_count),
                    error,
                    next_attempt_at,
                    now,
                    id.as_str()
                ],
            )
            .await?;
        Ok(())
    }

    async fn supersede_before(&self, entity_id: &RecordId, seq: i64, now: i64) -> Result<u64> {
        let settled = self
            .conn
            .execute(
                &format!(
                    "UPDATE operation_log
                     SET status = 'completed', last_error = 'superseded', updated_at = ?
                     WHERE entity_id = ? AND seq < ? AND status IN {UNSETTLED}"
                ),
                params![now, entity_id.as_str(), seq],
            )
            .await?;
        Ok(settled)
    }

    async fn supersede_all(&self, entity_id: &RecordId, now: i64) -> Result<u64> {
        self.supersede_before(entity_id, i64::MAX, now).await
    }

    async fn has_unsettled_after(&self, entity_id: &RecordId, seq: i64) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT EXISTS(
                        SELECT 1 FROM operation_log
                        WHERE entity_id = ? AND seq > ? AND status IN {UNSETTLED}
                    )"
                ),
                params![entity_id.as_str(), seq],
            )
            .await?;

        Ok(rows
            .next()
            .await?
            .map(|row| row.get::<i64>(0))
            .transpose()?
            .is_some_and(|exists| exists != 0))
    }

    async fn latest_failed(&self, entity_id: &RecordId) -> Result<Option<OperationEntry>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM operation_log
                     WHERE entity_id = ? AND status = 'failed'
                     ORDER BY seq DESC
                     LIMIT 1"
                ),
                [entity_id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_entry(&row)?)),
            None => Ok(None),
        }
    }

    async fn release_in_flight(&self, now: i64) -> Result<u64> {
        let released = self
            .conn
            .execute(
                "UPDATE operation_log SET status = 'pending', updated_at = ?
                 WHERE status = 'in_flight'",
                [now],
            )
            .await?;
        Ok(released)
    }

    async fn requeue_failed(&self, entity_id: Option<&RecordId>, now: i64) -> Result<u64> {
        let requeued = self
            .conn
            .execute(
                "UPDATE operation_log
                 SET status = 'pending', retry_count = 0, last_error = NULL,
                     next_attempt_at = 0, updated_at = ?1
                 WHERE status = 'failed' AND (?2 IS NULL OR entity_id = ?2)",
                params![now, nullable(entity_id.map(RecordId::as_str))],
            )
            .await?;
        Ok(requeued)
    }

    async fn list(
        &self,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<OperationEntry>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM operation_log
                     WHERE (?1 IS NULL OR status = ?1)
                     ORDER BY seq
                     LIMIT ?2"
                ),
                params![nullable(status.map(OperationStatus::as_str)), limit as i64],
            )
            .await?;
        self.collect(rows).await
    }

    async fn counts(&self) -> Result<OperationCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM operation_log GROUP BY status",
                (),
            )
            .await?;

        let mut counts = OperationCounts::default();
        while let Some(row) = rows.next().await? {
            let status: String = row.get(0)?;
            let count = row.get::<i64>(1)?.max(0) as u64;
            match status.parse::<OperationStatus>()? {
                OperationStatus::Pending => counts.pending = count,
                OperationStatus::InFlight => counts.in_flight = count,
                OperationStatus::Failed => counts.failed = count,
                OperationStatus::Completed => counts.completed = count,
            }
        }
        Ok(counts)
    }

    async fn delete_completed_before(&self, before: i64) -> Result<u64> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM operation_log WHERE status = 'completed' AND updated_at < ?",
                [before],
            )
            .await?;
        Ok(deleted)
    }
}
