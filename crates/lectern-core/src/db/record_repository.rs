//! Entity record repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use libsql::{params, Connection, Row};

use super::{nullable, opt_i64, opt_text, parse_column};
use crate::error::Result;
use crate::models::{EntityRecord, EntityType, RecordId};

const COLUMNS: &str = "id, entity_type, owner_id, parent_id, fields, created_at, updated_at, \
                       deleted_at, dirty, sync_version, acked_version, base_snapshot, blocked";

/// Filter for record listings
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub entity_type: Option<EntityType>,
    pub include_deleted: bool,
    pub limit: usize,
    pub offset: usize,
}

impl RecordQuery {
    /// Live records of one type, newest first
    pub const fn live(entity_type: EntityType, limit: usize) -> Self {
        Self {
            entity_type: Some(entity_type),
            include_deleted: false,
            limit,
            offset: 0,
        }
    }
}

/// Trait for entity record storage operations (async)
#[allow(async_fn_in_trait)]
pub trait RecordRepository {
    /// Get a record by ID, tombstones included
    async fn get(&self, id: &RecordId) -> Result<Option<EntityRecord>>;

    /// Insert or fully replace a record row
    async fn save(&self, record: &EntityRecord) -> Result<()>;

    /// List records newest first
    async fn list(&self, query: &RecordQuery) -> Result<Vec<EntityRecord>>;

    /// List live records whose parent is `parent_id`
    async fn list_children(&self, parent_id: &RecordId) -> Result<Vec<EntityRecord>>;

    /// List dirty records of a type
    async fn list_dirty(&self, entity_type: EntityType) -> Result<Vec<EntityRecord>>;

    /// List quarantined records
    async fn list_blocked(&self) -> Result<Vec<EntityRecord>>;

    /// Find record ids starting with `prefix`
    async fn find_ids_by_prefix(&self, prefix: &str) -> Result<Vec<RecordId>>;

    /// Set or clear the quarantine flag
    async fn set_blocked(&self, id: &RecordId, blocked: bool) -> Result<bool>;

    /// Physically remove clean tombstones deleted before `before` that have
    /// no unsettled operations or pending conflicts
    async fn purge_tombstones(&self, before: i64) -> Result<u64>;
}

/// libSQL implementation of `RecordRepository`
pub struct LibSqlRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a record from a database row
    fn parse_record(row: &Row) -> Result<EntityRecord> {
        let id: String = row.get(0)?;
        let entity_type: String = row.get(1)?;
        let fields: String = row.get(4)?;

        Ok(EntityRecord {
            id: parse_column(&id, "record id")?,
            entity_type: parse_column(&entity_type, "entity type")?,
            owner_id: row.get(2)?,
            parent_id: opt_text(row, 3)?
                .map(|raw| parse_column(&raw, "parent id"))
                .transpose()?,
            fields: serde_json::from_str(&fields)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            deleted_at: opt_i64(row, 7)?,
            dirty: row.get::<i64>(8)? != 0,
            sync_version: row.get(9)?,
            acked_version: row.get(10)?,
            base: opt_text(row, 11)?
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?,
            blocked: row.get::<i64>(12)? != 0,
        })
    }

    async fn collect(&self, mut rows: libsql::Rows) -> Result<Vec<EntityRecord>> {
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(&row)?);
        }
        Ok(records)
    }
}

impl RecordRepository for LibSqlRecordRepository<'_> {
    async fn get(&self, id: &RecordId) -> Result<Option<EntityRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {COLUMNS} FROM records WHERE id = ?"),
                [id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &EntityRecord) -> Result<()> {
        let base = record
            .base
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn
            .execute(
                &format!(
                    "INSERT INTO records ({COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(id) DO UPDATE SET
                        entity_type = excluded.entity_type,
                        owner_id = excluded.owner_id,
                        parent_id = excluded.parent_id,
                        fields = excluded.fields,
                        created_at = excluded.created_at,
                        updated_at = excluded.updated_at,
                        deleted_at = excluded.deleted_at,
                        dirty = excluded.dirty,
                        sync_version = excluded.sync_version,
                        acked_version = excluded.acked_version,
                        base_snapshot = excluded.base_snapshot,
                        blocked = excluded.blocked"
                ),
                params![
                    record.id.as_str(),
                    record.entity_type.as_str(),
                    record.owner_id.as_str(),
                    nullable(record.parent_id.map(|id| id.as_str())),
                    serde_json::to_string(&record.fields)?,
                    record.created_at,
                    record.updated_at,
                    nullable(record.deleted_at),
                    i64::from(record.dirty),
                    record.sync_version,
                    record.acked_version,
                    nullable(base),
                    i64::from(record.blocked)
                ],
            )
            .await?;
        Ok(())
    }

    async fn list(&self, query: &RecordQuery) -> Result<Vec<EntityRecord>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM records
                     WHERE (?1 IS NULL OR entity_type = ?1)
                       AND (?2 = 1 OR deleted_at IS NULL)
                     ORDER BY updated_at DESC, id DESC
                     LIMIT ?3 OFFSET ?4"
                ),
                params![
                    nullable(query.entity_type.map(EntityType::as_str)),
                    i64::from(query.include_deleted),
                    query.limit as i64,
                    query.offset as i64
                ],
            )
            .await?;
        self.collect(rows).await
    }

    async fn list_children(&self, parent_id: &RecordId) -> Result<Vec<EntityRecord>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM records
                     WHERE parent_id = ? AND deleted_at IS NULL
                     ORDER BY created_at, id"
                ),
                [parent_id.as_str()],
            )
            .await?;
        self.collect(rows).await
    }

    async fn list_dirty(&self, entity_type: EntityType) -> Result<Vec<EntityRecord>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM records
                     WHERE entity_type = ? AND dirty = 1
                     ORDER BY updated_at"
                ),
                [entity_type.as_str()],
            )
            .await?;
        self.collect(rows).await
    }

    async fn list_blocked(&self) -> Result<Vec<EntityRecord>> {
        let rows = self
            .conn
            .query(
                &format!("SELECT {COLUMNS} FROM records WHERE blocked = 1 ORDER BY id"),
                (),
            )
            .await?;
        self.collect(rows).await
    }

    async fn find_ids_by_prefix(&self, prefix: &str) -> Result<Vec<RecordId>> {
        let pattern = format!("{}%", prefix.trim().to_ascii_lowercase());
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM records WHERE id LIKE ? ORDER BY id LIMIT 10",
                [pattern],
            )
            .await?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            let raw: String = row.get(0)?;
            ids.push(parse_column(&raw, "record id")?);
        }
        Ok(ids)
    }

    async fn set_blocked(&self, id: &RecordId, blocked: bool) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE records SET blocked = ? WHERE id = ?",
                params![i64::from(blocked), id.as_str()],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn purge_tombstones(&self, before: i64) -> Result<u64> {
        let purged = self
            .conn
            .execute(
                "DELETE FROM records
                 WHERE deleted_at IS NOT NULL
                   AND deleted_at < ?
                   AND dirty = 0
                   AND blocked = 0
                   AND id NOT IN (
                       SELECT entity_id FROM operation_log
                       WHERE status IN ('pending', 'in_flight', 'failed')
                   )
                   AND id NOT IN (
                       SELECT entity_id FROM sync_conflicts WHERE status = 'pending'
                   )",
                [before],
            )
            .await?;
        Ok(purged)
    }
}
