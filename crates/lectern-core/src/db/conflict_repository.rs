//! Sync conflict repository implementation

#![allow(clippy::cast_sign_loss)]

use libsql::{params, Connection, Row};

use super::{nullable, opt_i64, opt_text, parse_column};
use crate::error::Result;
use crate::models::{ConflictId, ConflictStatus, EntityType, RecordId, SyncConflict};

const COLUMNS: &str = "id, entity_type, entity_id, local_snapshot, remote_snapshot, \
                       conflicting_fields, status, resolution, strategy, created_at, resolved_at";

/// Trait for conflict storage operations (async)
#[allow(async_fn_in_trait)]
pub trait ConflictRepository {
    /// Persist a new conflict
    async fn insert(&self, conflict: &SyncConflict) -> Result<()>;

    /// Overwrite an existing conflict (refreshed snapshots or resolution)
    async fn update(&self, conflict: &SyncConflict) -> Result<()>;

    async fn get(&self, id: &ConflictId) -> Result<Option<SyncConflict>>;

    /// The pending conflict for a record, if any
    async fn pending_for(&self, entity_id: &RecordId) -> Result<Option<SyncConflict>>;

    /// List conflicts oldest first
    async fn list(
        &self,
        status: Option<ConflictStatus>,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<SyncConflict>>;

    async fn count_pending(&self) -> Result<u64>;
}

/// libSQL implementation of `ConflictRepository`
pub struct LibSqlConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &Row) -> Result<SyncConflict> {
        let id: String = row.get(0)?;
        let entity_type: String = row.get(1)?;
        let entity_id: String = row.get(2)?;
        let local: String = row.get(3)?;
        let remote: String = row.get(4)?;
        let fields: String = row.get(5)?;
        let status: String = row.get(6)?;

        Ok(SyncConflict {
            id: parse_column(&id, "conflict id")?,
            entity_type: parse_column(&entity_type, "entity type")?,
            entity_id: parse_column(&entity_id, "entity id")?,
            local_snapshot: serde_json::from_str(&local)?,
            remote_snapshot: serde_json::from_str(&remote)?,
            conflicting_fields: serde_json::from_str(&fields)?,
            status: status.parse()?,
            resolution: opt_text(row, 7)?.map(|raw| raw.parse()).transpose()?,
            strategy: row.get(8)?,
            created_at: row.get(9)?,
            resolved_at: opt_i64(row, 10)?,
        })
    }

    async fn collect(&self, mut rows: libsql::Rows) -> Result<Vec<SyncConflict>> {
        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(Self::parse_conflict(&row)?);
        }
        Ok(conflicts)
    }
}

impl ConflictRepository for LibSqlConflictRepository<'_> {
    async fn insert(&self, conflict: &SyncConflict) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO sync_conflicts ({COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    conflict.id.as_str(),
                    conflict.entity_type.as_str(),
                    conflict.entity_id.as_str(),
                    serde_json::to_string(&conflict.local_snapshot)?,
                    serde_json::to_string(&conflict.remote_snapshot)?,
                    serde_json::to_string(&conflict.conflicting_fields)?,
                    conflict.status.as_str(),
                    nullable(conflict.resolution.map(|r| r.as_str())),
                    conflict.strategy.as_str(),
                    conflict.created_at,
                    nullable(conflict.resolved_at)
                ],
            )
            .await?;
        Ok(())
    }

    async fn update(&self, conflict: &SyncConflict) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_conflicts SET
                    local_snapshot = ?2,
                    remote_snapshot = ?3,
                    conflicting_fields = ?4,
                    status = ?5,
                    resolution = ?6,
                    strategy = ?7,
                    resolved_at = ?8
                 WHERE id = ?1",
                params![
                    conflict.id.as_str(),
                    serde_json::to_string(&conflict.local_snapshot)?,
                    serde_json::to_string(&conflict.remote_snapshot)?,
                    serde_json::to_string(&conflict.conflicting_fields)?,
                    conflict.status.as_str(),
                    nullable(conflict.resolution.map(|r| r.as_str())),
                    conflict.strategy.as_str(),
                    nullable(conflict.resolved_at)
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &ConflictId) -> Result<Option<SyncConflict>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {COLUMNS} FROM sync_conflicts WHERE id = ?"),
                [id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_conflict(&row)?)),
            None => Ok(None),
        }
    }

    async fn pending_for(&self, entity_id: &RecordId) -> Result<Option<SyncConflict>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM sync_conflicts
                     WHERE entity_id = ? AND status = 'pending'
                     ORDER BY created_at DESC LIMIT 1"
                ),
                [entity_id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_conflict(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        status: Option<ConflictStatus>,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<SyncConflict>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM sync_conflicts
                     WHERE (?1 IS NULL OR status = ?1)
                       AND (?2 IS NULL OR entity_type = ?2)
                     ORDER BY created_at, id"
                ),
                params![
                    nullable(status.map(ConflictStatus::as_str)),
                    nullable(entity_type.map(EntityType::as_str))
                ],
            )
            .await?;
        self.collect(rows).await
    }

    async fn count_pending(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_conflicts WHERE status = 'pending'",
                (),
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?.max(0) as u64),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{EntityRecord, FieldMap, Resolution};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn conflict() -> SyncConflict {
        let record = EntityRecord::new_local(EntityType::Sermon, "owner", None, FieldMap::new(), 1);
        SyncConflict::new(
            record.snapshot(),
            record.snapshot(),
            BTreeSet::from(["title".to_string()]),
            "manual",
            3,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_query_pending() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());
        let conflict = conflict();
        repo.insert(&conflict).await.unwrap();

        assert_eq!(repo.get(&conflict.id).await.unwrap(), Some(conflict.clone()));
        assert_eq!(
            repo.pending_for(&conflict.entity_id).await.unwrap(),
            Some(conflict.clone())
        );
        assert_eq!(repo.count_pending().await.unwrap(), 1);
        assert!(repo
            .list(None, Some(EntityType::Series))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_resolution() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());
        let conflict = conflict();
        repo.insert(&conflict).await.unwrap();

        let resolved = conflict.resolved(Resolution::LocalWins, 9);
        repo.update(&resolved).await.unwrap();

        assert_eq!(repo.count_pending().await.unwrap(), 0);
        assert!(repo.pending_for(&resolved.entity_id).await.unwrap().is_none());
        let listed = repo
            .list(Some(ConflictStatus::Resolved), None)
            .await
            .unwrap();
        assert_eq!(listed, vec![resolved]);
    }
}
