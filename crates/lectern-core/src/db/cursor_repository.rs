//! Sync cursor repository implementation

use libsql::{params, Connection};

use super::{nullable, opt_i64, opt_text, parse_column};
use crate::error::Result;
use crate::models::{EntityType, PullPosition, SyncCursor};

/// Trait for sync cursor storage operations (async)
#[allow(async_fn_in_trait)]
pub trait CursorRepository {
    /// Get the cursor for a type (origin if never synced)
    async fn get(&self, entity_type: EntityType) -> Result<SyncCursor>;

    /// Move the pull watermark forward; earlier positions are ignored
    async fn advance_pulled(&self, entity_type: EntityType, position: PullPosition)
        -> Result<bool>;

    /// Move the push watermark forward; earlier timestamps are ignored
    async fn advance_pushed(&self, entity_type: EntityType, timestamp: i64) -> Result<bool>;
}

/// libSQL implementation of `CursorRepository`
pub struct LibSqlCursorRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlCursorRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn write(&self, cursor: &SyncCursor) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_cursors (entity_type, last_pushed_at, last_pulled_at, last_pulled_id)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(entity_type) DO UPDATE SET
                    last_pushed_at = excluded.last_pushed_at,
                    last_pulled_at = excluded.last_pulled_at,
                    last_pulled_id = excluded.last_pulled_id",
                params![
                    cursor.entity_type.as_str(),
                    nullable(cursor.last_pushed_at),
                    cursor.last_pulled.updated_at,
                    nullable(cursor.last_pulled.id.map(|id| id.as_str()))
                ],
            )
            .await?;
        Ok(())
    }
}

impl CursorRepository for LibSqlCursorRepository<'_> {
    async fn get(&self, entity_type: EntityType) -> Result<SyncCursor> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_pushed_at, last_pulled_at, last_pulled_id
                 FROM sync_cursors WHERE entity_type = ?",
                [entity_type.as_str()],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(SyncCursor::new(entity_type));
        };

        Ok(SyncCursor {
            entity_type,
            last_pushed_at: opt_i64(&row, 0)?,
            last_pulled: PullPosition {
                updated_at: row.get(1)?,
                id: opt_text(&row, 2)?
                    .map(|raw| parse_column(&raw, "cursor id"))
                    .transpose()?,
            },
        })
    }

    async fn advance_pulled(
        &self,
        entity_type: EntityType,
        position: PullPosition,
    ) -> Result<bool> {
        let mut cursor = self.get(entity_type).await?;
        if position <= cursor.last_pulled {
            return Ok(false);
        }
        cursor.last_pulled = position;
        self.write(&cursor).await?;
        Ok(true)
    }

    async fn advance_pushed(&self, entity_type: EntityType, timestamp: i64) -> Result<bool> {
        let mut cursor = self.get(entity_type).await?;
        if cursor.last_pushed_at.is_some_and(|current| timestamp <= current) {
            return Ok(false);
        }
        cursor.last_pushed_at = Some(timestamp);
        self.write(&cursor).await?;
        Ok(true)
    }
}
