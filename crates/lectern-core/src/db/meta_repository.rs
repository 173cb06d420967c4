//! Key/value sync metadata (local write sequence, last sync time)

use libsql::{params, Connection};

use crate::error::{Error, Result};

const SEQUENCE_KEY: &str = "oplog_seq";
const LAST_SYNC_KEY: &str = "last_sync_at";

/// Trait for sync metadata storage operations (async)
#[allow(async_fn_in_trait)]
pub trait MetaRepository {
    /// Allocate the next device-wide local write sequence number
    async fn next_sequence(&self) -> Result<i64>;

    /// Time (Unix ms) of the last successful sync session
    async fn last_sync_at(&self) -> Result<Option<i64>>;

    async fn set_last_sync_at(&self, timestamp: i64) -> Result<()>;
}

/// libSQL implementation of `MetaRepository`
pub struct LibSqlMetaRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlMetaRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM sync_meta WHERE key = ?", [key])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
                params![key, value],
            )
            .await?;
        Ok(())
    }
}

impl MetaRepository for LibSqlMetaRepository<'_> {
    async fn next_sequence(&self) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO sync_meta (key, value) VALUES (?, 1)
                 ON CONFLICT(key) DO UPDATE SET value = value + 1",
                [SEQUENCE_KEY],
            )
            .await?;

        self.get(SEQUENCE_KEY)
            .await?
            .ok_or_else(|| Error::Database("operation sequence missing".into()))
    }

    async fn last_sync_at(&self) -> Result<Option<i64>> {
        self.get(LAST_SYNC_KEY).await
    }

    async fn set_last_sync_at(&self, timestamp: i64) -> Result<()> {
        self.set(LAST_SYNC_KEY, timestamp).await
    }
}
