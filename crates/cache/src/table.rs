//! The associative table held open by a [`DurableStore`](crate::DurableStore).

use crate::db::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{EntryRow, RawEntry, from_nanos, to_nanos};
use exn::ResultExt;
use time::UtcDateTime;

/// Handle to an open cache index.
///
/// Obtained from [`DurableStore::open`](crate::DurableStore::open); every
/// handle for the same store within a process shares one connection pool.
/// Operations are single statements, so each one is atomic on its own.
#[derive(Debug, Clone)]
pub struct Table {
    db: Database,
}
impl Table {
    pub(crate) fn new(db: Database) -> Self {
        Self { db }
    }

    pub(crate) async fn get(&self, key: &str) -> Result<Option<RawEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(include_str!("../queries/get_entry.sql"))
            .bind(key)
            .fetch_optional(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(RawEntry::try_from).transpose()
    }

    pub(crate) async fn put(&self, key: &str, value: &str, created_at: UtcDateTime) -> Result<()> {
        sqlx::query(include_str!("../queries/upsert_entry.sql"))
            .bind(key)
            .bind(value)
            .bind(to_nanos(created_at)?)
            .execute(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Returns `true` if a row was removed.
    pub(crate) async fn remove(&self, key: &str) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/delete_entry.sql"))
            .bind(key)
            .execute(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn keys(&self) -> Result<Vec<String>> {
        sqlx::query_scalar(include_str!("../queries/list_keys.sql"))
            .fetch_all(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub(crate) async fn len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(include_str!("../queries/count_entries.sql"))
            .fetch_one(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        u64::try_from(count).or_raise(|| ErrorKind::InvalidData("count"))
    }

    /// Every key with its write time, oldest first.
    pub(crate) async fn by_age(&self) -> Result<Vec<(String, UtcDateTime)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(include_str!("../queries/list_by_age.sql"))
            .fetch_all(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|(key, nanos)| Ok((key, from_nanos(nanos)?))).collect()
    }

    /// The `limit` oldest keys. Ties are broken by key so the order is stable.
    pub(crate) async fn oldest(&self, limit: u64) -> Result<Vec<String>> {
        let limit = i64::try_from(limit).or_raise(|| ErrorKind::InvalidData("limit"))?;
        sqlx::query_scalar(include_str!("../queries/list_oldest.sql"))
            .bind(limit)
            .fetch_all(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)
    }
}
