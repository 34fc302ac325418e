//! Database connection and pool management for a single cache index.

use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use tracing::instrument;

use crate::error::{ErrorKind, Result};

/// Embedded migrations that are run automatically on connect.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
// Only one process has the index open at a time (see `DurableStore`), and the
// cache operations themselves are short. A couple of connections is plenty.
const MAX_CONNECTIONS: u32 = 2;

/// Connection pool for one cache index file.
#[derive(Debug, Clone)]
pub(crate) struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to the index at the given path, creating it (and running
    /// migrations) if it doesn't exist.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub(crate) async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = Self::base_options().filename(path.as_ref()).create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            // Apply the query-based PRAGMAs to EVERY connection in the pool.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            // Every `set` must survive a crash of the worker that wrote it.
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(std::time::Duration::from_millis(1500))
    }

    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA locking_mode = NORMAL;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let db = Database::connect(&path).await.unwrap();
        assert!(path.exists());
        db.pool().close().await;
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(dir.path().join("index.db")).await.unwrap();
        db.migrate().await.unwrap();
        db.pool().close().await;
    }

    #[tokio::test]
    async fn test_pragmas_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(dir.path().join("index.db")).await.unwrap();
        let row: (String,) = sqlx::query_as("PRAGMA journal_mode").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, "wal");
        let row: (i64,) = sqlx::query_as("PRAGMA temp_store").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 2, "temp_store should be MEMORY");
        db.pool().close().await;
    }
}
