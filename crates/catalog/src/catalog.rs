//! Repository over the catalog database.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{
    Delivery, DeliveryRow, Issue, IssueRow, NewIssue, NewManga, NewUser, Status, User, UserRow, to_nanos,
};
use exn::ResultExt;
use sqlx::SqlitePool;
use time::UtcDateTime;
use tracing::instrument;

/// Catalog collaborator of the build orchestrator: issue and user lookup,
/// subscription queries and per-(issue, user) delivery status.
#[derive(Debug, Clone)]
pub struct Catalog {
    pool: SqlitePool,
}
impl From<&Database> for Catalog {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Catalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Inserts or updates (by URL) a manga. Returns its id.
    pub async fn upsert_manga(&self, manga: &NewManga<'_>) -> Result<i64> {
        sqlx::query_scalar(include_str!("../queries/upsert_manga.sql"))
            .bind(manga.url)
            .bind(manga.name)
            .bind(manga.author)
            .bind(manga.source)
            .bind(manga.direction)
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Inserts or updates (by URL) an issue. Returns its id. The time it was
    /// first added is kept on update.
    pub async fn upsert_issue(&self, issue: &NewIssue<'_>) -> Result<i64> {
        sqlx::query_scalar(include_str!("../queries/upsert_issue.sql"))
            .bind(issue.url)
            .bind(issue.manga_id)
            .bind(issue.name)
            .bind(issue.number)
            .bind(issue.language)
            .bind(to_nanos(UtcDateTime::now())?)
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Inserts or updates (by name) a user. Returns its id.
    pub async fn upsert_user(&self, user: &NewUser<'_>) -> Result<i64> {
        sqlx::query_scalar(include_str!("../queries/upsert_user.sql"))
            .bind(user.name)
            .bind(user.email)
            .bind(i64::from(user.daily_quota))
            .bind(i64::from(user.utc_offset_minutes))
            .bind(i64::from(user.send_hour))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub async fn subscribe(&self, user_id: i64, manga_id: i64) -> Result<()> {
        sqlx::query(include_str!("../queries/subscribe.sql"))
            .bind(user_id)
            .bind(manga_id)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Issue (with its manga) by URL.
    pub async fn get_issue(&self, url: &str) -> Result<Option<Issue>> {
        let row: Option<IssueRow> = sqlx::query_as(include_str!("../queries/get_issue.sql"))
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Issue::try_from).transpose()
    }

    pub async fn get_user(&self, name: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(include_str!("../queries/get_user.sql"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(User::try_from).transpose()
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows: Vec<UserRow> = sqlx::query_as(include_str!("../queries/list_users.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(User::try_from).collect()
    }

    /// Whether any manga was crawled by `spider`.
    pub async fn has_source(&self, spider: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(include_str!("../queries/count_source.sql"))
            .bind(spider)
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(count > 0)
    }

    /// Up to `limit` issues of the user's subscriptions that were never
    /// attempted (or are still pending), oldest first, optionally restricted
    /// to one spider.
    pub async fn pending_for_user(&self, user_id: i64, spider: Option<&str>, limit: u32) -> Result<Vec<Issue>> {
        let rows: Vec<IssueRow> = sqlx::query_as(include_str!("../queries/pending_for_user.sql"))
            .bind(user_id)
            .bind(spider)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(Issue::try_from).collect()
    }

    // =========================================================================
    // Delivery status
    // =========================================================================

    #[instrument(skip(self, error))]
    pub async fn set_status(&self, issue_id: i64, user_id: i64, status: Status, error: Option<&str>) -> Result<()> {
        sqlx::query(include_str!("../queries/set_status.sql"))
            .bind(issue_id)
            .bind(user_id)
            .bind(status.as_str())
            .bind(to_nanos(UtcDateTime::now())?)
            .bind(error)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tracing::debug!(issue_id, user_id, status = %status, "Delivery status updated");
        Ok(())
    }

    pub async fn get_status(&self, issue_id: i64, user_id: i64) -> Result<Option<Delivery>> {
        let row: Option<DeliveryRow> = sqlx::query_as(include_str!("../queries/get_status.sql"))
            .bind(issue_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Delivery::try_from).transpose()
    }

    /// Failed deliveries, oldest failure first, optionally restricted to one
    /// user and to failures last updated within `[since, until]`.
    pub async fn list_failed(
        &self,
        user_id: Option<i64>,
        since: Option<UtcDateTime>,
        until: Option<UtcDateTime>,
    ) -> Result<Vec<Delivery>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(include_str!("../queries/list_failed.sql"))
            .bind(user_id)
            .bind(since.map(to_nanos).transpose()?)
            .bind(until.map(to_nanos).transpose()?)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(Delivery::try_from).collect()
    }

    /// Issues sent to `user` since the start of their local day.
    pub async fn sent_today(&self, user: &User, now: UtcDateTime) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(include_str!("../queries/count_sent_since.sql"))
            .bind(user.id)
            .bind(to_nanos(user.day_start(now))?)
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        u32::try_from(count).or_raise(|| ErrorKind::InvalidData("count"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        catalog: Catalog,
        manga: i64,
        user: User,
    }
    impl Fixture {
        async fn new() -> Self {
            let db = Database::connect_in_memory().await.unwrap();
            let catalog = Catalog::from(&db);
            let manga = catalog
                .upsert_manga(&NewManga {
                    url: "https://example.com/manga",
                    name: "Manga",
                    author: "Author",
                    source: "mangareader",
                    direction: "rtl",
                })
                .await
                .unwrap();
            let user_id = catalog
                .upsert_user(&NewUser {
                    name: "reader",
                    email: "reader@example.com",
                    daily_quota: 2,
                    utc_offset_minutes: 0,
                    send_hour: 8,
                })
                .await
                .unwrap();
            catalog.subscribe(user_id, manga).await.unwrap();
            let user = catalog.get_user("reader").await.unwrap().unwrap();
            Self { catalog, manga, user }
        }

        async fn issue(&self, n: u32) -> i64 {
            let url = format!("https://example.com/manga/{n}");
            let name = format!("Manga {n}");
            let number = n.to_string();
            self.catalog
                .upsert_issue(&NewIssue {
                    url: &url,
                    manga_id: self.manga,
                    name: &name,
                    number: Some(&number),
                    language: "en",
                })
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_get_issue() {
        let fx = Fixture::new().await;
        let id = fx.issue(1).await;
        let issue = fx.catalog.get_issue("https://example.com/manga/1").await.unwrap().unwrap();
        assert_eq!(issue.id, id);
        assert_eq!(issue.number.as_deref(), Some("1"));
        assert_eq!(issue.manga.name, "Manga");
        assert_eq!(issue.manga.direction, "rtl");
        assert!(fx.catalog.get_issue("https://example.com/manga/2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_keeps_id() {
        let fx = Fixture::new().await;
        let first = fx.issue(1).await;
        assert_eq!(fx.issue(1).await, first);
        assert_eq!(fx.user.daily_quota, 2);
        assert!(fx.catalog.get_user("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_skips_attempted() {
        let fx = Fixture::new().await;
        let one = fx.issue(1).await;
        let two = fx.issue(2).await;
        let three = fx.issue(3).await;
        fx.catalog.set_status(one, fx.user.id, Status::Sent, None).await.unwrap();
        fx.catalog.set_status(two, fx.user.id, Status::Failed, Some("boom")).await.unwrap();
        let pending = fx.catalog.pending_for_user(fx.user.id, None, 10).await.unwrap();
        assert_eq!(pending.iter().map(|i| i.id).collect::<Vec<_>>(), vec![three]);
        assert!(fx.catalog.pending_for_user(fx.user.id, Some("other"), 10).await.unwrap().is_empty());
        assert_eq!(fx.catalog.pending_for_user(fx.user.id, Some("mangareader"), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_limit_and_order() {
        let fx = Fixture::new().await;
        let ids = [fx.issue(1).await, fx.issue(2).await, fx.issue(3).await];
        let pending = fx.catalog.pending_for_user(fx.user.id, None, 2).await.unwrap();
        assert_eq!(pending.iter().map(|i| i.id).collect::<Vec<_>>(), ids[..2].to_vec());
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let fx = Fixture::new().await;
        let id = fx.issue(1).await;
        assert!(fx.catalog.get_status(id, fx.user.id).await.unwrap().is_none());
        fx.catalog.set_status(id, fx.user.id, Status::Processing, None).await.unwrap();
        fx.catalog.set_status(id, fx.user.id, Status::Failed, Some("compiler crashed")).await.unwrap();
        let delivery = fx.catalog.get_status(id, fx.user.id).await.unwrap().unwrap();
        assert_eq!(delivery.status, Status::Failed);
        assert_eq!(delivery.error.as_deref(), Some("compiler crashed"));
        assert_eq!(delivery.user_name, "reader");
        fx.catalog.set_status(id, fx.user.id, Status::Sent, None).await.unwrap();
        let delivery = fx.catalog.get_status(id, fx.user.id).await.unwrap().unwrap();
        assert_eq!(delivery.status, Status::Sent);
        assert!(delivery.error.is_none());
    }

    #[tokio::test]
    async fn test_list_failed_filters() {
        let fx = Fixture::new().await;
        let id = fx.issue(1).await;
        let before = UtcDateTime::now();
        fx.catalog.set_status(id, fx.user.id, Status::Failed, Some("boom")).await.unwrap();
        let after = UtcDateTime::now();
        let failed = fx.catalog.list_failed(None, None, None).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].issue_url, "https://example.com/manga/1");
        assert_eq!(fx.catalog.list_failed(Some(fx.user.id), Some(before), Some(after)).await.unwrap().len(), 1);
        assert!(fx.catalog.list_failed(Some(fx.user.id + 1), None, None).await.unwrap().is_empty());
        assert!(fx.catalog.list_failed(None, Some(after + time::Duration::SECOND), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sent_today() {
        let fx = Fixture::new().await;
        for n in 1..=3 {
            let id = fx.issue(n).await;
            let status = if n == 3 { Status::Failed } else { Status::Sent };
            fx.catalog.set_status(id, fx.user.id, status, None).await.unwrap();
        }
        assert_eq!(fx.catalog.sent_today(&fx.user, UtcDateTime::now()).await.unwrap(), 2);
        let tomorrow = UtcDateTime::now() + time::Duration::DAY;
        assert_eq!(fx.catalog.sent_today(&fx.user, tomorrow).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_has_source() {
        let fx = Fixture::new().await;
        assert!(fx.catalog.has_source("mangareader").await.unwrap());
        assert!(!fx.catalog.has_source("unknown").await.unwrap());
    }
}
