//! Selecting which (issue, user) pairs a command should process.

use crate::error::{ErrorKind, Result};
use crate::orchestrator::Orchestrator;
use exn::{OptionExt, ResultExt};
use kmanga_catalog::{Issue, User};
use std::collections::HashMap;
use time::UtcDateTime;
use tracing::instrument;

/// One issue to build and deliver to one user.
#[derive(Debug, Clone)]
pub struct Job {
    pub issue: Issue,
    pub user: User,
}

impl Orchestrator {
    /// Fails with [`ErrorKind::UnknownSpider`] unless at least one manga in
    /// the catalog was crawled by `spider`.
    pub async fn validate_spider(&self, spider: &str) -> Result<()> {
        match self.catalog().has_source(spider).await.or_raise(|| ErrorKind::Catalog)? {
            true => Ok(()),
            false => exn::bail!(ErrorKind::UnknownSpider(spider.to_string())),
        }
    }

    async fn user(&self, name: &str) -> Result<User> {
        self.catalog()
            .get_user(name)
            .await
            .or_raise(|| ErrorKind::Catalog)?
            .ok_or_raise(|| ErrorKind::UnknownUser(name.to_string()))
    }

    async fn issue(&self, url: &str) -> Result<Issue> {
        self.catalog()
            .get_issue(url)
            .await
            .or_raise(|| ErrorKind::Catalog)?
            .ok_or_raise(|| ErrorKind::UnknownIssue(url.to_string()))
    }

    /// Jobs sending `urls` to `user`, or every issue the user is subscribed
    /// to and hasn't received yet when `urls` is empty. With a `spider`, only
    /// issues from that source are kept.
    #[instrument(skip(self, urls))]
    pub async fn send_jobs(&self, user: &str, urls: &[String], spider: Option<&str>) -> Result<Vec<Job>> {
        if let Some(spider) = spider {
            self.validate_spider(spider).await?;
        }
        let user = self.user(user).await?;
        if urls.is_empty() {
            let issues =
                self.catalog().pending_for_user(user.id, spider, u32::MAX).await.or_raise(|| ErrorKind::Catalog)?;
            return Ok(issues.into_iter().map(|issue| Job { issue, user: user.clone() }).collect());
        }
        let mut jobs = Vec::with_capacity(urls.len());
        for url in urls {
            let issue = self.issue(url).await?;
            if spider.is_some_and(|s| s != issue.manga.source) {
                tracing::warn!(issue = %url, source = %issue.manga.source, "Skipping issue from another spider");
                continue;
            }
            jobs.push(Job { issue, user: user.clone() });
        }
        Ok(jobs)
    }

    /// Jobs for the daily batch at `now`: every user whose local hour is
    /// their send hour gets their oldest unsent issues, up to what's left of
    /// their daily quota.
    #[instrument(skip(self))]
    pub async fn daily_jobs(&self, now: UtcDateTime, spider: Option<&str>) -> Result<Vec<Job>> {
        if let Some(spider) = spider {
            self.validate_spider(spider).await?;
        }
        let mut jobs = Vec::new();
        for user in self.catalog().list_users().await.or_raise(|| ErrorKind::Catalog)? {
            if user.local_hour(now) != user.send_hour {
                continue;
            }
            let sent = self.catalog().sent_today(&user, now).await.or_raise(|| ErrorKind::Catalog)?;
            let remaining = user.daily_quota.saturating_sub(sent);
            if remaining == 0 {
                tracing::debug!(user = %user.name, sent, "Daily quota reached");
                continue;
            }
            let issues =
                self.catalog().pending_for_user(user.id, spider, remaining).await.or_raise(|| ErrorKind::Catalog)?;
            tracing::debug!(user = %user.name, sent, pending = issues.len(), "Daily issues selected");
            jobs.extend(issues.into_iter().map(|issue| Job { issue, user: user.clone() }));
        }
        Ok(jobs)
    }

    /// Jobs re-running every failed delivery, optionally only those of one
    /// user and last updated within `since..=until`.
    #[instrument(skip(self))]
    pub async fn retry_jobs(
        &self,
        user: Option<&str>,
        since: Option<UtcDateTime>,
        until: Option<UtcDateTime>,
    ) -> Result<Vec<Job>> {
        if let Some((since, until)) = since.zip(until).filter(|(since, until)| since > until) {
            exn::bail!(ErrorKind::InvalidArgument(format!("since ({since}) is after until ({until})")));
        }
        let user_id = match user {
            Some(name) => Some(self.user(name).await?.id),
            None => None,
        };
        let failed = self.catalog().list_failed(user_id, since, until).await.or_raise(|| ErrorKind::Catalog)?;
        let mut users: HashMap<String, User> = HashMap::new();
        let mut jobs = Vec::with_capacity(failed.len());
        for delivery in failed {
            let user = match users.get(&delivery.user_name) {
                Some(user) => user.clone(),
                None => {
                    let user = self.user(&delivery.user_name).await?;
                    users.insert(delivery.user_name.clone(), user.clone());
                    user
                },
            };
            jobs.push(Job { issue: self.issue(&delivery.issue_url).await?, user });
        }
        Ok(jobs)
    }
}
