//! Catalog records and their row representations.

use crate::error::{Error, ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use std::fmt;
use std::str::FromStr;
use time::{Duration, Time, UtcDateTime};

pub(crate) fn to_nanos(timestamp: UtcDateTime) -> Result<i64> {
    i64::try_from(timestamp.unix_timestamp_nanos()).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

pub(crate) fn from_nanos(nanos: i64) -> Result<UtcDateTime> {
    UtcDateTime::from_unix_timestamp_nanos(i128::from(nanos)).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manga {
    pub id: i64,
    pub url: String,
    pub name: String,
    pub author: String,
    /// Spider the manga was crawled with.
    pub source: String,
    /// `ltr` or `rtl`.
    pub direction: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub id: i64,
    pub url: String,
    pub name: String,
    pub number: Option<String>,
    pub language: String,
    pub added_at: UtcDateTime,
    pub manga: Manga,
}

#[derive(sqlx::FromRow)]
pub(crate) struct IssueRow {
    id: i64,
    url: String,
    name: String,
    number: Option<String>,
    language: String,
    added_at: i64,
    manga_id: i64,
    manga_url: String,
    manga_name: String,
    manga_author: String,
    manga_source: String,
    manga_direction: String,
}
impl TryFrom<IssueRow> for Issue {
    type Error = Error;
    fn try_from(row: IssueRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            url: row.url,
            name: row.name,
            number: row.number,
            language: row.language,
            added_at: from_nanos(row.added_at)?,
            manga: Manga {
                id: row.manga_id,
                url: row.manga_url,
                name: row.manga_name,
                author: row.manga_author,
                source: row.manga_source,
                direction: row.manga_direction,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    /// Issues sent per local day at most.
    pub daily_quota: u32,
    pub utc_offset_minutes: i32,
    /// Local hour the daily batch is sent at.
    pub send_hour: u8,
}
impl User {
    fn offset(&self) -> Duration {
        Duration::minutes(i64::from(self.utc_offset_minutes))
    }

    /// Hour of the day in the user's time zone.
    pub fn local_hour(&self, now: UtcDateTime) -> u8 {
        (now + self.offset()).hour()
    }

    /// Start of the user's current local day, as a UTC instant.
    pub fn day_start(&self, now: UtcDateTime) -> UtcDateTime {
        let local = now + self.offset();
        UtcDateTime::new(local.date(), Time::MIDNIGHT) - self.offset()
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct UserRow {
    id: i64,
    name: String,
    email: String,
    daily_quota: i64,
    utc_offset_minutes: i64,
    send_hour: i64,
}
impl TryFrom<UserRow> for User {
    type Error = Error;
    fn try_from(row: UserRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            email: row.email,
            daily_quota: u32::try_from(row.daily_quota).or_raise(|| ErrorKind::InvalidData("daily_quota"))?,
            utc_offset_minutes: i32::try_from(row.utc_offset_minutes)
                .or_raise(|| ErrorKind::InvalidData("utc_offset_minutes"))?,
            send_hour: u8::try_from(row.send_hour).or_raise(|| ErrorKind::InvalidData("send_hour"))?,
        })
    }
}

/// Progress of one issue towards one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Processing,
    Sent,
    Failed,
}
impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }
}
impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
impl FromStr for Status {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        [Self::Pending, Self::Processing, Self::Sent, Self::Failed]
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_raise(|| ErrorKind::InvalidData("status"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub issue_id: i64,
    pub user_id: i64,
    pub issue_url: String,
    pub user_name: String,
    pub status: Status,
    pub updated_at: UtcDateTime,
    pub error: Option<String>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct DeliveryRow {
    issue_id: i64,
    user_id: i64,
    issue_url: String,
    user_name: String,
    status: String,
    updated_at: i64,
    error: Option<String>,
}
impl TryFrom<DeliveryRow> for Delivery {
    type Error = Error;
    fn try_from(row: DeliveryRow) -> Result<Self> {
        Ok(Self {
            issue_id: row.issue_id,
            user_id: row.user_id,
            issue_url: row.issue_url,
            user_name: row.user_name,
            status: row.status.parse()?,
            updated_at: from_nanos(row.updated_at)?,
            error: row.error,
        })
    }
}

/// Seed data for [`Catalog::upsert_manga`](crate::Catalog::upsert_manga).
#[derive(Debug, Clone)]
pub struct NewManga<'a> {
    pub url: &'a str,
    pub name: &'a str,
    pub author: &'a str,
    pub source: &'a str,
    pub direction: &'a str,
}

/// Seed data for [`Catalog::upsert_issue`](crate::Catalog::upsert_issue).
#[derive(Debug, Clone)]
pub struct NewIssue<'a> {
    pub url: &'a str,
    pub manga_id: i64,
    pub name: &'a str,
    pub number: Option<&'a str>,
    pub language: &'a str,
}

/// Seed data for [`Catalog::upsert_user`](crate::Catalog::upsert_user).
#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub daily_quota: u32,
    pub utc_offset_minutes: i32,
    pub send_hour: u8,
}
