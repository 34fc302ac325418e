//! Sending built documents to users.

use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::ResultExt;
use kmanga_cache::Document;
use kmanga_catalog::User;
use serde::Serialize;
use std::path::{Path, PathBuf};
use time::UtcDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::instrument;

pub const MESSAGE_FILE: &str = "message.json";

/// Transport for finished documents. One call sends one message carrying
/// every document of an issue.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, user: &User, subject: &str, documents: &[Document]) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    to: &'a str,
    user: &'a str,
    subject: &'a str,
    created_at: String,
    attachments: Vec<&'a str>,
}

/// Writes each message to `<outbox>/<user>/<unix time>-<n>/` as a
/// `message.json` envelope plus the attachments under their display names,
/// for a mail relay to pick up.
#[derive(Debug, Clone)]
pub struct OutboxDelivery {
    root: PathBuf,
}
impl OutboxDelivery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a fresh message directory, numbering messages created within
    /// the same second.
    async fn message_dir(&self, user: &str, now: UtcDateTime) -> Result<PathBuf> {
        let mailbox = self.root.join(user);
        tokio::fs::create_dir_all(&mailbox).await.or_raise(|| ErrorKind::Delivery)?;
        let mut n = 0u32;
        loop {
            let dir = mailbox.join(format!("{}-{n}", now.unix_timestamp()));
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => return Ok(dir),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(e).or_raise(|| ErrorKind::Delivery),
            }
        }
    }
}

#[async_trait]
impl Delivery for OutboxDelivery {
    #[instrument(skip_all, fields(user = %user.name, subject = %subject))]
    async fn deliver(&self, user: &User, subject: &str, documents: &[Document]) -> Result<()> {
        let now = UtcDateTime::now();
        let dir = self.message_dir(&user.name, now).await?;
        for document in documents {
            tokio::fs::copy(&document.path, dir.join(&document.name)).await.or_raise(|| ErrorKind::Delivery)?;
        }
        let envelope = Envelope {
            to: &user.email,
            user: &user.name,
            subject,
            created_at: now.format(&Rfc3339).or_raise(|| ErrorKind::Delivery)?,
            attachments: documents.iter().map(|d| d.name.as_str()).collect(),
        };
        let json = serde_json::to_vec_pretty(&envelope).or_raise(|| ErrorKind::Delivery)?;
        tokio::fs::write(dir.join(MESSAGE_FILE), json).await.or_raise(|| ErrorKind::Delivery)?;
        tracing::info!(message = %dir.display(), attachments = documents.len(), "Message written to outbox");
        Ok(())
    }
}
