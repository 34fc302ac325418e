//! Turning (issue, user) requests into delivered documents.
//!
//! Every request moves its delivery record through
//! `PENDING → PROCESSING → SENT | FAILED`. Documents already in the
//! [`DocumentCache`](kmanga_cache::DocumentCache) are delivered as they are.
//! Otherwise the issue's cached images are staged into a [`Container`], split
//! into volumes, compiled, and stored in the document cache before delivery.
//! The document cache is only written once every volume has been built, so a
//! failed build never leaves a partial entry behind.

use crate::caches::Caches;
use crate::delivery::Delivery;
use crate::error::{ErrorKind, Result};
use crate::settings::BuildSettings;
use exn::{OptionExt, ResultExt};
use kmanga_cache::Document;
use kmanga_catalog::{Catalog, Issue, Status, User};
use kmanga_mobi::error::ErrorKind as MobiErrorKind;
use kmanga_mobi::{Container, Direction, IssueMeta, MangaMobi, VolumeInfo};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tracing::instrument;

pub struct Orchestrator {
    catalog: Catalog,
    caches: Caches,
    builder: Arc<MangaMobi>,
    delivery: Arc<dyn Delivery>,
    settings: BuildSettings,
}

/// Compiled volumes, still inside their staging directory.
struct Staged {
    volumes: Vec<Container>,
    documents: Vec<PathBuf>,
    dir: TempDir,
}
impl Staged {
    fn clean(self) {
        for volume in &self.volumes {
            if let Err(e) = volume.clean() {
                tracing::warn!(container = %volume.path().display(), error = ?e, "Staging container left unexpected content");
            }
        }
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            tracing::warn!(path = %path.display(), error = %e, "Could not remove staging directory");
        }
    }
}

impl Orchestrator {
    pub fn new(
        catalog: Catalog,
        caches: Caches,
        builder: MangaMobi,
        delivery: Arc<dyn Delivery>,
        settings: BuildSettings,
    ) -> Self {
        Self { catalog, caches, builder: Arc::new(builder), delivery, settings }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Builds (or reuses) the documents of `issue` and delivers them to
    /// `user`, recording the outcome in the catalog.
    ///
    /// Build and delivery failures are not errors: they're logged, stored
    /// on the delivery record, and reported as [`Status::Failed`]. Only a
    /// failure to update the catalog itself is returned.
    #[instrument(skip_all, fields(issue = %issue.url, user = %user.name))]
    pub async fn process(&self, issue: &Issue, user: &User) -> Result<Status> {
        self.set_status(issue, user, Status::Processing, None).await?;
        match self.run(issue, user).await {
            Ok(()) => {
                self.set_status(issue, user, Status::Sent, None).await?;
                tracing::info!("Issue delivered");
                Ok(Status::Sent)
            },
            Err(e) => {
                tracing::warn!(error = ?e, retryable = e.is_retryable(), "Issue not delivered");
                self.set_status(issue, user, Status::Failed, Some(&e.to_string())).await?;
                Ok(Status::Failed)
            },
        }
    }

    async fn set_status(&self, issue: &Issue, user: &User, status: Status, error: Option<&str>) -> Result<()> {
        self.catalog.set_status(issue.id, user.id, status, error).await.or_raise(|| ErrorKind::Catalog)
    }

    async fn run(&self, issue: &Issue, user: &User) -> Result<()> {
        let documents = match self.cached_documents(&issue.url).await? {
            Some(documents) => {
                tracing::debug!(documents = documents.len(), "Reusing cached documents");
                documents
            },
            None => self.build(issue).await?,
        };
        let subject = VolumeInfo::new(&issue_meta(issue), None).title;
        match tokio::time::timeout(self.settings.delivery_timeout, self.delivery.deliver(user, &subject, &documents))
            .await
        {
            Ok(delivered) => delivered,
            Err(_) => exn::bail!(ErrorKind::Timeout("delivery")),
        }
    }

    /// Cached documents of an issue. An entry whose blobs went missing is
    /// dropped so the issue gets rebuilt.
    async fn cached_documents(&self, url: &str) -> Result<Option<Vec<Document>>> {
        let Some(entry) = self.caches.documents.get(url).await.or_raise(|| ErrorKind::Cache)? else {
            return Ok(None);
        };
        for document in &entry.value {
            if !tokio::fs::try_exists(&document.path).await.or_raise(|| ErrorKind::Cache)? {
                tracing::warn!(issue = %url, blob = %document.path.display(), "Cached document missing, rebuilding");
                self.caches.documents.delete(url).await.or_raise(|| ErrorKind::Cache)?;
                return Ok(None);
            }
        }
        Ok(Some(entry.value))
    }

    /// Images of a cached issue, in reading order.
    async fn source_images(&self, url: &str) -> Result<Vec<PathBuf>> {
        let issues = &self.caches.issues;
        if !issues.is_valid(url).await.or_raise(|| ErrorKind::Cache)? {
            if issues.delete(url).await.or_raise(|| ErrorKind::Cache)? {
                tracing::warn!(issue = %url, "Dropped cached issue with missing images");
            }
            exn::bail!(ErrorKind::SourceMissing(url.to_string()));
        }
        let images = issues.images(url).await.or_raise(|| ErrorKind::Cache)?.unwrap_or_default();
        if images.is_empty() {
            exn::bail!(ErrorKind::SourceMissing(url.to_string()));
        }
        Ok(images)
    }

    #[instrument(skip_all, fields(issue = %issue.url))]
    async fn build(&self, issue: &Issue) -> Result<Vec<Document>> {
        let images = self.source_images(&issue.url).await?;
        let work_dir = &self.settings.work_dir;
        tokio::fs::create_dir_all(work_dir).await.or_raise(|| ErrorKind::Build)?;
        let dir = tempfile::Builder::new().prefix("kmanga-").tempdir_in(work_dir).or_raise(|| ErrorKind::Build)?;

        // The staging directory moves into the task and is removed before it
        // returns, whether the build succeeded, failed or ran out of time.
        let builder = Arc::clone(&self.builder);
        let settings = self.settings.clone();
        let meta = issue_meta(issue);
        let deadline = Instant::now() + self.settings.build_timeout;
        let task = tokio::task::spawn_blocking(move || stage(&builder, &settings, dir, &images, &meta, deadline));
        let staged = match task.await.or_raise(|| ErrorKind::Build)? {
            Ok(staged) => staged,
            Err(e) if matches!(&*e, MobiErrorKind::Timeout) => return Err(e.raise(ErrorKind::Timeout("build"))),
            Err(e) => return Err(e.raise(ErrorKind::Build)),
        };

        let stored = self.caches.documents.set(&issue.url, staged.documents.clone()).await;
        if let Err(e) = tokio::task::spawn_blocking(move || staged.clean()).await {
            tracing::warn!(error = %e, "Staging cleanup task failed");
        }
        stored.or_raise(|| ErrorKind::Cache)?;
        let documents = self
            .caches
            .documents
            .get(&issue.url)
            .await
            .or_raise(|| ErrorKind::Cache)?
            .ok_or_raise(|| ErrorKind::Cache)?
            .value;
        tracing::info!(volumes = documents.len(), "Issue built");
        Ok(documents)
    }
}

/// Stages `images` under `dir`, splits them into volumes no larger than the
/// byte budget and compiles each volume, giving up at `deadline`.
fn stage(
    builder: &MangaMobi,
    settings: &BuildSettings,
    dir: TempDir,
    images: &[PathBuf],
    meta: &IssueMeta,
    deadline: Instant,
) -> kmanga_mobi::error::Result<Staged> {
    let container = Container::new(dir.path().join("issue"), settings.resolution);
    container.create()?;
    if let Some(cover) = images.first() {
        container.set_cover(cover, settings.adjust, true)?;
    }
    container.add_images(images, settings.adjust, settings.filters, true)?;
    let volumes = container.split(settings.max_bytes)?;
    if volumes.len() > 1 {
        container.clean()?;
    }
    let total = volumes.len();
    let mut documents = Vec::with_capacity(total);
    for (index, volume) in volumes.iter().enumerate() {
        if Instant::now() >= deadline {
            exn::bail!(MobiErrorKind::Timeout);
        }
        let info = VolumeInfo::new(meta, (total > 1).then_some((index + 1, total)));
        let (_, path) = builder.create(volume, &info, Some(deadline))?;
        documents.push(path);
    }
    Ok(Staged { volumes, documents, dir })
}

fn issue_meta(issue: &Issue) -> IssueMeta {
    let direction = issue.manga.direction.parse().unwrap_or_else(|e| {
        tracing::warn!(manga = %issue.manga.url, error = %e, "Falling back to left-to-right reading");
        Direction::default()
    });
    IssueMeta {
        manga: issue.manga.name.clone(),
        name: issue.name.clone(),
        number: issue.number.clone(),
        language: issue.language.clone(),
        author: issue.manga.author.clone(),
        publisher: issue.manga.source.clone(),
        direction,
        identifier: issue.url.clone(),
    }
}
