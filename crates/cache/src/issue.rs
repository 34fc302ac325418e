//! Cache of downloaded issue pages, keyed by issue URL.
//!
//! Each entry lists the issue's pages in reading order; a page references
//! its image relative to the image store root. Images live outside the cache
//! and can be reaped by an external sweeper, so an entry is only usable while
//! every image it references still exists.

use crate::cache::{Cache, CacheConfig, Policy};
use crate::error::{ErrorKind, Result};
use crate::path::validate as validate_path;
use async_trait::async_trait;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::fs::{FileTimes, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const DEFAULT_CONFIG: CacheConfig = CacheConfig { max_slots: 4096, evict_batch: 1024 };

/// One page of an issue. `image` is `None` when the page had no image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub image: Option<PathBuf>,
}
impl Page {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self { image: Some(image.into()) }
    }

    pub fn blank() -> Self {
        Self { image: None }
    }
}

/// [`Policy`] for the issue cache: paths are normalized on write and their
/// files touched, and an entry is valid only while all its images exist.
pub struct IssueImages {
    root: PathBuf,
}
impl IssueImages {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of an image referenced by a page.
    pub fn resolve(&self, image: impl AsRef<Path>) -> Result<PathBuf> {
        Ok(self.root.join(validate_path(image)?))
    }
}

/// Resets access and modification time so an age-based image sweeper keeps
/// images still referenced by a fresh entry.
fn touch(path: &Path, now: SystemTime) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_times(FileTimes::new().set_accessed(now).set_modified(now))
}

#[async_trait]
impl Policy for IssueImages {
    type Input = Vec<Page>;
    type Value = Vec<Page>;

    async fn prepare(&self, key: &str, pages: Vec<Page>) -> Result<Vec<Page>> {
        let mut normalized = Vec::with_capacity(pages.len());
        let mut absolute = Vec::new();
        for page in pages {
            match page.image {
                Some(image) => {
                    let image = validate_path(image)?;
                    absolute.push(self.root.join(&image));
                    normalized.push(Page::new(image));
                },
                None => normalized.push(Page::blank()),
            }
        }
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let now = SystemTime::now();
            for path in absolute {
                if let Err(e) = touch(&path, now) {
                    tracing::warn!(key = %key, path = %path.display(), error = %e, "Could not touch cached image");
                }
            }
        })
        .await
        .or_raise(|| ErrorKind::Io(self.root.clone()))?;
        Ok(normalized)
    }

    async fn is_valid(&self, pages: &Vec<Page>) -> Result<bool> {
        for image in pages.iter().filter_map(|p| p.image.as_ref()) {
            let Ok(path) = self.resolve(image) else {
                return Ok(false);
            };
            if !tokio::fs::try_exists(&path).await.or_raise(|| ErrorKind::Io(path.clone()))? {
                tracing::debug!(path = %path.display(), "Cached image no longer exists");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Downloaded-issue cache. See [`IssueImages`].
pub type IssueCache = Cache<IssueImages>;

impl Cache<IssueImages> {
    /// Issue cache with its index at `index`, resolving images under
    /// `images_root`.
    pub fn with_images(index: impl AsRef<Path>, images_root: impl Into<PathBuf>, config: CacheConfig) -> Self {
        Cache::new(index, IssueImages::new(images_root), config)
    }

    /// Absolute image paths of a cached issue, in reading order, skipping
    /// pages without an image. `None` if the issue isn't cached.
    pub async fn images(&self, key: &str) -> Result<Option<Vec<PathBuf>>> {
        let Some(entry) = self.get(key).await? else {
            return Ok(None);
        };
        let images = entry
            .value
            .iter()
            .filter_map(|p| p.image.as_ref())
            .map(|image| self.policy().resolve(image))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(images))
    }

    /// Deletes every entry that references a missing image.
    ///
    /// Returns the purged keys.
    pub async fn purge_invalid(&self) -> Result<Vec<String>> {
        let _table = self.store().scoped().await?;
        let mut purged = Vec::new();
        for key in self.keys().await? {
            if !self.is_valid(&key).await? {
                self.delete(&key).await?;
                purged.push(key);
            }
        }
        tracing::info!(purged = purged.len(), "Invalid issue entries purged");
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        cache: IssueCache,
    }
    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("images/full")).unwrap();
            let cache = IssueCache::with_images(dir.path().join("issue.db"), dir.path().join("images"), DEFAULT_CONFIG);
            Self { dir, cache }
        }

        fn image(&self, name: &str) -> PathBuf {
            let relative = PathBuf::from("full").join(name);
            std::fs::write(self.dir.path().join("images").join(&relative), b"jpeg").unwrap();
            relative
        }
    }

    #[tokio::test]
    async fn test_valid_entry() {
        let fx = Fixture::new();
        let pages = vec![Page::new(fx.image("a.jpg")), Page::blank(), Page::new(fx.image("b.jpg"))];
        fx.cache.set("https://example.com/issue/1", pages.clone()).await.unwrap();
        assert!(fx.cache.is_valid("https://example.com/issue/1").await.unwrap());
        let entry = fx.cache.get("https://example.com/issue/1").await.unwrap().unwrap();
        assert_eq!(entry.value, pages);
    }

    #[tokio::test]
    async fn test_missing_key_is_invalid() {
        let fx = Fixture::new();
        assert!(!fx.cache.is_valid("https://example.com/issue/404").await.unwrap());
    }

    #[tokio::test]
    async fn test_deleted_image_invalidates_without_mutation() {
        let fx = Fixture::new();
        let image = fx.image("a.jpg");
        fx.cache.set("issue", vec![Page::new(&image)]).await.unwrap();
        let before = fx.cache.get("issue").await.unwrap().unwrap();
        std::fs::remove_file(fx.dir.path().join("images").join(&image)).unwrap();
        assert!(!fx.cache.is_valid("issue").await.unwrap());
        // Validity checks never touch the entry itself.
        assert_eq!(fx.cache.get("issue").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_set_touches_images() {
        let fx = Fixture::new();
        let image = fx.image("a.jpg");
        let absolute = fx.dir.path().join("images").join(&image);
        let old = SystemTime::now() - Duration::from_secs(30 * 24 * 3600);
        std::fs::File::options()
            .write(true)
            .open(&absolute)
            .unwrap()
            .set_times(FileTimes::new().set_accessed(old).set_modified(old))
            .unwrap();
        let before = SystemTime::now() - Duration::from_secs(1);
        fx.cache.set("issue", vec![Page::new(&image)]).await.unwrap();
        let modified = std::fs::metadata(&absolute).unwrap().modified().unwrap();
        assert!(modified >= before);
    }

    #[tokio::test]
    async fn test_paths_escaping_root_are_rejected() {
        let fx = Fixture::new();
        let err = fx.cache.set("issue", vec![Page::new("../../etc/passwd")]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
        assert!(!fx.cache.contains("issue").await.unwrap());
    }

    #[tokio::test]
    async fn test_images_resolves_in_order() {
        let fx = Fixture::new();
        let a = fx.image("a.jpg");
        let b = fx.image("b.jpg");
        fx.cache.set("issue", vec![Page::new(&b), Page::blank(), Page::new(&a)]).await.unwrap();
        let images = fx.cache.images("issue").await.unwrap().unwrap();
        let root = fx.dir.path().join("images");
        assert_eq!(images, vec![root.join(&b), root.join(&a)]);
        assert!(fx.cache.images("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_invalid() {
        let fx = Fixture::new();
        let a = fx.image("a.jpg");
        let b = fx.image("b.jpg");
        fx.cache.set("keep", vec![Page::new(&a)]).await.unwrap();
        fx.cache.set("drop", vec![Page::new(&b)]).await.unwrap();
        std::fs::remove_file(fx.dir.path().join("images").join(&b)).unwrap();
        assert_eq!(fx.cache.purge_invalid().await.unwrap(), vec!["drop"]);
        assert_eq!(fx.cache.keys().await.unwrap(), vec!["keep"]);
        assert!(!fx.cache.store().is_open());
    }
}
