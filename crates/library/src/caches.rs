use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use kmanga_cache::{CacheConfig, DocumentCache, IssueCache};
use kmanga_config::Config;

/// The two caches a build reads from and writes to.
pub struct Caches {
    pub issues: IssueCache,
    pub documents: DocumentCache,
}

/// Entries removed from each cache by a maintenance pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Removed {
    pub issues: u64,
    pub documents: u64,
}

impl Caches {
    pub fn new(issues: IssueCache, documents: DocumentCache) -> Self {
        Self { issues, documents }
    }

    pub fn from_config(config: &Config) -> Self {
        let slots = |s: &kmanga_config::SlotsConfig| CacheConfig { max_slots: s.max_slots, evict_batch: s.evict_batch };
        Self {
            issues: IssueCache::with_images(
                config.cache.issue_index(),
                config.images.root.clone(),
                slots(&config.cache.issue),
            ),
            documents: DocumentCache::with_content_store(config.cache.document_index(), slots(&config.cache.document)),
        }
    }

    /// Drops entries older than `ttl_seconds` from both caches.
    pub async fn clean(&self, ttl_seconds: u64) -> Result<Removed> {
        Ok(Removed {
            issues: self.issues.clean(ttl_seconds).await.or_raise(|| ErrorKind::Cache)?,
            documents: self.documents.clean(ttl_seconds).await.or_raise(|| ErrorKind::Cache)?,
        })
    }

    /// Evicts the oldest entries of each cache that is over its slot limit.
    pub async fn free(&self) -> Result<Removed> {
        Ok(Removed {
            issues: self.issues.free().await.or_raise(|| ErrorKind::Cache)?,
            documents: self.documents.free().await.or_raise(|| ErrorKind::Cache)?,
        })
    }
}
