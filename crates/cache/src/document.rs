//! Cache of built documents, keyed by issue URL, with a content store.
//!
//! The index only records `(display name, blob path)` pairs. The documents
//! themselves live in the `data/` directory next to the index as hard links
//! named `<blake3(key)>-<NN>`. The cache owns those links: they're created by
//! [`set`](crate::Cache::set) from caller-supplied files and removed whenever
//! their entry is overwritten or evicted. The caller's own files are never
//! touched and remain the caller's responsibility.

use crate::cache::{Cache, CacheConfig, Policy};
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG: CacheConfig = CacheConfig { max_slots: 1024, evict_batch: 128 };

/// A cached document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// File name the document was built under; use this, not the blob path,
    /// when presenting the document.
    pub name: String,
    /// Location inside the content store.
    pub path: PathBuf,
}

/// [`Policy`] that links documents into a content store it owns.
pub struct ContentStore {
    data: PathBuf,
}
impl ContentStore {
    pub fn new(data: impl Into<PathBuf>) -> Self {
        Self { data: data.into() }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data
    }

    /// Deterministic blob location for the `index`-th document of `key`.
    pub fn blob_path(&self, key: &str, index: usize) -> PathBuf {
        self.data.join(format!("{}-{index:02}", blake3::hash(key.as_bytes()).to_hex()))
    }

    async fn unlink(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Cached document already missing from content store");
                Ok(())
            },
            Err(e) => Err(e).or_raise(|| ErrorKind::Io(path.to_path_buf())),
        }
    }

    /// Unlinks the blobs of a partially linked entry, carrying on past failures.
    async fn rollback(documents: &[Document]) {
        for document in documents {
            if let Err(e) = Self::unlink(&document.path).await {
                tracing::warn!(path = %document.path.display(), error = ?e, "Could not roll back linked document");
            }
        }
    }
}

#[async_trait]
impl Policy for ContentStore {
    type Input = Vec<PathBuf>;
    type Value = Vec<Document>;

    async fn prepare(&self, key: &str, sources: Vec<PathBuf>) -> Result<Vec<Document>> {
        tokio::fs::create_dir_all(&self.data).await.or_raise(|| ErrorKind::Io(self.data.clone()))?;
        let mut documents: Vec<Document> = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let blob = self.blob_path(key, index);
            let linked = async {
                let name = source
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_raise(|| ErrorKind::InvalidPath(source.clone()))?
                    .to_string();
                // Left behind by a crash between linking and indexing; nothing
                // in the index refers to it.
                if tokio::fs::try_exists(&blob).await.or_raise(|| ErrorKind::Io(blob.clone()))? {
                    Self::unlink(&blob).await?;
                }
                tokio::fs::hard_link(source, &blob).await.or_raise(|| ErrorKind::Io(source.clone()))?;
                Ok::<_, crate::error::Error>(name)
            }
            .await;
            match linked {
                Ok(name) => documents.push(Document { name, path: blob }),
                Err(e) => {
                    Self::rollback(&documents).await;
                    return Err(e);
                },
            }
        }
        tracing::debug!(key = %key, documents = documents.len(), "Documents linked into content store");
        Ok(documents)
    }

    async fn on_delete(&self, _key: &str, documents: &Vec<Document>) -> Result<()> {
        for document in documents {
            Self::unlink(&document.path).await?;
        }
        Ok(())
    }
}

/// Built-document cache. See [`ContentStore`].
pub type DocumentCache = Cache<ContentStore>;

impl Cache<ContentStore> {
    /// Document cache with its index at `index` and its content store in the
    /// `data/` directory beside it.
    pub fn with_content_store(index: impl AsRef<Path>, config: CacheConfig) -> Self {
        let index = index.as_ref();
        let data = index.parent().unwrap_or_else(|| Path::new(".")).join("data");
        Cache::new(index, ContentStore::new(data), config)
    }
}
