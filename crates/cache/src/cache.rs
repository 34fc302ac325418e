//! Generic cache engine over a [`DurableStore`].
//!
//! A [`Cache`] wraps every value with its write time and adds TTL-based
//! ([`clean`](Cache::clean)) and size-based ([`free`](Cache::free)) eviction.
//! What a cache *stores* and what happens around a write or an eviction is
//! decided by its [`Policy`]; [`IssueCache`](crate::IssueCache) and
//! [`DocumentCache`](crate::DocumentCache) are two such configurations.

use crate::error::{ErrorKind, Result};
use crate::models::RawEntry;
use crate::store::DurableStore;
use crate::table::Table;
use async_trait::async_trait;
use exn::ResultExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use time::UtcDateTime;
use tracing::instrument;

/// Eviction thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// [`free`](Cache::free) does nothing until the cache holds more entries
    /// than this.
    pub max_slots: u64,
    /// Number of entries (oldest first) removed by one [`free`](Cache::free).
    pub evict_batch: u64,
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_slots: 4096, evict_batch: 1024 }
    }
}

/// Hooks that specialize a [`Cache`].
///
/// `Input` is what callers hand to [`Cache::set`]; [`prepare`](Self::prepare)
/// turns it into the `Value` that is serialized into the index. Every path
/// that removes an entry (overwrite, delete, clean, free) calls
/// [`on_delete`](Self::on_delete) with the old value first.
#[async_trait]
pub trait Policy: Send + Sync {
    type Input: Send;
    type Value: Serialize + DeserializeOwned + Send + Sync;

    async fn prepare(&self, key: &str, input: Self::Input) -> Result<Self::Value>;

    async fn on_delete(&self, _key: &str, _value: &Self::Value) -> Result<()> {
        Ok(())
    }

    /// Whether a stored value can still be used. Checked without mutating the
    /// cache; callers decide what to do with an invalid entry.
    async fn is_valid(&self, _value: &Self::Value) -> Result<bool> {
        Ok(true)
    }
}

/// A cached value and the time it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<V> {
    pub value: V,
    pub created_at: UtcDateTime,
}

/// Mapping from string keys to timestamped values, safe to share between
/// processes.
///
/// Every operation opens the underlying [`DurableStore`] for its duration,
/// so operations from different processes are serialized, never interleaved.
pub struct Cache<P: Policy> {
    store: DurableStore,
    policy: P,
    config: CacheConfig,
}
impl<P: Policy> Cache<P> {
    pub fn new(index: impl AsRef<Path>, policy: P, config: CacheConfig) -> Self {
        Self { store: DurableStore::new(index), policy, config }
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    fn decode(raw: RawEntry) -> Result<Entry<P::Value>> {
        let value = serde_json::from_str(&raw.value).or_raise(|| ErrorKind::InvalidData("value"))?;
        Ok(Entry { value, created_at: raw.created_at })
    }

    async fn read(table: &Table, key: &str) -> Result<Option<Entry<P::Value>>> {
        table.get(key).await?.map(Self::decode).transpose()
    }

    /// Runs the delete hook and removes the row. Table must already be open.
    async fn evict(&self, table: &Table, key: &str) -> Result<bool> {
        match Self::read(table, key).await? {
            Some(old) => {
                self.policy.on_delete(key, &old.value).await?;
                table.remove(key).await
            },
            None => Ok(false),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Entry<P::Value>>> {
        let table = self.store.scoped().await?;
        Self::read(&table, key).await
    }

    /// Stores a value, stamped with the current UTC time.
    ///
    /// An existing entry for `key` is fully evicted first, so whatever its
    /// delete hook owned is gone before the new value is prepared.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn set(&self, key: &str, input: P::Input) -> Result<()> {
        let table = self.store.scoped().await?;
        if self.evict(&table, key).await? {
            tracing::debug!("Replaced existing cache entry");
        }
        let value = self.policy.prepare(key, input).await?;
        let encoded = serde_json::to_string(&value).or_raise(|| ErrorKind::InvalidData("value"))?;
        table.put(key, &encoded, UtcDateTime::now()).await
    }

    /// Returns `true` if an entry was removed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let table = self.store.scoped().await?;
        self.evict(&table, key).await
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        let table = self.store.scoped().await?;
        Ok(table.get(key).await?.is_some())
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        let table = self.store.scoped().await?;
        table.keys().await
    }

    pub async fn len(&self) -> Result<u64> {
        let table = self.store.scoped().await?;
        table.len().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Every key with its write time, oldest first.
    pub async fn entries(&self) -> Result<Vec<(String, UtcDateTime)>> {
        let table = self.store.scoped().await?;
        table.by_age().await
    }

    /// `false` if the key is absent or the policy rejects the stored value.
    pub async fn is_valid(&self, key: &str) -> Result<bool> {
        match self.get(key).await? {
            Some(entry) => self.policy.is_valid(&entry.value).await,
            None => Ok(false),
        }
    }

    /// Removes every entry older than `ttl_seconds`, measured in whole
    /// seconds. An entry exactly `ttl_seconds` old is kept.
    ///
    /// Returns the number of entries removed.
    #[instrument(skip(self))]
    pub async fn clean(&self, ttl_seconds: u64) -> Result<u64> {
        let table = self.store.scoped().await?;
        let now = UtcDateTime::now();
        let ttl = i64::try_from(ttl_seconds).unwrap_or(i64::MAX);
        let mut removed = 0;
        for (key, created_at) in table.by_age().await? {
            if (now - created_at).whole_seconds() > ttl && self.evict(&table, &key).await? {
                removed += 1;
            }
        }
        tracing::info!(removed, "Expired cache entries cleaned");
        Ok(removed)
    }

    /// Removes the `evict_batch` oldest entries, but only once the cache
    /// holds more than `max_slots`.
    ///
    /// Returns the number of entries removed.
    #[instrument(skip(self))]
    pub async fn free(&self) -> Result<u64> {
        let table = self.store.scoped().await?;
        let len = table.len().await?;
        if len <= self.config.max_slots {
            return Ok(0);
        }
        let mut removed = 0;
        for key in table.oldest(self.config.evict_batch).await? {
            if self.evict(&table, &key).await? {
                removed += 1;
            }
        }
        tracing::info!(len, removed, "Cache slots freed");
        Ok(removed)
    }
}
