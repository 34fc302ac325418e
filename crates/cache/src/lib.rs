//! Process-safe caches for "has this unit of work already been produced".
//!
//! Two caches share one engine:
//! - **[`IssueCache`]**: per issue URL, the downloaded page images. An entry
//!   is only valid while every referenced image still exists on disk.
//! - **[`DocumentCache`]**: per issue URL, the documents built from it,
//!   hard-linked into a content store owned by the cache.
//!
//! # Architecture
//! - [`ProcessLock`]: reentrant (per process) advisory file lock.
//! - [`DurableStore`]: SQLite index opened by at most one process at a time,
//!   reference counted within a process.
//! - [`Cache`]: timestamped mapping with TTL ([`Cache::clean`]) and size
//!   ([`Cache::free`]) eviction, specialized through a [`Policy`].

mod cache;
mod db;
pub mod document;
pub mod error;
pub mod issue;
mod lock;
mod models;
mod path;
mod store;
mod table;

pub use crate::cache::{Cache, CacheConfig, Entry, Policy};
pub use crate::document::{ContentStore, Document, DocumentCache};
pub use crate::issue::{IssueCache, IssueImages, Page};
pub use crate::lock::{LockGuard, ProcessLock};
pub use crate::path::validate as validate_path;
pub use crate::store::{DurableStore, StoreGuard};
pub use crate::table::Table;
