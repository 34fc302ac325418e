//! Catalog of mangas, issues and users, and the delivery status of every
//! issue sent to a user.
//!
//! Crawling populates mangas and issues; the build orchestrator only reads
//! them, and records per-(issue, user) progress through
//! `PENDING → PROCESSING → SENT | FAILED`.

mod catalog;
mod db;
pub mod error;
mod models;

pub use crate::catalog::Catalog;
pub use crate::db::Database;
pub use crate::models::{Delivery, Issue, Manga, NewIssue, NewManga, NewUser, Status, User};
