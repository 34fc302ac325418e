//! Build orchestration: cached issues in, delivered documents out.
//!
//! An [`Orchestrator`] takes (issue, user) [`Job`]s, selected with
//! [`send_jobs`](Orchestrator::send_jobs),
//! [`daily_jobs`](Orchestrator::daily_jobs) or
//! [`retry_jobs`](Orchestrator::retry_jobs), and streams their outcomes from
//! [`batch`](Orchestrator::batch). Each job reuses the documents already in
//! the document cache, or builds them from the issue cache, then hands them
//! to a [`Delivery`].

mod batch;
mod caches;
pub mod delivery;
pub mod error;
mod orchestrator;
mod plan;
mod settings;

pub use crate::batch::{BatchEvent, MAX_CONCURRENT_ISSUES, Outcome};
pub use crate::caches::{Caches, Removed};
pub use crate::delivery::{Delivery, OutboxDelivery};
pub use crate::orchestrator::Orchestrator;
pub use crate::plan::Job;
pub use crate::settings::BuildSettings;
