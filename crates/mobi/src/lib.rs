//! Kindle document building for manga issues.
//!
//! An issue's page images are staged into a [`Container`], optionally split
//! into several containers under a size budget, and each container is
//! compiled into a MOBI document by [`MangaMobi`] using kindlegen. Titles and
//! file names of the volumes are derived by [`VolumeInfo`].

mod adjust;
mod assets;
mod builder;
mod container;
pub mod error;
mod kindlegen;
mod manifest;
mod strip;
mod title;

pub use crate::adjust::{Adjust, Filters, Resolution};
pub use crate::builder::MangaMobi;
pub use crate::container::Container;
pub use crate::kindlegen::Kindlegen;
pub use crate::strip::strip_srcs;
pub use crate::title::{Direction, IssueMeta, VolumeInfo, display_name, format_number, subtitle, title};
