//! Validation of image paths stored in cache entries.
//!
//! Issue entries reference downloaded images relative to the image store
//! root. A stored path must never resolve outside that root.

use crate::error::{ErrorKind, Result};
use std::path::{Component, Path, PathBuf};

/// Normalizes a path relative to the image store root.
///
/// `.` components and redundant separators are dropped and `..` is resolved
/// lexically. Absolute paths, null bytes, and paths that leave the root (or
/// normalize to nothing) are rejected with [`ErrorKind::InvalidPath`].
///
/// ```
/// use std::path::Path;
/// use kmanga_cache::validate_path;
/// assert_eq!(validate_path("full/ab/cdef.jpg").unwrap(), Path::new("full/ab/cdef.jpg"));
/// assert_eq!(validate_path("full/./x/../cdef.jpg").unwrap(), Path::new("full/cdef.jpg"));
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("/etc/passwd").is_err());
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let original = path.as_ref();
    let invalid = || ErrorKind::InvalidPath(original.to_path_buf());
    let mut components = Vec::new();
    for component in original.components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but
                // truncate in C-based syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(invalid());
                }
                components.push(s);
            },
            Component::CurDir => {},
            Component::RootDir | Component::Prefix(_) => exn::bail!(invalid()),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(invalid());
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(invalid()),
        false => Ok(components.into_iter().collect()),
    }
}
