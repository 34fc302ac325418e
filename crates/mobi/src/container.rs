//! Staging directory for one document.
//!
//! Layout:
//!
//! ```text
//! <path>/
//!   cover.<ext>      optional
//!   images/NNN.<ext> pages, in reading order
//!   html/NNN.html    one descriptor per page (written by the builder)
//!   style.css, content.opf, toc.ncx
//!   *.mobi           compiler output
//! ```

use crate::error::{ErrorKind, Result};
use crate::adjust::{Adjust, Filters, Resolution};
use exn::ResultExt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::instrument;

pub(crate) const IMAGES: &str = "images";
pub(crate) const HTML: &str = "html";
const COVER: &str = "cover";
/// Files the builder writes at the top level.
const DESCRIPTORS: [&str; 3] = ["content.opf", "toc.ncx", "style.css"];
/// Extensions the compiler accepts as-is.
const NATIVE_FORMATS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    path: PathBuf,
    resolution: Resolution,
}

impl Container {
    pub fn new(path: impl Into<PathBuf>, resolution: Resolution) -> Self {
        Self { path: path.into(), resolution }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn io(&self) -> impl Fn() -> ErrorKind + '_ {
        || ErrorKind::Io(self.path.clone())
    }

    /// Creates the staging directory. Fails with
    /// [`ErrorKind::ContainerExists`] if it already holds anything.
    pub fn create(&self) -> Result<()> {
        if self.path.exists() {
            let mut entries = fs::read_dir(&self.path).or_raise(self.io())?;
            if entries.next().is_some() {
                exn::bail!(ErrorKind::ContainerExists(self.path.clone()));
            }
        }
        fs::create_dir_all(self.path.join(IMAGES)).or_raise(self.io())?;
        Ok(())
    }

    /// Appends `images` as pages, in order.
    ///
    /// Images in a format the compiler accepts are linked (`as_link`) or
    /// copied verbatim when no adjustment or filter applies. Anything else is
    /// decoded, transformed, and re-encoded; formats the compiler can't read
    /// are converted to JPEG.
    #[instrument(skip_all, fields(container = %self.path.display()))]
    pub fn add_images<I, P>(&self, images: I, adjust: Adjust, filters: Filters, as_link: bool) -> Result<Vec<PathBuf>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut next = self.pages()?.len();
        let mut added = Vec::new();
        for image in images {
            let image = image.as_ref();
            let dest = self.path.join(IMAGES).join(format!("{next:03}.{}", staged_extension(image)));
            self.stage(image, &dest, adjust, filters, as_link)?;
            added.push(dest);
            next += 1;
        }
        tracing::debug!(added = added.len(), pages = next, "Images added to container");
        Ok(added)
    }

    /// Sets the cover image, replacing any previous one.
    pub fn set_cover(&self, image: impl AsRef<Path>, adjust: Adjust, as_link: bool) -> Result<PathBuf> {
        let image = image.as_ref();
        if let Some(previous) = self.cover()? {
            fs::remove_file(&previous).or_raise(|| ErrorKind::Io(previous.clone()))?;
        }
        let dest = self.path.join(format!("{COVER}.{}", staged_extension(image)));
        self.stage(image, &dest, adjust, Filters::default(), as_link)?;
        Ok(dest)
    }

    fn stage(&self, source: &Path, dest: &Path, adjust: Adjust, filters: Filters, as_link: bool) -> Result<()> {
        let verbatim = adjust == Adjust::None && filters.is_empty() && is_native(source);
        match (verbatim, as_link) {
            (true, true) => fs::hard_link(source, dest).or_raise(|| ErrorKind::Io(source.to_path_buf())),
            (true, false) => fs::copy(source, dest).map(|_| ()).or_raise(|| ErrorKind::Io(source.to_path_buf())),
            (false, _) => crate::adjust::process(source, dest, adjust, filters, self.resolution),
        }
    }

    /// Staged page images in reading order.
    pub fn pages(&self) -> Result<Vec<PathBuf>> {
        let dir = self.path.join(IMAGES);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut pages: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir).or_raise(|| ErrorKind::Io(dir.clone()))? {
            let path = entry.or_raise(|| ErrorKind::Io(dir.clone()))?.path();
            if let Some(sequence) = sequence(&path) {
                pages.push((sequence, path));
            }
        }
        pages.sort();
        Ok(pages.into_iter().map(|(_, p)| p).collect())
    }

    pub fn cover(&self) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        for entry in fs::read_dir(&self.path).or_raise(self.io())? {
            let path = entry.or_raise(self.io())?.path();
            if path.is_file() && path.file_stem().is_some_and(|s| s == COVER) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Total size in bytes of everything in the container.
    pub fn get_size(&self) -> Result<u64> {
        dir_size(&self.path)
    }

    /// Partitions the pages, in order, into sibling containers
    /// `<path>_01`, `<path>_02`, … each no larger than `max_bytes`.
    ///
    /// Every sub-container gets a copy of the cover, which counts toward the
    /// budget. A page too large to share a container is placed alone. If
    /// everything already fits, the container itself is returned.
    #[instrument(skip(self), fields(container = %self.path.display()))]
    pub fn split(&self, max_bytes: u64) -> Result<Vec<Container>> {
        let pages = self.pages()?;
        if pages.is_empty() {
            exn::bail!(ErrorKind::NoPages(self.path.clone()));
        }
        let cover = self.cover()?;
        let cover_size = match &cover {
            Some(cover) => file_size(cover)?,
            None => 0,
        };
        let mut groups: Vec<Vec<PathBuf>> = Vec::new();
        let mut current: Vec<PathBuf> = Vec::new();
        let mut current_size = cover_size;
        for page in pages {
            let size = file_size(&page)?;
            if !current.is_empty() && current_size + size > max_bytes {
                groups.push(std::mem::take(&mut current));
                current_size = cover_size;
            }
            current_size += size;
            current.push(page);
        }
        groups.push(current);
        if groups.len() == 1 {
            return Ok(vec![self.clone()]);
        }

        let mut containers = Vec::with_capacity(groups.len());
        for (index, group) in groups.into_iter().enumerate() {
            let mut path = self.path.clone().into_os_string();
            path.push(format!("_{:02}", index + 1));
            let container = Container::new(path, self.resolution);
            container.create()?;
            if let Some(cover) = &cover {
                container.set_cover(cover, Adjust::None, true)?;
            }
            container.add_images(&group, Adjust::None, Filters::default(), true)?;
            containers.push(container);
        }
        tracing::info!(volumes = containers.len(), max_bytes, "Container split");
        Ok(containers)
    }

    /// Removes the container. Refuses, leaving everything in place, if it
    /// holds anything other than what a container or the builder creates.
    /// Cleaning a container that doesn't exist is a no-op.
    pub fn clean(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.path).or_raise(self.io())? {
            let path = entry.or_raise(self.io())?.path();
            if !is_expected(&path) {
                exn::bail!(ErrorKind::UnexpectedContent(path));
            }
        }
        fs::remove_dir_all(&self.path).or_raise(self.io())?;
        tracing::debug!(container = %self.path.display(), "Container cleaned");
        Ok(())
    }
}

fn is_expected(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if path.is_dir() {
        return (name == IMAGES || name == HTML)
            && fs::read_dir(path).is_ok_and(|entries| entries.flatten().all(|e| e.path().is_file()));
    }
    DESCRIPTORS.contains(&name)
        || path.file_stem().is_some_and(|s| s == COVER)
        || path.extension().is_some_and(|e| e.eq_ignore_ascii_case("mobi"))
}

fn is_native(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| NATIVE_FORMATS.iter().any(|f| f.eq_ignore_ascii_case(e)))
}

/// Extension of an image once staged.
fn staged_extension(source: &Path) -> String {
    match is_native(source) {
        true => source.extension().and_then(|e| e.to_str()).unwrap_or("jpg").to_ascii_lowercase(),
        false => "jpg".to_string(),
    }
}

/// Page number encoded in a staged image's file stem.
fn sequence(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

fn file_size(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path).or_raise(|| ErrorKind::Io(path.to_path_buf()))?.len())
}

fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path).or_raise(|| ErrorKind::Io(path.to_path_buf()))? {
        let entry = entry.or_raise(|| ErrorKind::Io(path.to_path_buf()))?;
        let metadata = entry.metadata().or_raise(|| ErrorKind::Io(entry.path()))?;
        total += match metadata.is_dir() {
            true => dir_size(&entry.path())?,
            false => metadata.len(),
        };
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    struct Fixture {
        dir: tempfile::TempDir,
        container: Container,
    }
    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let container = Container::new(dir.path().join("issue"), Resolution::default());
            container.create().unwrap();
            Self { dir, container }
        }

        /// Source "images" of the given sizes. Verbatim staging never decodes.
        fn sources(&self, sizes: &[usize]) -> Vec<PathBuf> {
            let sources = self.dir.path().join("sources");
            fs::create_dir_all(&sources).unwrap();
            sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| {
                    let path = sources.join(format!("{i}.jpg"));
                    fs::write(&path, vec![i as u8; size]).unwrap();
                    path
                })
                .collect()
        }
    }

    #[test]
    fn test_create_refuses_existing_content() {
        let fx = Fixture::new();
        // Empty existing directories are fine.
        let empty = Container::new(fx.dir.path().join("empty"), Resolution::default());
        fs::create_dir(empty.path()).unwrap();
        empty.create().unwrap();
        let err = fx.container.create().unwrap_err();
        assert!(matches!(&*err, ErrorKind::ContainerExists(_)));
    }

    #[test]
    fn test_add_images_in_order() {
        let fx = Fixture::new();
        let sources = fx.sources(&[10, 20, 30]);
        fx.container.add_images(&sources[..2], Adjust::None, Filters::default(), false).unwrap();
        fx.container.add_images(&sources[2..], Adjust::None, Filters::default(), true).unwrap();
        let pages = fx.container.pages().unwrap();
        let names: Vec<_> = pages.iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(names, vec!["000.jpg", "001.jpg", "002.jpg"]);
        assert_eq!(fs::read(&pages[1]).unwrap(), fs::read(&sources[1]).unwrap());
        assert_eq!(fx.container.get_size().unwrap(), 60);
    }

    #[test]
    fn test_pages_sort_numerically() {
        let fx = Fixture::new();
        let sources = fx.sources(&[1; 1001]);
        fx.container.add_images(&sources, Adjust::None, Filters::default(), true).unwrap();
        let pages = fx.container.pages().unwrap();
        assert_eq!(pages.len(), 1001);
        assert!(pages[999].ends_with("999.jpg"));
        assert!(pages[1000].ends_with("1000.jpg"));
    }

    #[test]
    fn test_set_cover_replaces() {
        let fx = Fixture::new();
        let sources = fx.sources(&[5, 7]);
        fx.container.set_cover(&sources[0], Adjust::None, false).unwrap();
        let cover = fx.container.set_cover(&sources[1], Adjust::None, false).unwrap();
        assert_eq!(fx.container.cover().unwrap(), Some(cover));
        assert_eq!(fx.container.get_size().unwrap(), 7);
    }

    #[rstest]
    #[case(&[10, 10, 10, 10], 100, 1)]
    #[case(&[10, 10, 10, 10], 20, 2)]
    #[case(&[10, 10, 10, 10], 25, 2)]
    #[case(&[10, 50, 10], 20, 3)]
    #[case(&[50, 10, 10], 20, 2)]
    #[case(&[10, 10, 10], 5, 3)]
    fn test_split_budget(#[case] sizes: &[usize], #[case] budget: u64, #[case] volumes: usize) {
        let fx = Fixture::new();
        let sources = fx.sources(sizes);
        fx.container.add_images(&sources, Adjust::None, Filters::default(), true).unwrap();
        let containers = fx.container.split(budget).unwrap();
        assert_eq!(containers.len(), volumes);
        let mut all = Vec::new();
        for container in &containers {
            let pages = container.pages().unwrap();
            assert!(!pages.is_empty());
            // Only a lone page may exceed the budget.
            assert!(container.get_size().unwrap() <= budget || pages.len() == 1);
            all.extend(pages.iter().map(|p| fs::read(p).unwrap()));
        }
        let expected: Vec<_> = sources.iter().map(|p| fs::read(p).unwrap()).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_split_names_and_cover() {
        let fx = Fixture::new();
        let sources = fx.sources(&[4, 10, 10]);
        fx.container.set_cover(&sources[0], Adjust::None, true).unwrap();
        fx.container.add_images(&sources[1..], Adjust::None, Filters::default(), true).unwrap();
        let containers = fx.container.split(15).unwrap();
        let names: Vec<_> = containers.iter().map(|c| c.path().file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(names, vec!["issue_01", "issue_02"]);
        for container in &containers {
            assert!(container.cover().unwrap().is_some());
            assert_eq!(container.get_size().unwrap(), 14);
        }
    }

    #[test]
    fn test_split_empty() {
        let fx = Fixture::new();
        let err = fx.container.split(10).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NoPages(_)));
    }

    #[test]
    fn test_clean_is_idempotent() {
        let fx = Fixture::new();
        fx.container.add_images(fx.sources(&[3]), Adjust::None, Filters::default(), true).unwrap();
        fs::create_dir(fx.container.path().join(HTML)).unwrap();
        fs::write(fx.container.path().join("content.opf"), b"<package/>").unwrap();
        fs::write(fx.container.path().join("Manga_001.mobi"), b"mobi").unwrap();
        fx.container.clean().unwrap();
        assert!(!fx.container.path().exists());
        fx.container.clean().unwrap();
    }

    #[rstest]
    #[case("notes.txt", false)]
    #[case("extra", true)]
    fn test_clean_refuses_unexpected(#[case] name: &str, #[case] dir: bool) {
        let fx = Fixture::new();
        let stray = fx.container.path().join(name);
        match dir {
            true => fs::create_dir(&stray).unwrap(),
            false => fs::write(&stray, b"mine").unwrap(),
        }
        let err = fx.container.clean().unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnexpectedContent(_)));
        assert!(stray.exists());
    }
}
