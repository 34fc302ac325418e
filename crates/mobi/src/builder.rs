//! Compiles a staged [`Container`] into a MOBI document.

use crate::assets::Assets;
use crate::container::{Container, HTML, IMAGES};
use crate::error::{ErrorKind, Result};
use crate::kindlegen::Kindlegen;
use crate::manifest::{CSS, Manifest, NCX, OPF, PageRef};
use crate::strip::strip_srcs;
use crate::title::VolumeInfo;
use exn::{OptionExt, ResultExt};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::instrument;

/// Name kindlegen is asked to write its raw output under.
const RAW_OUTPUT: &str = "kindlegen.mobi";

pub struct MangaMobi {
    compiler: Kindlegen,
    manifest: Manifest,
}
impl MangaMobi {
    pub fn new(compiler: Kindlegen) -> Result<Self> {
        Ok(Self { compiler, manifest: Manifest::new()? })
    }

    pub fn compiler(&self) -> &Kindlegen {
        &self.compiler
    }

    /// Writes the descriptors into `container`, compiles them and strips the
    /// sources section from the result.
    ///
    /// Returns the document's display name (derived from the title) and its
    /// location inside the container. The compiler is killed if it's still
    /// running at `deadline`.
    #[instrument(skip_all, fields(container = %container.path().display(), title = %info.title))]
    pub fn create(
        &self,
        container: &Container,
        info: &VolumeInfo,
        deadline: Option<Instant>,
    ) -> Result<(String, PathBuf)> {
        let root = container.path();
        let images = container.pages()?;
        if images.is_empty() {
            exn::bail!(ErrorKind::NoPages(root.to_path_buf()));
        }
        let resolution = container.resolution();

        write(&root.join(CSS), &Assets::load(CSS)?)?;
        let html = root.join(HTML);
        fs::create_dir_all(&html).or_raise(|| ErrorKind::Io(html.clone()))?;
        let mut pages = Vec::with_capacity(images.len());
        for (i, image) in images.iter().enumerate() {
            let page = PageRef { html: format!("{HTML}/{i:03}.html"), image: format!("{IMAGES}/{}", file_name(image)?) };
            write(&root.join(&page.html), self.manifest.page(info, resolution, i, &page)?.as_bytes())?;
            pages.push(page);
        }
        let cover = container.cover()?.map(|c| file_name(&c)).transpose()?;
        let opf = self.manifest.opf(info, resolution, cover.as_deref(), &pages)?;
        write(&root.join(OPF), opf.as_bytes())?;
        write(&root.join(NCX), self.manifest.ncx(info, resolution, &pages)?.as_bytes())?;

        let raw_path = self.compiler.compile(&root.join(OPF), RAW_OUTPUT, deadline)?;
        let raw = fs::read(&raw_path).or_raise(|| ErrorKind::Io(raw_path.clone()))?;
        let document = match strip_srcs(&raw) {
            Ok(stripped) => stripped,
            Err(e) if matches!(&*e, ErrorKind::NoSources) => {
                tracing::debug!("Compiled document has no sources section");
                raw
            },
            Err(e) => return Err(e),
        };
        let name = info.file_name();
        let path = root.join(&name);
        write(&path, &document)?;
        fs::remove_file(&raw_path).or_raise(|| ErrorKind::Io(raw_path.clone()))?;
        tracing::info!(name = %name, pages = pages.len(), bytes = document.len(), "Document built");
        Ok((name, path))
    }
}

fn write(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents).or_raise(|| ErrorKind::Io(path.to_path_buf()))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_raise(|| ErrorKind::Io(path.to_path_buf()))
}
