//! Descriptor files the compiler reads: the OPF manifest, the NCX table of
//! contents and one XHTML page per image.
//!
//! Rendered with [upon]. Templates see:
//!
//! | Variable        | Description                                    |
//! |-----------------|------------------------------------------------|
//! | `title`         | Volume title                                   |
//! | `language`      | Language code                                  |
//! | `author`        | Author                                         |
//! | `publisher`     | Source the issue came from                     |
//! | `identifier`    | Unique identifier of the volume                |
//! | `direction`     | `ltr` or `rtl`                                 |
//! | `writing_mode`  | Kindle primary writing mode                    |
//! | `width`/`height`| Device resolution                              |
//! | `cover`         | `{ href, media_type }`, if the volume has one  |
//! | `pages`         | `[{ id, order, label, href, image, media_type }]` |

use crate::adjust::Resolution;
use crate::assets::Assets;
use crate::error::{ErrorKind, Result};
use crate::title::VolumeInfo;
use exn::ResultExt;
use std::path::Path;
use upon::{Engine, Template, Value};

pub(crate) const OPF: &str = "content.opf";
pub(crate) const NCX: &str = "toc.ncx";
pub(crate) const CSS: &str = "style.css";
const PAGE: &str = "page.xhtml";

/// A page as the descriptors reference it; paths are relative to the
/// container root.
pub(crate) struct PageRef {
    pub(crate) html: String,
    pub(crate) image: String,
}

pub(crate) struct Manifest {
    engine: Engine<'static>,
    opf: Template<'static>,
    ncx: Template<'static>,
    page: Template<'static>,
}
impl Manifest {
    pub(crate) fn new() -> Result<Self> {
        let mut engine = Engine::new();
        engine.add_formatter("xml", addons::xml);
        let opf = engine.compile(Assets::load_str(OPF)?).or_raise(|| ErrorKind::Template(OPF))?;
        let ncx = engine.compile(Assets::load_str(NCX)?).or_raise(|| ErrorKind::Template(NCX))?;
        let page = engine.compile(Assets::load_str(PAGE)?).or_raise(|| ErrorKind::Template(PAGE))?;
        Ok(Self { engine, opf, ncx, page })
    }

    pub(crate) fn opf(&self, info: &VolumeInfo, resolution: Resolution, cover: Option<&str>, pages: &[PageRef]) -> Result<String> {
        self.opf
            .render(&self.engine, Self::parameters(info, resolution, cover, pages))
            .to_string()
            .or_raise(|| ErrorKind::Template(OPF))
    }

    pub(crate) fn ncx(&self, info: &VolumeInfo, resolution: Resolution, pages: &[PageRef]) -> Result<String> {
        self.ncx
            .render(&self.engine, Self::parameters(info, resolution, None, pages))
            .to_string()
            .or_raise(|| ErrorKind::Template(NCX))
    }

    pub(crate) fn page(&self, info: &VolumeInfo, resolution: Resolution, number: usize, page: &PageRef) -> Result<String> {
        let parameters = upon::value! {
            title: &info.title,
            width: u64::from(resolution.width),
            height: u64::from(resolution.height),
            label: format!("Page {}", number + 1),
            image: &page.image,
        };
        self.page.render(&self.engine, parameters).to_string().or_raise(|| ErrorKind::Template(PAGE))
    }

    fn parameters(info: &VolumeInfo, resolution: Resolution, cover: Option<&str>, pages: &[PageRef]) -> Value {
        let pages = pages
            .iter()
            .enumerate()
            .map(|(i, page)| {
                upon::value! {
                    id: format!("page-{i:03}"),
                    order: (i + 1) as u64,
                    label: format!("Page {}", i + 1),
                    href: &page.html,
                    image: &page.image,
                    media_type: media_type(&page.image),
                }
            })
            .collect();
        let cover = cover.map(|href| {
            upon::value! {
                href: href,
                media_type: media_type(href),
            }
        });
        upon::value! {
            title: &info.title,
            language: &info.language,
            author: &info.author,
            publisher: &info.publisher,
            identifier: &info.identifier,
            direction: info.direction.as_str(),
            writing_mode: info.direction.writing_mode(),
            width: u64::from(resolution.width),
            height: u64::from(resolution.height),
            cover: cover,
            pages: Value::List(pages),
        }
    }
}

fn media_type(path: &str) -> &'static str {
    let extension = Path::new(path).extension().and_then(|e| e.to_str()).unwrap_or_default();
    match extension.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}

/// Custom [`upon`] extensions.
mod addons {
    use std::fmt::Write;
    use upon::{Value, fmt as upon_fmt};

    /// Escapes strings for use in XML text and attribute values.
    pub(super) fn xml(f: &mut upon_fmt::Formatter<'_>, value: &Value) -> upon_fmt::Result {
        match value {
            Value::String(s) => {
                for c in s.chars() {
                    match c {
                        '&' => f.write_str("&amp;")?,
                        '<' => f.write_str("&lt;")?,
                        '>' => f.write_str("&gt;")?,
                        '"' => f.write_str("&quot;")?,
                        '\'' => f.write_str("&apos;")?,
                        c => f.write_char(c)?,
                    }
                }
            },
            v => upon_fmt::default(f, v)?,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::title::{Direction, IssueMeta};

    fn info() -> VolumeInfo {
        let issue = IssueMeta {
            manga: "Tom & Jerry".into(),
            name: "Tom & Jerry 1: <Start>".into(),
            number: Some("1".into()),
            language: "en".into(),
            author: "Author".into(),
            publisher: "Source".into(),
            direction: Direction::RightToLeft,
            identifier: "https://example.com/tj/1".into(),
        };
        VolumeInfo::new(&issue, None)
    }

    fn pages(n: usize) -> Vec<PageRef> {
        (0..n)
            .map(|i| PageRef { html: format!("html/{i:03}.html"), image: format!("images/{i:03}.png") })
            .collect()
    }

    #[test]
    fn test_opf() {
        let manifest = Manifest::new().unwrap();
        let opf = manifest.opf(&info(), Resolution::default(), Some("cover.jpg"), &pages(2)).unwrap();
        assert!(opf.contains("<dc:title>Tom &amp; Jerry 001: &lt;Start&gt;</dc:title>"));
        assert!(opf.contains(r#"<meta name="original-resolution" content="800x1280"/>"#));
        assert!(opf.contains(r#"<meta name="primary-writing-mode" content="horizontal-rl"/>"#));
        assert!(opf.contains(r#"<spine page-progression-direction="rtl" toc="ncx">"#));
        assert!(opf.contains(r#"<item id="cover" href="cover.jpg" media-type="image/jpeg"/>"#));
        assert!(opf.contains(r#"<item id="page-001-image" href="images/001.png" media-type="image/png"/>"#));
        assert_eq!(opf.matches("<itemref ").count(), 2);
    }

    #[test]
    fn test_opf_without_cover() {
        let manifest = Manifest::new().unwrap();
        let opf = manifest.opf(&info(), Resolution::default(), None, &pages(1)).unwrap();
        assert!(!opf.contains(r#"name="cover""#));
        assert!(!opf.contains(r#"id="cover""#));
    }

    #[test]
    fn test_ncx() {
        let manifest = Manifest::new().unwrap();
        let ncx = manifest.ncx(&info(), Resolution::default(), &pages(3)).unwrap();
        assert_eq!(ncx.matches("<navPoint ").count(), 3);
        assert!(ncx.contains(r#"<navPoint id="nav-page-002" playOrder="3">"#));
        assert!(ncx.contains(r#"<content src="html/002.html"/>"#));
    }

    #[test]
    fn test_page() {
        let manifest = Manifest::new().unwrap();
        let html = manifest.page(&info(), Resolution::default(), 4, &pages(5)[4]).unwrap();
        assert!(html.contains(r#"<meta name="viewport" content="width=800, height=1280"/>"#));
        assert!(html.contains(r#"<img src="../images/004.png" alt="Page 5"/>"#));
    }
}
