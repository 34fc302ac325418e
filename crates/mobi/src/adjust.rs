//! Page image adjustment.
//!
//! Pages are scanned at whatever size the source publishes them. Before they
//! are staged they may be cropped (margins, scanlation footers) and scaled to
//! the device resolution.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage};
use std::path::Path;
use std::str::FromStr;

/// Luma distance from the background under which a pixel counts as blank.
const BLANK_THRESHOLD: u8 = 16;
/// Blank rows required between the page body and a footer.
const FOOTER_GAP: u32 = 4;
/// Largest share of the page height a band may cover to be treated as a
/// footer.
const FOOTER_RATIO: f32 = 0.06;

/// Target device resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}
impl Default for Resolution {
    fn default() -> Self {
        Self { width: 800, height: 1280 }
    }
}
impl Resolution {
    fn is_landscape(&self) -> bool {
        self.width > self.height
    }
}

/// How a page is fitted to the device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Adjust {
    /// Keep the image as published.
    #[default]
    None,
    /// Scale, preserving the aspect ratio, to fit within the resolution.
    Resize,
    /// Scale and crop to exactly cover the resolution.
    Fill,
    /// Rotate images whose orientation differs from the device (double-page
    /// spreads), then scale to fit.
    Rotate,
}

impl FromStr for Adjust {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "resize" => Ok(Self::Resize),
            "fill" => Ok(Self::Fill),
            "rotate" => Ok(Self::Rotate),
            other => Err(format!("unknown image adjustment: {other}")),
        }
    }
}

/// Content filters applied before adjusting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Filters {
    /// Crop uniform borders around the page body.
    pub margin: bool,
    /// Drop a thin band (typically a scanlator credit) separated from the
    /// bottom of the page body by blank rows.
    pub footer: bool,
}
impl Filters {
    pub fn is_empty(&self) -> bool {
        !self.margin && !self.footer
    }
}

/// Loads `source`, applies `filters` and `adjust`, and encodes the result
/// to `dest` in the format implied by its extension.
pub(crate) fn process(
    source: &Path,
    dest: &Path,
    adjust: Adjust,
    filters: Filters,
    resolution: Resolution,
) -> Result<()> {
    let image = image::open(source).or_raise(|| ErrorKind::Image(source.to_path_buf()))?;
    let image = transform(image, adjust, filters, resolution);
    // JPEG has no alpha channel.
    let image = match is_jpeg(dest) {
        true => DynamicImage::ImageRgb8(image.to_rgb8()),
        false => image,
    };
    image.save(dest).or_raise(|| ErrorKind::Image(dest.to_path_buf()))?;
    Ok(())
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
}

pub(crate) fn transform(mut image: DynamicImage, adjust: Adjust, filters: Filters, resolution: Resolution) -> DynamicImage {
    if filters.footer {
        image = remove_footer(image);
    }
    if filters.margin {
        image = trim_margin(image);
    }
    let Resolution { width, height } = resolution;
    match adjust {
        Adjust::None => image,
        Adjust::Resize => image.resize(width, height, FilterType::Lanczos3),
        Adjust::Fill => image.resize_to_fill(width, height, FilterType::Lanczos3),
        Adjust::Rotate => {
            let landscape = image.width() > image.height();
            let image = match landscape != resolution.is_landscape() {
                true => image.rotate90(),
                false => image,
            };
            image.resize(width, height, FilterType::Lanczos3)
        },
    }
}

fn is_blank(pixel: u8, background: u8) -> bool {
    pixel.abs_diff(background) <= BLANK_THRESHOLD
}

fn blank_row(luma: &GrayImage, y: u32, background: u8) -> bool {
    (0..luma.width()).all(|x| is_blank(luma.get_pixel(x, y).0[0], background))
}

/// Crops to the bounding box of everything that differs from the top-left
/// pixel. Uniform images are returned untouched.
pub(crate) fn trim_margin(image: DynamicImage) -> DynamicImage {
    let luma = image.to_luma8();
    let (width, height) = luma.dimensions();
    if width == 0 || height == 0 {
        return image;
    }
    let background = luma.get_pixel(0, 0).0[0];
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in luma.enumerate_pixels() {
        if is_blank(pixel.0[0], background) {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    match bounds {
        Some((x0, y0, x1, y1)) if (x1 - x0 + 1, y1 - y0 + 1) != (width, height) => {
            tracing::trace!(x0, y0, x1, y1, "Page margin trimmed");
            image.crop_imm(x0, y0, x1 - x0 + 1, y1 - y0 + 1)
        },
        _ => image,
    }
}

/// Removes a footer band: reading upwards from the bottom, skip blank rows,
/// then a band of content no taller than [`FOOTER_RATIO`] of the page, then
/// at least [`FOOTER_GAP`] blank rows. Everything from that gap down is cut.
pub(crate) fn remove_footer(image: DynamicImage) -> DynamicImage {
    let luma = image.to_luma8();
    let (width, height) = luma.dimensions();
    if width == 0 || height == 0 {
        return image;
    }
    let background = luma.get_pixel(0, height - 1).0[0];
    let max_band = ((height as f32) * FOOTER_RATIO).floor() as u32;
    let mut y = height;
    while y > 0 && blank_row(&luma, y - 1, background) {
        y -= 1;
    }
    let band_bottom = y;
    while y > 0 && !blank_row(&luma, y - 1, background) {
        y -= 1;
    }
    let band = band_bottom - y;
    if band == 0 || band > max_band {
        return image;
    }
    let gap_bottom = y;
    while y > 0 && blank_row(&luma, y - 1, background) {
        y -= 1;
    }
    // Need a gap, and something above it.
    if gap_bottom - y < FOOTER_GAP || y == 0 {
        return image;
    }
    tracing::trace!(band, cut = y, "Page footer removed");
    image.crop_imm(0, 0, width, y)
}
