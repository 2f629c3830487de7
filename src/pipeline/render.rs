//! PDF rasterisation: render page ranges to PNG-encoded [`PageImage`]s.
//!
//! The orchestrator only sees the [`Rasterizer`] trait, so tests (and callers
//! with their own renderer) can substitute an in-memory implementation.
//! [`PdfiumRasterizer`] is the default.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state and CPU-heavy rendering.
//! [`render_batch`] and [`page_count`] move the calls onto tokio's blocking
//! pool so worker threads never stall while a batch is being rasterised.
//!
//! ## Why cap pixels as well as DPI?
//!
//! Page sizes vary wildly: an A0 poster at 130 DPI is over 6,000 px wide.
//! `max_rendered_pixels` caps the longest edge regardless of physical size,
//! keeping memory bounded and the per-image token cost predictable.

use crate::config::ProcessorConfig;
use crate::error::PipelineError;
use image::{DynamicImage, GenericImageView};
use pdfium_render::prelude::*;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A rendered page. Immutable once produced.
#[derive(Clone, PartialEq, Eq)]
pub struct PageImage {
    /// 1-based page number in the source document.
    pub page_num: u32,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    /// PNG-encoded pixels.
    pub pixel_data: Vec<u8>,
}

impl fmt::Debug for PageImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageImage")
            .field("page_num", &self.page_num)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("dpi", &self.dpi)
            .field("png_bytes", &self.pixel_data.len())
            .finish()
    }
}

impl PageImage {
    /// Encode a decoded image as a `PageImage`.
    pub fn from_image(
        page_num: u32,
        dpi: u32,
        img: &DynamicImage,
    ) -> Result<Self, image::ImageError> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
        Ok(Self {
            page_num,
            width: img.width(),
            height: img.height(),
            dpi,
            pixel_data: buf,
        })
    }

    pub fn area(&self) -> f64 {
        self.width as f64 * self.height as f64
    }
}

/// Source of page images for a document.
///
/// Implementations are synchronous and may block; the pipeline always calls
/// them from the blocking pool.
pub trait Rasterizer: Send + Sync {
    /// Number of pages in the document.
    fn page_count(&self, path: &Path) -> Result<u32, PipelineError>;

    /// Render pages `start..=end` (1-based) at `dpi`, in page order.
    fn render_pages(
        &self,
        path: &Path,
        start: u32,
        end: u32,
        dpi: u32,
    ) -> Result<Vec<PageImage>, PipelineError>;
}

/// Run [`Rasterizer::page_count`] on the blocking pool.
pub async fn page_count(
    rasterizer: Arc<dyn Rasterizer>,
    path: PathBuf,
) -> Result<u32, PipelineError> {
    tokio::task::spawn_blocking(move || rasterizer.page_count(&path))
        .await
        .map_err(|e| PipelineError::Internal(format!("Page-count task panicked: {e}")))?
}

/// Run [`Rasterizer::render_pages`] on the blocking pool.
pub async fn render_batch(
    rasterizer: Arc<dyn Rasterizer>,
    path: PathBuf,
    start: u32,
    end: u32,
    dpi: u32,
) -> Result<Vec<PageImage>, PipelineError> {
    tokio::task::spawn_blocking(move || rasterizer.render_pages(&path, start, end, dpi))
        .await
        .map_err(|e| PipelineError::Internal(format!("Render task panicked: {e}")))?
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// Default rasteriser backed by pdfium.
///
/// The library is located through `PDFIUM_LIB_PATH` (a directory or the
/// library file itself) and falls back to the system library search path.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    pub max_rendered_pixels: u32,
    pub trim_margins: bool,
    pub white_threshold: u8,
    pub lib_path: Option<PathBuf>,
}

impl PdfiumRasterizer {
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self {
            max_rendered_pixels: config.max_rendered_pixels,
            trim_margins: config.trim_margins,
            white_threshold: config.white_threshold,
            lib_path: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
        }
    }

    fn bind(&self) -> Result<Pdfium, PipelineError> {
        let bindings = match &self.lib_path {
            Some(p) if p.is_dir() => Pdfium::bind_to_library(
                Pdfium::pdfium_platform_library_name_at_path(p),
            ),
            Some(p) => Pdfium::bind_to_library(p),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| PipelineError::PdfiumBindingFailed(format!("{e:?}")))?;
        Ok(Pdfium::new(bindings))
    }

    fn open<'a>(&self, pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, PipelineError> {
        pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| PipelineError::CorruptPdf {
                path: path.to_path_buf(),
                detail: format!("{e:?}"),
            })
    }

    /// Target width in pixels for a page `width_pts` wide at `dpi`, scaled
    /// down so neither edge exceeds the pixel cap.
    fn target_width(&self, width_pts: f32, height_pts: f32, dpi: u32) -> i32 {
        let scale = dpi as f32 / 72.0;
        let (w, h) = (width_pts * scale, height_pts * scale);
        let cap = self.max_rendered_pixels as f32;
        let shrink = (cap / w.max(h)).min(1.0);
        (w * shrink).round().max(1.0) as i32
    }
}

impl Rasterizer for PdfiumRasterizer {
    fn page_count(&self, path: &Path) -> Result<u32, PipelineError> {
        let pdfium = self.bind()?;
        let document = self.open(&pdfium, path)?;
        Ok(document.pages().len() as u32)
    }

    fn render_pages(
        &self,
        path: &Path,
        start: u32,
        end: u32,
        dpi: u32,
    ) -> Result<Vec<PageImage>, PipelineError> {
        let pdfium = self.bind()?;
        let document = self.open(&pdfium, path)?;
        let pages = document.pages();
        let total = pages.len() as u32;
        if start == 0 || start > end || end > total {
            return Err(PipelineError::PageOutOfRange { start, end, total });
        }

        let mut out = Vec::with_capacity((end - start + 1) as usize);
        for page_num in start..=end {
            let failed = |detail: String| PipelineError::RasterisationFailed {
                page: page_num,
                detail,
            };
            let page = pages
                .get((page_num - 1) as u16)
                .map_err(|e| failed(format!("{e:?}")))?;

            let width = self.target_width(page.width().value, page.height().value, dpi);
            let render_config = PdfRenderConfig::new()
                .set_target_width(width)
                .set_maximum_height(self.max_rendered_pixels as i32);
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| failed(format!("{e:?}")))?;

            let mut image = bitmap.as_image();
            if self.trim_margins {
                image = trim_white_margins(&image, self.white_threshold);
            }
            let rendered = PageImage::from_image(page_num, dpi, &image)
                .map_err(|e| failed(format!("PNG encoding failed: {e}")))?;
            debug!(
                page = page_num,
                width = rendered.width,
                height = rendered.height,
                "rendered page"
            );
            out.push(rendered);
        }
        info!(start, end, "rasterised {} pages", out.len());
        Ok(out)
    }
}

/// Crop near-white borders, keeping a small padding. A blank page is
/// returned unchanged.
pub fn trim_white_margins(img: &DynamicImage, white_threshold: u8) -> DynamicImage {
    const PADDING: u32 = 8;
    let (w, h) = img.dimensions();
    let rgb = img.to_rgb8();

    let mut min_x = w;
    let mut min_y = h;
    let mut max_x = 0;
    let mut max_y = 0;
    for (x, y, px) in rgb.enumerate_pixels() {
        if px.0.iter().any(|&c| c < white_threshold) {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    if min_x > max_x || min_y > max_y {
        return img.clone();
    }

    let x0 = min_x.saturating_sub(PADDING);
    let y0 = min_y.saturating_sub(PADDING);
    let x1 = (max_x + PADDING + 1).min(w);
    let y1 = (max_y + PADDING + 1).min(h);
    img.crop_imm(x0, y0, x1 - x0, y1 - y0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn canvas(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([255, 255, 255]))
    }

    #[test]
    fn trim_crops_to_ink_with_padding() {
        let mut img = canvas(200, 100);
        for x in 50..60 {
            for y in 40..45 {
                img.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        let trimmed = trim_white_margins(&DynamicImage::ImageRgb8(img), 250);
        assert_eq!(trimmed.dimensions(), (10 + 16, 5 + 16));
    }

    #[test]
    fn trim_leaves_blank_page_alone() {
        let img = DynamicImage::ImageRgb8(canvas(30, 20));
        assert_eq!(trim_white_margins(&img, 250).dimensions(), (30, 20));
    }

    #[test]
    fn trim_ignores_near_white_noise() {
        let mut img = canvas(50, 50);
        img.put_pixel(1, 1, Rgb([252, 252, 252]));
        img.put_pixel(25, 25, Rgb([10, 10, 10]));
        let trimmed = trim_white_margins(&DynamicImage::ImageRgb8(img), 250);
        assert_eq!(trimmed.dimensions(), (17, 17));
    }

    #[test]
    fn page_image_encodes_png() {
        let img = DynamicImage::ImageRgb8(canvas(12, 7));
        let page = PageImage::from_image(3, 130, &img).unwrap();
        assert_eq!((page.width, page.height), (12, 7));
        assert_eq!(&page.pixel_data[1..4], b"PNG");
    }

    #[test]
    fn target_width_respects_cap() {
        let r = PdfiumRasterizer {
            max_rendered_pixels: 2000,
            trim_margins: false,
            white_threshold: 250,
            lib_path: None,
        };
        // US Letter at 130 DPI: 1105 x 1430, under the cap.
        assert_eq!(r.target_width(612.0, 792.0, 130), 1105);
        // A0 at 130 DPI is capped on its longest edge.
        let w = r.target_width(2384.0, 3370.0, 130);
        assert!(w < 2000 && w > 1300, "got {w}");
    }
}
