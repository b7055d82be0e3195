//! Page rasterisation for the vision model.
//!
//! pdfium is not async-safe, so every call runs inside
//! `tokio::task::spawn_blocking`. Only the pages of one OCR window are
//! rendered at a time; a 200-page sub-document is never held in memory as
//! images.
//!
//! Scale comes from the configured DPI (PDF user space is 72 points per
//! inch), bounded by `max_rendered_pixels` on both edges so oversized scans
//! do not blow up request size.

use crate::error::DongyError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::debug;

/// Render settings for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub dpi: u32,
    pub max_pixels: u32,
}

impl RenderOptions {
    fn scale(&self) -> f32 {
        self.dpi as f32 / 72.0
    }
}

/// Render pages `start_page..=end_page` (1-based) of `pdf_path`.
///
/// Returns `(page_number, image)` pairs in page order.
pub async fn render_range(
    pdf_path: &Path,
    start_page: usize,
    end_page: usize,
    options: RenderOptions,
) -> Result<Vec<(usize, DynamicImage)>, DongyError> {
    let path = pdf_path.to_path_buf();
    tokio::task::spawn_blocking(move || render_range_blocking(&path, start_page, end_page, options))
        .await
        .map_err(|e| DongyError::Internal(format!("Render task panicked: {}", e)))?
}

fn render_range_blocking(
    pdf_path: &Path,
    start_page: usize,
    end_page: usize,
    options: RenderOptions,
) -> Result<Vec<(usize, DynamicImage)>, DongyError> {
    let pdfium = Pdfium::default();
    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| DongyError::CorruptPdf {
            path: pdf_path.to_path_buf(),
            detail: format!("{:?}", e),
        })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    if start_page == 0 || end_page > total_pages || start_page > end_page {
        return Err(DongyError::RasterisationFailed {
            page: end_page,
            detail: format!(
                "range {}-{} outside document of {} pages",
                start_page, end_page, total_pages
            ),
        });
    }

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(options.scale())
        .set_maximum_width(options.max_pixels as i32)
        .set_maximum_height(options.max_pixels as i32);

    let mut images = Vec::with_capacity(end_page + 1 - start_page);
    for page_num in start_page..=end_page {
        let page = pages
            .get((page_num - 1) as u16)
            .map_err(|e| DongyError::RasterisationFailed {
                page: page_num,
                detail: format!("{:?}", e),
            })?;
        let image = page
            .render_with_config(&render_config)
            .map_err(|e| DongyError::RasterisationFailed {
                page: page_num,
                detail: format!("{:?}", e),
            })?
            .as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            page_num,
            image.width(),
            image.height()
        );
        images.push((page_num, image));
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_follows_dpi() {
        let o = RenderOptions {
            dpi: 144,
            max_pixels: 2000,
        };
        assert_eq!(o.scale(), 2.0);
    }
}
