//! PDF rasterisation: render the first pages of a PDF to `DynamicImage`.
//!
//! pdfium keeps thread-local state and is not safe to drive from async
//! code, so the default rasterizer runs inside `spawn_blocking`.
//!
//! Output is capped twice: by page count (`max_pages`) and by the longest
//! rendered edge (`max_rendered_pixels`), so an oversized scan cannot blow
//! up memory regardless of its physical size.

use crate::config::ExtractionConfig;
use crate::error::TranscribeError;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use tracing::{debug, info};

/// One rasterised page, 1-indexed.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub page_number: usize,
    pub image: DynamicImage,
}

/// Turns PDF bytes into an ordered, bounded list of page images.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    /// Rasterise at most `max_pages` pages, in page order.
    ///
    /// Fails with [`TranscribeError::UnreadablePdf`] when the bytes cannot
    /// be opened. A document longer than `max_pages` yields only the prefix.
    async fn rasterize(
        &self,
        pdf_bytes: Vec<u8>,
        max_pages: usize,
    ) -> Result<Vec<RenderedPage>, TranscribeError>;
}

/// pdfium-backed rasterizer.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    dpi: u32,
    max_rendered_pixels: u32,
}

impl PdfiumRasterizer {
    pub fn new(dpi: u32, max_rendered_pixels: u32) -> Self {
        Self {
            dpi,
            max_rendered_pixels,
        }
    }

    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self::new(config.dpi, config.max_rendered_pixels)
    }
}

#[async_trait]
impl PageRasterizer for PdfiumRasterizer {
    async fn rasterize(
        &self,
        pdf_bytes: Vec<u8>,
        max_pages: usize,
    ) -> Result<Vec<RenderedPage>, TranscribeError> {
        let dpi = self.dpi;
        let max_pixels = self.max_rendered_pixels;

        tokio::task::spawn_blocking(move || {
            render_pages_blocking(&pdf_bytes, dpi, max_pixels, max_pages)
        })
        .await
        .map_err(|e| TranscribeError::Internal(format!("Render task panicked: {}", e)))?
    }
}

/// Blocking implementation of page rendering.
fn render_pages_blocking(
    pdf_bytes: &[u8],
    dpi: u32,
    max_pixels: u32,
    max_pages: usize,
) -> Result<Vec<RenderedPage>, TranscribeError> {
    let pdfium = Pdfium::default();

    let document = pdfium
        .load_pdf_from_byte_slice(pdf_bytes, None)
        .map_err(|e| TranscribeError::UnreadablePdf {
            detail: format!("{:?}", e),
        })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    let take = total_pages.min(max_pages);
    info!("PDF loaded: {} pages, rasterising {}", total_pages, take);

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::with_capacity(take);

    for idx in 0..take {
        let page = pages
            .get(idx as u16)
            .map_err(|e| TranscribeError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            })?;

        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            TranscribeError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            }
        })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );

        results.push(RenderedPage {
            page_number: idx + 1,
            image,
        });
    }

    Ok(results)
}

/// Read the embedded text layer of the first `max_pages` pages.
///
/// Used by the text-layer fallback; scans without OCR yield empty strings.
pub(crate) fn page_texts_blocking(
    pdf_bytes: &[u8],
    max_pages: usize,
) -> Result<Vec<String>, TranscribeError> {
    let pdfium = Pdfium::default();
    let document = pdfium
        .load_pdf_from_byte_slice(pdf_bytes, None)
        .map_err(|e| TranscribeError::UnreadablePdf {
            detail: format!("{:?}", e),
        })?;

    let mut texts = Vec::new();
    for (idx, page) in document.pages().iter().enumerate().take(max_pages) {
        match page.text() {
            Ok(text) => texts.push(text.all()),
            Err(e) => {
                debug!("Page {}: no text layer ({:?})", idx + 1, e);
                texts.push(String::new());
            }
        }
    }
    Ok(texts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_copies_render_settings() {
        let config = ExtractionConfig::builder()
            .dpi(150)
            .max_rendered_pixels(1800)
            .build()
            .unwrap();
        let r = PdfiumRasterizer::from_config(&config);
        assert_eq!(r.dpi, 150);
        assert_eq!(r.max_rendered_pixels, 1800);
    }
}
