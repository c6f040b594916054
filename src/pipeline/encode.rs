//! Image encoding: `DynamicImage` → base64 PNG ready for a vision request.
//!
//! PNG is lossless; pen strokes and faint handwriting survive where JPEG
//! artefacts would blur them.

use crate::error::TranscribeError;
use crate::pipeline::render::RenderedPage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use std::io::Cursor;
use tracing::debug;

/// A rasterised page encoded for transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPage {
    pub page_number: usize,
    /// Base64 of the PNG bytes, no data-URI prefix.
    pub png_base64: String,
    pub width: u32,
    pub height: u32,
}

impl EncodedPage {
    pub const MIME_TYPE: &'static str = "image/png";

    /// `data:image/png;base64,…` as used by OpenAI-style `image_url` parts.
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", Self::MIME_TYPE, self.png_base64)
    }

    /// Wrap as an edgequake-llm image attachment with `detail: "high"` so
    /// small handwriting is not downsampled into a single overview tile.
    pub fn to_image_data(&self) -> ImageData {
        ImageData::new(self.png_base64.clone(), Self::MIME_TYPE).with_detail("high")
    }
}

/// Encode a rasterised page as a base64 PNG.
pub fn encode_page(page: &RenderedPage) -> Result<EncodedPage, TranscribeError> {
    let mut buf = Vec::new();
    page.image
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| TranscribeError::EncodingFailed {
            page: page.page_number,
            detail: e.to_string(),
        })?;

    let png_base64 = STANDARD.encode(&buf);
    debug!(
        "Encoded page {} → {} bytes base64",
        page.page_number,
        png_base64.len()
    );

    Ok(EncodedPage {
        page_number: page.page_number,
        png_base64,
        width: page.image.width(),
        height: page.image.height(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};

    fn page(n: usize) -> RenderedPage {
        RenderedPage {
            page_number: n,
            image: DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 12, Rgba([255, 0, 0, 255]))),
        }
    }

    #[test]
    fn encode_small_image() {
        let encoded = encode_page(&page(2)).expect("encode should succeed");
        assert_eq!(encoded.page_number, 2);
        assert_eq!((encoded.width, encoded.height), (10, 12));
        let decoded = STANDARD.decode(&encoded.png_base64).expect("valid base64");
        assert_eq!(&decoded[1..4], b"PNG");
    }

    #[test]
    fn image_data_is_high_detail_png() {
        let data = encode_page(&page(1)).unwrap().to_image_data();
        assert_eq!(data.mime_type, "image/png");
        assert!(!data.data.is_empty());
    }

    #[test]
    fn data_uri_prefix() {
        let uri = encode_page(&page(1)).unwrap().data_uri();
        assert!(uri.starts_with("data:image/png;base64,"));
    }
}
