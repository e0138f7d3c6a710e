//! Screenshot preparation for upload.
//!
//! Captures above the size limit are halved and re-encoded as JPEG before they
//! go into a request; smaller ones are sent as the original PNG.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, ImageResult};

pub const JPEG_QUALITY: u8 = 70;

/// Image bytes ready for a data URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedScreenshot {
    pub mime: &'static str,
    pub data: Vec<u8>,
    /// Pixel size of `data` when it was downscaled; `None` when sent unchanged
    pub scaled_to: Option<(u32, u32)>,
}

impl EncodedScreenshot {
    fn original(png: &[u8]) -> Self {
        Self {
            mime: "image/png",
            data: png.to_vec(),
            scaled_to: None,
        }
    }
}

/// Halve and JPEG-encode `png` when it is larger than `limit` bytes.
///
/// An image that cannot be decoded is passed through unchanged.
pub fn compress_screenshot(png: &[u8], limit: usize) -> EncodedScreenshot {
    if png.len() <= limit {
        return EncodedScreenshot::original(png);
    }
    match downscale(png) {
        Ok((data, width, height)) => {
            tracing::debug!(
                original_bytes = png.len(),
                compressed_bytes = data.len(),
                width,
                height,
                "screenshot compressed"
            );
            EncodedScreenshot {
                mime: "image/jpeg",
                data,
                scaled_to: Some((width, height)),
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "screenshot not compressed");
            EncodedScreenshot::original(png)
        }
    }
}

fn downscale(png: &[u8]) -> ImageResult<(Vec<u8>, u32, u32)> {
    let decoded = image::load_from_memory(png)?;
    let width = (decoded.width() / 2).max(1);
    let height = (decoded.height() / 2).max(1);
    let rgb = decoded
        .resize_exact(width, height, FilterType::Triangle)
        .to_rgb8();

    let mut data = Vec::new();
    JpegEncoder::new_with_quality(&mut data, JPEG_QUALITY).encode(
        rgb.as_raw(),
        width,
        height,
        ColorType::Rgb8,
    )?;
    Ok((data, width, height))
}
