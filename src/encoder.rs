//! Raw capture to output format conversion

use crate::{CropRect, OutputFormat, ScreenshotError};
use image::{DynamicImage, ImageOutputFormat};
use std::io::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub format: OutputFormat,
    /// 1-100. Only JPEG honours it; WebP output is lossless.
    pub quality: u8,
    pub crop: Option<CropRect>,
}

pub trait ImageEncoder: Send + Sync {
    fn encode(&self, raw: &[u8], options: &EncodeOptions) -> Result<Vec<u8>, ScreenshotError>;
}

/// Encoder built on the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterEncoder;

impl ImageEncoder for RasterEncoder {
    fn encode(&self, raw: &[u8], options: &EncodeOptions) -> Result<Vec<u8>, ScreenshotError> {
        // Renderer output is already PNG
        if options.format == OutputFormat::Png && options.crop.is_none() {
            return Ok(raw.to_vec());
        }

        let mut img = image::load_from_memory(raw)
            .map_err(|e| ScreenshotError::EncodeFailed(format!("decoding capture: {}", e)))?;

        if let Some(crop) = options.crop {
            img = apply_crop(&img, crop)?;
        }

        let output = match options.format {
            OutputFormat::Png => ImageOutputFormat::Png,
            OutputFormat::Jpeg => {
                img = DynamicImage::ImageRgb8(img.to_rgb8());
                ImageOutputFormat::Jpeg(options.quality.clamp(1, 100))
            }
            OutputFormat::Webp => ImageOutputFormat::WebP,
        };

        let mut encoded = Vec::new();
        img.write_to(&mut Cursor::new(&mut encoded), output)
            .map_err(|e| ScreenshotError::EncodeFailed(e.to_string()))?;

        Ok(encoded)
    }
}

/// Crop, clamping the rectangle to the image bounds
fn apply_crop(img: &DynamicImage, crop: CropRect) -> Result<DynamicImage, ScreenshotError> {
    if crop.x >= img.width() || crop.y >= img.height() {
        return Err(ScreenshotError::InvalidInput(format!(
            "crop origin ({}, {}) lies outside the {}x{} capture",
            crop.x,
            crop.y,
            img.width(),
            img.height()
        )));
    }

    let width = crop.width.min(img.width() - crop.x);
    let height = crop.height.min(img.height() - crop.y);
    Ok(img.crop_imm(crop.x, crop.y, width, height))
}
