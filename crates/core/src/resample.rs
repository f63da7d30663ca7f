//! Deterministic resampler: decode → Lanczos3 resize → PNG encode.
//!
//! This is the fallback path of the dispatcher and has no external
//! dependency beyond the `image` codecs compiled into the crate.

use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};
use tracing::debug;

use crate::error::UpscaleError;

/// Containers accepted at the upload boundary.
pub const SUPPORTED_FORMATS: [ImageFormat; 4] = [
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::WebP,
    ImageFormat::Bmp,
];

/// Decode PNG/JPEG/WEBP/BMP bytes into 8-bit RGB, dropping any alpha channel.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, UpscaleError> {
    let format = image::guess_format(bytes)
        .map_err(|e| UpscaleError::Decode(format!("unrecognized image container: {e}")))?;

    if !SUPPORTED_FORMATS.contains(&format) {
        return Err(UpscaleError::Decode(format!(
            "unsupported image format {format:?} (expected PNG, JPEG, WEBP or BMP)"
        )));
    }

    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| UpscaleError::Decode(e.to_string()))?;
    Ok(decoded.to_rgb8())
}

/// Compute `(width * scale, height * scale)`.
pub fn output_dimensions(width: u32, height: u32, scale: u32) -> Result<(u32, u32), UpscaleError> {
    let invalid = || UpscaleError::InvalidScale {
        scale,
        width,
        height,
    };

    if scale == 0 {
        return Err(invalid());
    }

    let out_w = width.checked_mul(scale).ok_or_else(invalid)?;
    let out_h = height.checked_mul(scale).ok_or_else(invalid)?;
    Ok((out_w, out_h))
}

/// Resize an already decoded image by an integer factor with Lanczos3.
pub fn resample_image(image: &RgbImage, scale: u32) -> Result<RgbImage, UpscaleError> {
    let (out_w, out_h) = output_dimensions(image.width(), image.height(), scale)?;
    if scale == 1 {
        return Ok(image.clone());
    }

    debug!(
        in_width = image.width(),
        in_height = image.height(),
        out_width = out_w,
        out_height = out_h,
        "Lanczos3 resample"
    );
    Ok(imageops::resize(image, out_w, out_h, FilterType::Lanczos3))
}

/// Decode `bytes` and upscale by `scale`.
///
/// `preserve_aspect` is accepted for parity with the model path; both axes
/// are multiplied by the same integer so the aspect ratio is always kept.
pub fn resample(bytes: &[u8], scale: u32, preserve_aspect: bool) -> Result<RgbImage, UpscaleError> {
    let _ = preserve_aspect;
    let image = decode_rgb(bytes)?;
    resample_image(&image, scale)
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, UpscaleError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| UpscaleError::Encode(e.to_string()))?;
    Ok(buf.into_inner())
}
