//! Image helpers: PNG transport encoding and refiner rescaling.

use std::io::Cursor;

use base64::{engine::general_purpose, Engine as _};
use image::{imageops::FilterType, DynamicImage, ImageFormat};

use crate::error::{EngineError, Result};

/// Encode an image as base64 PNG for a JSON envelope.
pub fn encode_png_base64(image: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(general_purpose::STANDARD.encode(bytes))
}

/// Decode a base64 image, accepting an optional `data:image/...;base64,` prefix.
pub fn decode_base64_image(data: &str) -> Result<DynamicImage> {
    let payload = match data.split_once(";base64,") {
        Some((_, rest)) => rest,
        None => data,
    };
    let bytes = general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| EngineError::Protocol(format!("invalid base64 image: {e}")))?;
    Ok(image::load_from_memory(&bytes)?)
}

pub fn resize(image: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    if image.width() == width && image.height() == height {
        return image.clone();
    }
    image.resize_exact(width, height, FilterType::Lanczos3)
}

pub fn round_to_multiple_of_8(value: f64) -> u32 {
    let blocks = (value / 8.0).round().min(f64::from(u32::MAX / 8));
    (blocks as u32 * 8).max(8)
}

/// Dimensions to refine at, or `None` when the image already meets the minimum or is empty.
///
/// Scales uniformly so both sides reach `minimum`, then snaps each side to a multiple of 8.
pub fn refiner_dimensions(width: u32, height: u32, minimum: u32) -> Option<(u32, u32)> {
    if width == 0 || height == 0 || (width >= minimum && height >= minimum) {
        return None;
    }
    let mut scale = 1.0_f64;
    if width < minimum {
        scale = f64::from(minimum) / f64::from(width);
    }
    if height < minimum {
        scale = scale.max(f64::from(minimum) / f64::from(height));
    }
    Some((
        round_to_multiple_of_8(f64::from(width) * scale),
        round_to_multiple_of_8(f64::from(height) * scale),
    ))
}
