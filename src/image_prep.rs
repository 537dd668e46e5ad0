//! Normalizes inbound images before they reach the model or get stored.

use anyhow::{Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

pub const JPEG_QUALITY: u8 = 85;

/// Drops a `data:<mime>;base64,` prefix when present.
pub fn strip_data_uri(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.starts_with("data:") {
        if let Some((_, payload)) = trimmed.split_once(',') {
            return payload;
        }
    }
    trimmed
}

/// Returns raw base64 whose decoded image fits within `max_width` x `max_height`.
///
/// Opaque images come back as JPEG, images with an alpha channel as PNG. Anything
/// that fails to decode is returned unchanged apart from the data-URI prefix.
pub fn prepare_image(raw: &str, max_width: u32, max_height: u32) -> String {
    let payload = strip_data_uri(raw);
    match reencode(payload, max_width, max_height) {
        Ok(prepared) => prepared,
        Err(e) => {
            tracing::debug!("Image preparation skipped: {:#}", e);
            payload.to_string()
        }
    }
}

fn reencode(payload: &str, max_width: u32, max_height: u32) -> Result<String> {
    let engine = base64::engine::general_purpose::STANDARD;
    let bytes = engine
        .decode(payload.trim())
        .context("Image payload is not valid base64")?;
    let img = image::load_from_memory(&bytes).context("Failed to decode image")?;
    let img = fit_within(img, max_width, max_height);
    let encoded = encode(&img)?;
    Ok(engine.encode(encoded))
}

/// Downscales with Lanczos3 so both sides fit, keeping the aspect ratio.
pub fn fit_within(img: DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    let (width, height) = (img.width(), img.height());
    if max_width == 0 || max_height == 0 || (width <= max_width && height <= max_height) {
        return img;
    }
    // `resize` preserves aspect ratio and picks the largest size within the bounds.
    img.resize(max_width, max_height, FilterType::Lanczos3)
}

fn encode(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    if img.color().has_alpha() {
        img.write_to(&mut out, ImageFormat::Png)
            .context("Failed to encode PNG")?;
    } else {
        let rgb = img.to_rgb8();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
        encoder
            .encode_image(&rgb)
            .context("Failed to encode JPEG")?;
    }
    Ok(out.into_inner())
}

/// Decodes a base64 image payload (data URIs accepted) to raw bytes.
pub fn decode_base64_image(raw: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(strip_data_uri(raw))
        .context("Image payload is not valid base64")
}

pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn png_base64(img: DynamicImage) -> String {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        encode_base64(&out.into_inner())
    }

    fn decode(b64: &str) -> (DynamicImage, ImageFormat) {
        let bytes = decode_base64_image(b64).unwrap();
        let format = image::guess_format(&bytes).unwrap();
        (image::load_from_memory(&bytes).unwrap(), format)
    }

    #[test]
    fn oversized_opaque_image_shrinks_to_jpeg_with_aspect_kept() {
        let source = png_base64(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            400,
            200,
            Rgb([10, 20, 30]),
        )));
        let prepared = prepare_image(&format!("data:image/png;base64,{}", source), 100, 100);
        let (img, format) = decode(&prepared);
        assert_eq!(format, ImageFormat::Jpeg);
        assert_eq!(img.width(), 100);
        assert!((img.height() as i64 - 50).abs() <= 1);
    }

    #[test]
    fn transparent_image_stays_png() {
        let source = png_base64(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            300,
            300,
            Rgba([0, 0, 0, 0]),
        )));
        let (img, format) = decode(&prepare_image(&source, 150, 120));
        assert_eq!(format, ImageFormat::Png);
        assert_eq!((img.width(), img.height()), (120, 120));
    }

    #[test]
    fn small_images_keep_dimensions() {
        let source = png_base64(DynamicImage::ImageRgb8(RgbImage::new(20, 10)));
        let (img, _) = decode(&prepare_image(&source, 100, 100));
        assert_eq!((img.width(), img.height()), (20, 10));
    }

    #[test]
    fn undecodable_payload_is_returned_without_prefix() {
        assert_eq!(
            prepare_image("data:image/png;base64,Zm9vYmFy", 10, 10),
            "Zm9vYmFy"
        );
        assert_eq!(prepare_image("%%%", 10, 10), "%%%");
    }
}
