use image::{DynamicImage, ImageFormat};
use thiserror::Error;

pub const MIN_SOURCE_BYTES: usize = 1024;
pub const MAX_SOURCE_BYTES: usize = 10 * 1024 * 1024;

const ACCEPTED_FORMATS: [ImageFormat; 6] = [
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Gif,
    ImageFormat::WebP,
    ImageFormat::Bmp,
    ImageFormat::Tiff,
];

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Please select an image file (JPG, PNG, GIF, WEBP, BMP or TIFF)")]
    NotAnImage,
    #[error("File size too small ({0} bytes). Please select a valid image file.")]
    TooSmall(usize),
    #[error("File size too large ({0} bytes). Please select an image smaller than 10MB.")]
    TooLarge(usize),
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Gatekeeper run before a file enters the scan pipeline: content-sniffed image
/// type first, then the 1 KiB – 10 MiB size window.
pub fn validate_source(data: &[u8]) -> Result<ImageFormat, IntakeError> {
    let format = sniff_format(data).ok_or(IntakeError::NotAnImage)?;
    if data.len() < MIN_SOURCE_BYTES {
        return Err(IntakeError::TooSmall(data.len()));
    }
    if data.len() > MAX_SOURCE_BYTES {
        return Err(IntakeError::TooLarge(data.len()));
    }
    Ok(format)
}

pub fn sniff_format(data: &[u8]) -> Option<ImageFormat> {
    image::guess_format(data)
        .ok()
        .filter(|f| ACCEPTED_FORMATS.contains(f))
}

/// Mime type for the sniffed content, `application/octet-stream` when unknown.
pub fn mime_type(data: &[u8]) -> &'static str {
    sniff_format(data).map_or("application/octet-stream", |f| f.to_mime_type())
}

pub fn decode(data: &[u8]) -> Result<DynamicImage, IntakeError> {
    Ok(image::load_from_memory(data)?)
}
