use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, Rgba, RgbaImage};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Image has zero width or height")]
    ZeroSized,
    #[error("Normalization worker failed: {0}")]
    Worker(String),
    #[error("Normalization exceeded {0:?}")]
    Timeout(Duration),
    #[error("Failed to encode processed image: {0}")]
    Encode(String),
}

/// Rescale + contrast/brightness pass that makes low-contrast photos easier to read.
#[derive(Debug, Clone)]
pub struct ImageNormalizer {
    /// Images wider or taller than this are passed through untouched.
    pub max_dimension: u32,
    pub scale: f32,
    pub contrast: f32,
    pub brightness: f32,
    pub deadline: Duration,
}

impl Default for ImageNormalizer {
    fn default() -> Self {
        Self {
            max_dimension: 2000,
            scale: 1.5,
            contrast: 1.1,
            brightness: 1.05,
            deadline: Duration::from_secs(10),
        }
    }
}

impl ImageNormalizer {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self { deadline, ..Self::default() }
    }

    pub fn bypasses(&self, img: &DynamicImage) -> bool {
        img.width() > self.max_dimension || img.height() > self.max_dimension
    }

    /// Normalize on a blocking thread, bounded by `self.deadline`.
    ///
    /// Always resolves to an image: on timeout or error the original is returned
    /// (same `Arc`), so callers can tell with `Arc::ptr_eq` whether anything changed.
    pub async fn normalize(&self, img: Arc<DynamicImage>) -> Arc<DynamicImage> {
        if self.bypasses(&img) {
            debug!(width = img.width(), height = img.height(), "image above size threshold, skipping normalization");
            return img;
        }

        let worker = {
            let this = self.clone();
            let img = Arc::clone(&img);
            tokio::task::spawn_blocking(move || this.enhance(&img))
        };

        let result = match tokio::time::timeout(self.deadline, worker).await {
            Ok(Ok(inner)) => inner,
            Ok(Err(join)) => Err(NormalizeError::Worker(join.to_string())),
            Err(_) => Err(NormalizeError::Timeout(self.deadline)),
        };

        match result {
            Ok(out) => Arc::new(out),
            Err(e) => {
                warn!("Image normalization failed, using original image: {e}");
                img
            }
        }
    }

    /// Synchronous core of [`normalize`](Self::normalize): scale up, then apply the
    /// contrast/brightness curve to every colour channel.
    pub fn enhance(&self, img: &DynamicImage) -> Result<DynamicImage, NormalizeError> {
        if img.width() == 0 || img.height() == 0 {
            return Err(NormalizeError::ZeroSized);
        }
        let width = ((img.width() as f32) * self.scale).round().max(1.0) as u32;
        let height = ((img.height() as f32) * self.scale).round().max(1.0) as u32;
        let scaled = img.resize_exact(width, height, FilterType::Triangle).to_rgba8();

        let lut = tone_curve(self.contrast, self.brightness);
        let toned: RgbaImage = ImageBuffer::from_fn(width, height, |x, y| {
            let Rgba([r, g, b, a]) = *scaled.get_pixel(x, y);
            Rgba([lut[r as usize], lut[g as usize], lut[b as usize], a])
        });

        Ok(DynamicImage::ImageRgba8(toned))
    }
}

/// Contrast pivots on mid-grey, brightness multiplies, result clamped to 0..=255.
fn tone_curve(contrast: f32, brightness: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    for (v, out) in lut.iter_mut().enumerate() {
        let x = v as f32 / 255.0;
        let y = (((x - 0.5) * contrast + 0.5) * brightness).clamp(0.0, 1.0);
        *out = (y * 255.0).round() as u8;
    }
    lut
}

pub fn encode_as_png(img: &DynamicImage) -> Result<Vec<u8>, NormalizeError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| NormalizeError::Encode(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn solid_gray(width: u32, height: u32, value: u8) -> DynamicImage {
        let img: GrayImage = ImageBuffer::from_fn(width, height, |_, _| Luma([value]));
        DynamicImage::ImageLuma8(img)
    }

    #[test]
    fn tone_curve_endpoints() {
        let lut = tone_curve(1.1, 1.05);
        assert_eq!(lut[0], 0);
        assert_eq!(lut[255], 255);
        // Mid-grey is only brightened.
        assert_eq!(lut[128], 134);
    }

    #[test]
    fn identity_curve_is_identity() {
        let lut = tone_curve(1.0, 1.0);
        assert!(lut.iter().enumerate().all(|(i, v)| *v as usize == i));
    }

    #[test]
    fn enhance_scales_by_one_and_a_half() {
        let out = ImageNormalizer::default().enhance(&solid_gray(100, 40, 128)).unwrap();
        assert_eq!((out.width(), out.height()), (150, 60));
        assert_eq!(out.to_rgba8().get_pixel(75, 30).0, [134, 134, 134, 255]);
    }

    #[test]
    fn enhance_rejects_zero_sized() {
        let err = ImageNormalizer::default().enhance(&solid_gray(0, 10, 0)).unwrap_err();
        assert!(matches!(err, NormalizeError::ZeroSized));
    }

    #[tokio::test]
    async fn large_image_returned_unchanged() {
        let img = Arc::new(solid_gray(3000, 4000, 200));
        let out = ImageNormalizer::default().normalize(Arc::clone(&img)).await;
        assert!(Arc::ptr_eq(&img, &out));
        assert_eq!((out.width(), out.height()), (3000, 4000));
    }

    #[tokio::test]
    async fn small_image_is_normalized() {
        let img = Arc::new(solid_gray(20, 20, 60));
        let out = ImageNormalizer::default().normalize(Arc::clone(&img)).await;
        assert!(!Arc::ptr_eq(&img, &out));
        assert_eq!(out.width(), 30);
    }

    #[tokio::test]
    async fn failure_falls_back_to_original() {
        let img = Arc::new(solid_gray(0, 0, 0));
        let out = ImageNormalizer::default().normalize(Arc::clone(&img)).await;
        assert!(Arc::ptr_eq(&img, &out));
    }

    #[tokio::test]
    async fn deadline_falls_back_to_original() {
        // Just under the bypass threshold: the 1.5x resize takes far longer than 1ms.
        let img = Arc::new(solid_gray(1999, 1999, 90));
        let out = ImageNormalizer::with_deadline(Duration::from_millis(1))
            .normalize(Arc::clone(&img))
            .await;
        assert!(Arc::ptr_eq(&img, &out));
    }

    #[test]
    fn encode_produces_png_header() {
        let png = encode_as_png(&solid_gray(4, 4, 100)).unwrap();
        assert_eq!(&png[..4], b"\x89PNG");
    }
}
