use super::{ImageService, ProcessedImage};
use crate::{Error, Result};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

pub const DEFAULT_MAX_DIMENSION: u32 = 1024;
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

pub struct ImageProcessor {
    max_dimension: u32,
    jpeg_quality: u8,
}

impl ImageProcessor {
    pub fn new(max_dimension: u32, jpeg_quality: u8) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    fn encode_sync(image: DynamicImage, max_dimension: u32, quality: u8) -> Result<ProcessedImage> {
        let image = if image.width() > max_dimension || image.height() > max_dimension {
            image.resize(max_dimension, max_dimension, FilterType::Lanczos3)
        } else {
            image
        };

        // JPEG has no alpha channel
        let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
        let mut bytes = Vec::new();
        rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut bytes, quality))?;

        Ok(ProcessedImage {
            bytes,
            mime: "image/jpeg",
        })
    }
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DIMENSION, DEFAULT_JPEG_QUALITY)
    }
}

#[async_trait]
impl ImageService for ImageProcessor {
    async fn process_image(&self, image_data: &[u8]) -> Result<ProcessedImage> {
        let img = image::load_from_memory(image_data)?;
        let max_dimension = self.max_dimension;
        let quality = self.jpeg_quality;

        let processed = tokio::task::spawn_blocking(move || {
            Self::encode_sync(img, max_dimension, quality)
        })
        .await
        .map_err(|e| Error::Invariant(format!("Image processing task join error: {}", e)))??;

        tracing::debug!(
            "Re-encoded {} byte image as {} byte JPEG",
            image_data.len(),
            processed.bytes.len()
        );
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, ImageFormat};

    fn create_test_image(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([255, 0, 0, 255]));
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_large_image_is_scaled_down() {
        let processor = ImageProcessor::new(512, 90);
        let result = processor
            .process_image(&create_test_image(1024, 768))
            .await
            .unwrap();

        assert_eq!(result.mime, "image/jpeg");
        assert_eq!(&result.bytes[..3], &[0xFF, 0xD8, 0xFF]);

        let decoded = image::load_from_memory(&result.bytes).unwrap();
        assert_eq!(decoded.dimensions(), (512, 384));
    }

    #[tokio::test]
    async fn test_small_image_is_not_upscaled() {
        let processor = ImageProcessor::default();
        let result = processor
            .process_image(&create_test_image(10, 10))
            .await
            .unwrap();

        let decoded = image::load_from_memory(&result.bytes).unwrap();
        assert_eq!(decoded.dimensions(), (10, 10));
    }

    #[tokio::test]
    async fn test_undecodable_bytes_fall_back_to_original() {
        let processor = ImageProcessor::default();
        let garbage = b"\x89PNG\r\n\x1a\nnot really a png".to_vec();

        assert!(processor.process_image(&garbage).await.is_err());

        let prepared = processor.prepare(&garbage).await;
        assert_eq!(prepared.bytes, garbage);
        assert_eq!(prepared.mime, "image/png");
    }
}
