//! Post-processing of generated images before delivery
//!
//! Large results are scaled down and re-encoded as JPEG so chat clients get
//! a reasonably sized photo. Processing is best effort: if the bytes cannot
//! be decoded the original payload is delivered untouched.

pub mod mock;
pub mod processor;

pub use mock::MockImageProcessor;
pub use processor::ImageProcessor;

use crate::mime::detect_image_mime;
use crate::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedImage {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
}

impl ProcessedImage {
    /// Wrap bytes that are delivered as-is.
    pub fn original(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            mime: detect_image_mime(bytes).unwrap_or("application/octet-stream"),
        }
    }
}

#[async_trait]
pub trait ImageService: Send + Sync {
    async fn process_image(&self, image_data: &[u8]) -> Result<ProcessedImage>;

    /// Like `process_image`, but falls back to the original bytes on failure.
    async fn prepare(&self, image_data: &[u8]) -> ProcessedImage {
        match self.process_image(image_data).await {
            Ok(processed) => processed,
            Err(e) => {
                tracing::warn!("Image processing failed, sending original: {}", e);
                ProcessedImage::original(image_data)
            }
        }
    }
}
