use super::{ImageService, ProcessedImage};
use crate::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Passes bytes through unchanged (or fails on demand) and counts calls.
pub struct MockImageProcessor {
    process_count: Arc<Mutex<usize>>,
    should_fail: Arc<Mutex<bool>>,
}

impl MockImageProcessor {
    pub fn new() -> Self {
        Self {
            process_count: Arc::new(Mutex::new(0)),
            should_fail: Arc::new(Mutex::new(false)),
        }
    }

    pub fn with_failure(self, should_fail: bool) -> Self {
        *self.should_fail.lock().unwrap() = should_fail;
        self
    }

    pub fn get_process_count(&self) -> usize {
        *self.process_count.lock().unwrap()
    }
}

impl Default for MockImageProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageService for MockImageProcessor {
    async fn process_image(&self, image_data: &[u8]) -> Result<ProcessedImage> {
        *self.process_count.lock().unwrap() += 1;

        if *self.should_fail.lock().unwrap() {
            return Err(crate::Error::Image(image::ImageError::IoError(
                std::io::Error::other("Mock failure"),
            )));
        }

        Ok(ProcessedImage::original(image_data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_passes_bytes_through() {
        let processor = MockImageProcessor::new();
        let result = processor.process_image(b"GIF89a-data").await.unwrap();

        assert_eq!(result.bytes, b"GIF89a-data".to_vec());
        assert_eq!(result.mime, "image/gif");
        assert_eq!(processor.get_process_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_failure_still_prepares_original() {
        let processor = MockImageProcessor::new().with_failure(true);

        assert!(processor.process_image(b"data").await.is_err());
        let prepared = processor.prepare(b"data").await;
        assert_eq!(prepared.bytes, b"data".to_vec());
        assert_eq!(processor.get_process_count(), 2);
    }
}
