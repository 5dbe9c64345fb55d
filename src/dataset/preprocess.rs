//! Deterministic image preprocessing shared by training and prediction
//!
//! decode → RGB8 → exact resize (Triangle) → [0, 1] → ImageNet
//! normalisation → CHW `Vec<f32>` of length `3 * size * size`.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};

use crate::utils::error::{PipelineError, Result};

/// ImageNet per-channel mean (RGB)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet per-channel standard deviation (RGB)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Placeholder origin for images supplied as in-memory bytes
const MEMORY_ORIGIN: &str = "<memory>";

/// Image transform bound to one input resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreprocessPipeline {
    image_size: u32,
}

impl PreprocessPipeline {
    pub fn new(image_size: u32) -> Self {
        Self { image_size }
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Number of floats produced per image
    pub fn tensor_len(&self) -> usize {
        3 * self.image_size as usize * self.image_size as usize
    }

    /// Fail unless `target_size` equals this pipeline's resolution
    pub fn check_size(&self, target_size: u32) -> Result<()> {
        if target_size != self.image_size {
            return Err(PipelineError::PreprocessingMismatch {
                run_id: None,
                expected: self.image_size,
                actual: target_size,
            });
        }
        Ok(())
    }

    /// Decode and transform raw image bytes
    pub fn transform(&self, bytes: &[u8], target_size: u32) -> Result<Vec<f32>> {
        self.check_size(target_size)?;
        let img = decode_bytes(bytes, Path::new(MEMORY_ORIGIN))?;
        Ok(self.transform_image(&img))
    }

    /// Load and transform an image file
    pub fn load(&self, path: &Path) -> Result<Vec<f32>> {
        let img = open_image(path)?;
        Ok(self.transform_image(&img))
    }

    /// Transform an already decoded image
    pub fn transform_image(&self, img: &DynamicImage) -> Vec<f32> {
        let size = self.image_size;
        let rgb = img
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();

        let plane = size as usize * size as usize;
        let mut tensor = vec![0.0f32; 3 * plane];

        for (x, y, pixel) in rgb.enumerate_pixels() {
            let offset = y as usize * size as usize + x as usize;
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                tensor[c * plane + offset] = (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }

        tensor
    }
}

/// Decode an image file
pub fn open_image(path: &Path) -> Result<DynamicImage> {
    let unreadable = |reason: String| PipelineError::UnreadableImage {
        path: path.to_path_buf(),
        reason,
    };

    ImageReader::open(path)
        .map_err(|e| unreadable(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| unreadable(e.to_string()))?
        .decode()
        .map_err(|e| unreadable(e.to_string()))
}

/// Decode in-memory image bytes; `origin` is only used in errors
pub fn decode_bytes(bytes: &[u8], origin: &Path) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| PipelineError::UnreadableImage {
        path: PathBuf::from(origin),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_output_shape_and_layout() {
        let pipeline = PreprocessPipeline::new(8);
        let out = pipeline.transform(&png_bytes(20, 12, [255, 0, 0]), 8).unwrap();

        assert_eq!(out.len(), 3 * 8 * 8);
        let plane = 64;
        let red = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let green = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        // resampling a flat colour may be off by one grey level
        assert!((out[0] - red).abs() < 0.02);
        assert!((out[plane] - green).abs() < 0.02);
    }

    #[test]
    fn test_deterministic() {
        let pipeline = PreprocessPipeline::new(16);
        let bytes = png_bytes(31, 17, [10, 200, 90]);
        assert_eq!(
            pipeline.transform(&bytes, 16).unwrap(),
            pipeline.transform(&bytes, 16).unwrap()
        );
    }

    #[test]
    fn test_size_mismatch() {
        let pipeline = PreprocessPipeline::new(16);
        let err = pipeline.transform(&png_bytes(4, 4, [0, 0, 0]), 32).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PreprocessingMismatch {
                run_id: None,
                expected: 16,
                actual: 32
            }
        ));
    }

    #[test]
    fn test_corrupt_bytes() {
        let pipeline = PreprocessPipeline::new(16);
        let err = pipeline.transform(b"definitely not a png", 16).unwrap_err();
        assert!(matches!(err, PipelineError::UnreadableImage { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let pipeline = PreprocessPipeline::new(16);
        let err = pipeline.load(Path::new("/no/such/image.png")).unwrap_err();
        assert!(matches!(err, PipelineError::UnreadableImage { .. }));
    }
}
