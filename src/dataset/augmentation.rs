//! Training-time image augmentation
//!
//! Applied to decoded images before the shared preprocessing transform,
//! and only on the training path.

use image::{DynamicImage, Rgb, RgbImage};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Augmentation probabilities and strengths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    /// Probability of horizontal flip
    pub horizontal_flip_prob: f32,
    /// Maximum brightness shift as a fraction of full scale
    pub brightness_delta: f32,
    /// Probability of a brightness shift
    pub brightness_prob: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            horizontal_flip_prob: 0.5,
            brightness_delta: 0.2,
            brightness_prob: 0.5,
        }
    }
}

impl AugmentationConfig {
    /// Disable all augmentations
    pub fn none() -> Self {
        Self {
            horizontal_flip_prob: 0.0,
            brightness_delta: 0.0,
            brightness_prob: 0.0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.horizontal_flip_prob > 0.0 || (self.brightness_prob > 0.0 && self.brightness_delta > 0.0)
    }
}

/// Applies random flips and brightness jitter
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(AugmentationConfig::default())
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// Apply the configured augmentations to an image
    pub fn augment(&self, img: DynamicImage, rng: &mut ChaCha8Rng) -> DynamicImage {
        let mut result = img;

        if self.config.horizontal_flip_prob > 0.0
            && rng.gen::<f32>() < self.config.horizontal_flip_prob
        {
            result = result.fliph();
        }

        if self.config.brightness_prob > 0.0
            && self.config.brightness_delta > 0.0
            && rng.gen::<f32>() < self.config.brightness_prob
        {
            let delta =
                rng.gen_range(-self.config.brightness_delta..=self.config.brightness_delta);
            result = adjust_brightness(&result, delta);
        }

        result
    }
}

/// Shift every channel by `delta * 255`, saturating at the ends
fn adjust_brightness(img: &DynamicImage, delta: f32) -> DynamicImage {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let shift = (delta * 255.0) as i32;

    let mut output = RgbImage::new(width, height);
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let [r, g, b] = pixel.0.map(|v| (v as i32 + shift).clamp(0, 255) as u8);
        output.put_pixel(x, y, Rgb([r, g, b]));
    }

    DynamicImage::ImageRgb8(output)
}
