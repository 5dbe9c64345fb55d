//! Model backend
//!
//! The trainer and predictor only see the [`ImageModel`] capability trait.
//! [`BurnClassifier`] is the shipped implementation: a small CNN trained
//! with Adam on any Burn autodiff backend.

pub mod batcher;
pub mod classifier;
pub mod cnn;

use serde::{Deserialize, Serialize};

use crate::dataset::preprocess::PreprocessPipeline;
use crate::utils::error::{PipelineError, Result};

pub use batcher::{FoodBatch, FoodBatcher};
pub use classifier::{build_classifier, BurnClassifier};
pub use cnn::{FoodClassifier, FoodClassifierConfig};

/// A backend-agnostic batch of preprocessed images
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    /// Flattened NCHW pixels, `len() * 3 * image_size²` values
    pub images: Vec<f32>,
    /// Class index per image
    pub labels: Vec<usize>,
    /// Side length of every image
    pub image_size: u32,
}

impl ImageBatch {
    /// Assemble a batch from per-image CHW tensors
    pub fn from_items(items: Vec<(Vec<f32>, usize)>, image_size: u32) -> Result<Self> {
        let per_image = PreprocessPipeline::new(image_size).tensor_len();
        let mut images = Vec::with_capacity(items.len() * per_image);
        let mut labels = Vec::with_capacity(items.len());

        for (pixels, label) in items {
            if pixels.len() != per_image {
                return Err(PipelineError::Model(format!(
                    "image tensor has {} values, expected {} for size {}",
                    pixels.len(),
                    per_image,
                    image_size
                )));
            }
            images.extend(pixels);
            labels.push(label);
        }

        Ok(Self {
            images,
            labels,
            image_size,
        })
    }

    /// Number of images in the batch
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Result of evaluating one batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchEval {
    /// Mean loss over the batch
    pub loss: f64,
    /// Correct top-1 predictions
    pub correct: usize,
    /// Images evaluated
    pub total: usize,
}

/// Opaque serialized model weights
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelState(pub Vec<u8>);

/// A trainable image classifier
pub trait ImageModel {
    /// Forward and backward pass plus one optimizer update; returns the mean loss
    fn train_step(&mut self, batch: &ImageBatch) -> Result<f64>;

    /// Loss and accuracy without updating weights
    fn evaluate(&self, batch: &ImageBatch) -> Result<BatchEval>;

    /// Class probabilities per image, each row summing to one
    fn predict_proba(&self, batch: &ImageBatch) -> Result<Vec<Vec<f32>>>;

    /// Snapshot of the current weights
    fn state_dict(&self) -> Result<ModelState>;

    /// Replace the current weights
    fn load_state_dict(&mut self, state: &ModelState) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_from_items() {
        let per_image = 3 * 2 * 2;
        let batch = ImageBatch::from_items(
            vec![(vec![0.5; per_image], 1), (vec![-0.5; per_image], 0)],
            2,
        )
        .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.images.len(), 2 * per_image);
        assert_eq!(batch.labels, vec![1, 0]);
    }

    #[test]
    fn test_batch_rejects_wrong_size() {
        let err = ImageBatch::from_items(vec![(vec![0.0; 5], 0)], 2).unwrap_err();
        assert!(matches!(err, PipelineError::Model(_)));
    }
}
