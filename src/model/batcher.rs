//! Burn batcher turning preprocessed image batches into tensors
//!
//! Pixels arrive already normalised by the preprocessing pipeline, so the
//! batcher only stacks them.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

use super::ImageBatch;

/// A batch of food images on a Burn device
#[derive(Clone, Debug)]
pub struct FoodBatch<B: Backend> {
    /// Images with shape [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// Labels with shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// Concatenates [`ImageBatch`]es into one tensor batch
#[derive(Clone, Debug, Default)]
pub struct FoodBatcher;

impl FoodBatcher {
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> Batcher<B, ImageBatch, FoodBatch<B>> for FoodBatcher {
    fn batch(&self, items: Vec<ImageBatch>, device: &B::Device) -> FoodBatch<B> {
        let size = items.first().map(|b| b.image_size as usize).unwrap_or(0);
        let batch_size: usize = items.iter().map(ImageBatch::len).sum();

        let mut pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut labels = Vec::with_capacity(batch_size);
        for item in items {
            pixels.extend(item.images);
            labels.extend(item.labels.into_iter().map(|l| l as i64));
        }

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(pixels, [batch_size, 3, size, size]),
            device,
        );
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [batch_size]), device);

        FoodBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DefaultBackend;

    #[test]
    fn test_batch_shapes() {
        let device = Default::default();
        let per_image = 3 * 4 * 4;
        let a = ImageBatch::from_items(vec![(vec![0.1; per_image], 2)], 4).unwrap();
        let b = ImageBatch::from_items(
            vec![(vec![0.2; per_image], 0), (vec![0.3; per_image], 1)],
            4,
        )
        .unwrap();

        let batch: FoodBatch<DefaultBackend> = FoodBatcher::new().batch(vec![a, b], &device);
        assert_eq!(batch.images.dims(), [3, 3, 4, 4]);

        let targets: Vec<i64> = batch.targets.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(targets, vec![2, 0, 1]);
    }
}
