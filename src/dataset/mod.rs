//! Dataset handling for the food corpus
//!
//! - `loader`: discover classes and usable images under a corpus root
//! - `split`: seeded per-class subsampling into train and validation sets
//! - `preprocess`: decode, resize and normalise images into CHW tensors
//! - `augmentation`: seeded training-time augmentation

pub mod augmentation;
pub mod loader;
pub mod preprocess;
pub mod split;

pub use augmentation::{AugmentationConfig, Augmenter};
pub use loader::{CorpusIndex, DatasetStats, Sample, IMAGE_EXTENSIONS};
pub use preprocess::{PreprocessPipeline, IMAGENET_MEAN, IMAGENET_STD};
pub use split::{index, index_with, DatasetSplit, IndexConfig, SplitStats, DEFAULT_VAL_RATIO};
