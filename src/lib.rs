//! # Food Classifier
//!
//! Reproducible food image classification runs built on the Burn framework.
//!
//! ## Features
//!
//! - **Deterministic indexing**: the same corpus, fraction and seed always
//!   produce the same train/validation split
//! - **Content-addressed runs**: a run's id is derived from its configuration
//! - **Durable checkpoints**: `best` and `last` are published atomically after
//!   every epoch, so an interrupted run leaves usable weights behind
//! - **Consistent inference**: predictions reuse the preprocessing recorded
//!   for the run
//!
//! ## Modules
//!
//! - `dataset`: corpus scanning, splitting, preprocessing and augmentation
//! - `model`: the model capability trait and the Burn CNN implementing it
//! - `run`: run configuration, records and summaries
//! - `checkpoint`: checkpoint persistence and run locking
//! - `training`: the training loop
//! - `inference`: prediction from a checkpoint
//! - `utils`: errors and logging
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use food_classifier::backend::{default_device, TrainingBackend};
//! use food_classifier::{build_classifier, index, RunConfig, Trainer, TrainOptions};
//! use food_classifier::{CheckpointStore, RunStore};
//!
//! let config = RunConfig::new(10, 224, 0.25).with_seed(7);
//! let split = index("data/food-101/images", config.fraction, config.seed)?;
//! let model = build_classifier::<TrainingBackend>(&config, split.num_classes(), &default_device())?;
//!
//! let mut trainer = Trainer::new(CheckpointStore::new("runs"), RunStore::new("runs"), TrainOptions::default());
//! let summary = trainer.train(&config, &split, model)?;
//! ```

pub mod backend;
pub mod checkpoint;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod run;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use checkpoint::{Checkpoint, CheckpointName, CheckpointStore, RunLock};
pub use dataset::{index, index_with, CorpusIndex, DatasetSplit, IndexConfig, PreprocessPipeline, Sample};
pub use inference::{ImageSource, Prediction, Predictor};
pub use model::{build_classifier, BurnClassifier, ImageBatch, ImageModel, ModelState};
pub use run::{derive_run_id, finalize, EpochMetric, RunConfig, RunStatus, RunStore, RunSummary};
pub use training::{CancelToken, TrainOptions, Trainer, TrainerState, TrainingObserver};
pub use utils::error::{ErrorKind, PipelineError, Result};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
