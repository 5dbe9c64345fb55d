//! Training

pub mod trainer;

pub use trainer::{CancelToken, TrainOptions, Trainer, TrainerState, TrainingObserver};
