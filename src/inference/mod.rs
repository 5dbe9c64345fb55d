//! Inference from trained checkpoints
//!
//! Predictions reuse the preprocessing recorded for the run, so a model is
//! only ever fed images at the resolution it was trained on.

pub mod predictor;

pub use predictor::{expand_inputs, ClassScore, ImageSource, Prediction, Predictor, DEFAULT_TOP_K};
