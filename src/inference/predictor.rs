//! Prediction from a persisted checkpoint
//!
//! A [`Predictor`] is read-only: it loads one checkpoint, verifies that the
//! resolution matches the run's recorded configuration and then applies
//! the same preprocessing the model was trained with.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{CheckpointName, CheckpointStore};
use crate::dataset::preprocess::{decode_bytes, PreprocessPipeline};
use crate::model::{ImageBatch, ImageModel};
use crate::run::{RunConfig, RunStore};
use crate::utils::error::{PipelineError, Result};

/// Number of ranked classes reported per prediction by default
pub const DEFAULT_TOP_K: usize = 5;

/// An image to classify
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Image file on disk
    Path(PathBuf),
    /// Encoded image bytes (PNG, JPEG, ...)
    Bytes(Vec<u8>),
}

impl ImageSource {
    /// Path for display and errors
    pub fn describe(&self) -> PathBuf {
        match self {
            ImageSource::Path(path) => path.clone(),
            ImageSource::Bytes(_) => PathBuf::from("<memory>"),
        }
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        ImageSource::Path(path.to_path_buf())
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        ImageSource::Bytes(bytes)
    }
}

/// One ranked class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    pub class_index: usize,
    pub label: String,
    pub probability: f32,
}

/// Classification of one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Predicted class name
    pub label: String,
    pub class_index: usize,
    /// Probability of the predicted class, in [0, 1]
    pub confidence: f32,
    /// Highest-probability classes, best first
    pub top_k: Vec<ClassScore>,
}

impl Prediction {
    /// Build a prediction from one row of class probabilities
    ///
    /// Ties resolve to the lowest class index.
    pub fn from_probabilities(probabilities: &[f32], classes: &[String], top_k: usize) -> Self {
        let mut ranked: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let (class_index, confidence) = ranked.first().copied().unwrap_or((0, 0.0));
        let label_of = |idx: usize| {
            classes
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", idx))
        };

        Self {
            label: label_of(class_index),
            class_index,
            confidence: confidence.clamp(0.0, 1.0),
            top_k: ranked
                .iter()
                .take(top_k.max(1))
                .map(|&(idx, p)| ClassScore {
                    class_index: idx,
                    label: label_of(idx),
                    probability: p.clamp(0.0, 1.0),
                })
                .collect(),
        }
    }
}

/// Loaded checkpoint ready to classify images
pub struct Predictor<M: ImageModel> {
    model: M,
    run_id: String,
    checkpoint: CheckpointName,
    epoch: usize,
    classes: Vec<String>,
    pipeline: PreprocessPipeline,
    batch_size: usize,
    top_k: usize,
}

impl<M: ImageModel> Predictor<M> {
    /// Load checkpoint `name` of `run_id`
    ///
    /// `factory` builds an untrained model for the run's configuration and
    /// class count; the checkpoint weights are then loaded into it.
    pub fn open<F>(
        checkpoints: &CheckpointStore,
        runs: &RunStore,
        run_id: &str,
        name: CheckpointName,
        factory: F,
    ) -> Result<Self>
    where
        F: FnOnce(&RunConfig, usize) -> Result<M>,
    {
        let config = runs.read_config(run_id)?;
        let checkpoint = checkpoints.load(run_id, name)?;

        if checkpoint.image_size != config.image_size {
            return Err(PipelineError::PreprocessingMismatch {
                run_id: Some(run_id.to_string()),
                expected: config.image_size,
                actual: checkpoint.image_size,
            });
        }
        if checkpoint.classes.is_empty() {
            return Err(PipelineError::CorruptArtifact {
                path: checkpoints.checkpoint_path(run_id, name),
                reason: "checkpoint records no classes".to_string(),
            });
        }

        let mut model = factory(&config, checkpoint.classes.len())?;
        model.load_state_dict(&checkpoint.model_state)?;

        info!(
            "Predictor ready: run {} checkpoint {} (epoch {}, {} classes, {}px)",
            run_id,
            name,
            checkpoint.epoch,
            checkpoint.classes.len(),
            config.image_size
        );

        Ok(Self {
            model,
            run_id: run_id.to_string(),
            checkpoint: name,
            epoch: checkpoint.epoch,
            classes: checkpoint.classes,
            pipeline: PreprocessPipeline::new(config.image_size),
            batch_size: config.batch_size().max(1),
            top_k: DEFAULT_TOP_K,
        })
    }

    /// Declare the image size the caller expects; it must match the run's
    pub fn with_image_size(self, image_size: u32) -> Result<Self> {
        if image_size != self.pipeline.image_size() {
            return Err(PipelineError::PreprocessingMismatch {
                run_id: Some(self.run_id.clone()),
                expected: self.pipeline.image_size(),
                actual: image_size,
            });
        }
        Ok(self)
    }

    /// Number of images sent to the model at once
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn checkpoint(&self) -> CheckpointName {
        self.checkpoint
    }

    /// Epoch the loaded weights come from
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn image_size(&self) -> u32 {
        self.pipeline.image_size()
    }

    /// Classify every input; each slot holds its own result
    ///
    /// The output has the same length and order as `inputs`. A failing
    /// input only affects its own slot.
    pub fn predict(&self, inputs: &[ImageSource]) -> Vec<Result<Prediction>> {
        let pipeline = self.pipeline;
        let tensors: Vec<Result<Vec<f32>>> = inputs
            .par_iter()
            .map(|source| match source {
                ImageSource::Path(path) => pipeline.load(path),
                ImageSource::Bytes(bytes) => {
                    decode_bytes(bytes, &source.describe()).map(|img| pipeline.transform_image(&img))
                }
            })
            .collect();

        let mut results: Vec<Option<Result<Prediction>>> = Vec::with_capacity(inputs.len());
        let mut pending: Vec<(usize, Vec<f32>)> = Vec::new();
        for (idx, tensor) in tensors.into_iter().enumerate() {
            match tensor {
                Ok(tensor) => {
                    results.push(None);
                    pending.push((idx, tensor));
                }
                Err(e) => results.push(Some(Err(e))),
            }
        }

        let mut pending = pending.into_iter().peekable();
        while pending.peek().is_some() {
            let chunk: Vec<(usize, Vec<f32>)> = pending.by_ref().take(self.batch_size).collect();
            let slots: Vec<usize> = chunk.iter().map(|(idx, _)| *idx).collect();
            let items = chunk.into_iter().map(|(_, tensor)| (tensor, 0)).collect();

            match ImageBatch::from_items(items, self.pipeline.image_size())
                .and_then(|batch| self.model.predict_proba(&batch))
            {
                Ok(rows) if rows.len() == slots.len() => {
                    for (slot, row) in slots.into_iter().zip(rows) {
                        results[slot] =
                            Some(Ok(Prediction::from_probabilities(&row, &self.classes, self.top_k)));
                    }
                }
                Ok(rows) => {
                    let reason = format!(
                        "model returned {} rows for {} images",
                        rows.len(),
                        slots.len()
                    );
                    for slot in slots {
                        results[slot] = Some(Err(failed(&inputs[slot], &reason)));
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    for slot in slots {
                        results[slot] = Some(Err(failed(&inputs[slot], &reason)));
                    }
                }
            }
        }

        debug!("Predicted {} images", inputs.len());
        results
            .into_iter()
            .zip(inputs)
            .map(|(r, input)| r.unwrap_or_else(|| Err(failed(input, "image was not classified"))))
            .collect()
    }

    /// Classify every input or fail with the first error
    pub fn predict_all(&self, inputs: &[ImageSource]) -> Result<Vec<Prediction>> {
        self.predict(inputs).into_iter().collect()
    }

    /// Classify a single image
    pub fn predict_one(&self, input: &ImageSource) -> Result<Prediction> {
        self.predict(std::slice::from_ref(input))
            .pop()
            .unwrap_or_else(|| Err(failed(input, "no prediction produced")))
    }
}

fn failed(input: &ImageSource, reason: &str) -> PipelineError {
    PipelineError::PredictionFailed {
        input: input.describe(),
        reason: reason.to_string(),
    }
}

/// Expand directories into the image files they contain (sorted)
pub fn expand_inputs(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = walkdir::WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| crate::dataset::loader::has_image_extension(p))
                .collect();
            found.sort();
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }
    files
}
