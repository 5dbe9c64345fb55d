#![allow(dead_code)]

use std::cell::Cell;
use std::fs;
use std::path::Path;

use image::{Rgb, RgbImage};

use food_classifier::model::BatchEval;
use food_classifier::training::CancelToken;
use food_classifier::{ImageBatch, ImageModel, ModelState, PipelineError, Result};

/// Write `per_class` tiny PNGs into `root/<class>/` for every class
///
/// Pixel colours differ per class and per image so decoded tensors differ.
pub fn write_corpus(root: &Path, classes: &[&str], per_class: usize) {
    for (c, class) in classes.iter().enumerate() {
        let dir = root.join(class);
        fs::create_dir_all(&dir).unwrap();
        for i in 0..per_class {
            let shade = ((i * 7 + c * 90) % 256) as u8;
            let img = RgbImage::from_pixel(8, 8, Rgb([shade, (c * 120) as u8, 255 - shade]));
            img.save(dir.join(format!("{:03}.png", i))).unwrap();
        }
    }
}

/// Overwrite an indexed image with bytes no decoder accepts
pub fn corrupt(path: &Path) {
    fs::write(path, b"\x89PNG truncated").unwrap();
}

/// A model whose validation accuracy per epoch is scripted
///
/// Every `train_step` counts as one epoch, so tests run it with a batch
/// size covering the whole training set. The weights are the number of
/// completed train steps.
pub struct ScriptedModel {
    pub accuracies: Vec<f64>,
    pub steps: usize,
    /// Cancel this token once `steps` reaches the given count
    pub cancel_after: Option<(usize, CancelToken)>,
    /// Return a NaN loss on this step
    pub nan_at: Option<usize>,
    /// Fail to export weights once this many steps have run
    pub fail_state_at: Option<usize>,
    pub evaluations: Cell<usize>,
}

impl ScriptedModel {
    pub fn new(accuracies: Vec<f64>) -> Self {
        Self {
            accuracies,
            steps: 0,
            cancel_after: None,
            nan_at: None,
            fail_state_at: None,
            evaluations: Cell::new(0),
        }
    }

    pub fn cancel_after(mut self, steps: usize, token: CancelToken) -> Self {
        self.cancel_after = Some((steps, token));
        self
    }

    pub fn nan_at(mut self, step: usize) -> Self {
        self.nan_at = Some(step);
        self
    }

    pub fn fail_state_at(mut self, step: usize) -> Self {
        self.fail_state_at = Some(step);
        self
    }
}

impl ImageModel for ScriptedModel {
    fn train_step(&mut self, _batch: &ImageBatch) -> Result<f64> {
        self.steps += 1;
        if let Some((after, token)) = &self.cancel_after {
            if self.steps >= *after {
                token.cancel();
            }
        }
        if self.nan_at == Some(self.steps) {
            return Ok(f64::NAN);
        }
        Ok(1.0 / self.steps as f64)
    }

    fn evaluate(&self, batch: &ImageBatch) -> Result<BatchEval> {
        self.evaluations.set(self.evaluations.get() + 1);
        let acc = self
            .accuracies
            .get(self.steps.saturating_sub(1))
            .copied()
            .unwrap_or(0.0);
        Ok(BatchEval {
            loss: 1.0 - acc,
            correct: (acc * batch.len() as f64).round() as usize,
            total: batch.len(),
        })
    }

    fn predict_proba(&self, batch: &ImageBatch) -> Result<Vec<Vec<f32>>> {
        let per_image = 3 * batch.image_size as usize * batch.image_size as usize;
        Ok(batch
            .images
            .chunks(per_image)
            .map(|pixels| {
                let mean = pixels.iter().sum::<f32>() / pixels.len() as f32;
                let p = 1.0 / (1.0 + (-mean).exp());
                vec![p, 1.0 - p]
            })
            .collect())
    }

    fn state_dict(&self) -> Result<ModelState> {
        if self.fail_state_at == Some(self.steps) {
            return Err(PipelineError::Model("weights export failed".to_string()));
        }
        Ok(ModelState(vec![self.steps as u8]))
    }

    fn load_state_dict(&mut self, state: &ModelState) -> Result<()> {
        match state.0.as_slice() {
            [steps] => {
                self.steps = *steps as usize;
                Ok(())
            }
            _ => Err(PipelineError::Model("unexpected scripted state".to_string())),
        }
    }
}
