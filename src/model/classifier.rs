//! Burn implementation of [`ImageModel`]
//!
//! Training runs on the autodiff backend; evaluation and prediction run on
//! `model.valid()`, so dropout is off and BatchNorm uses its running stats.

use std::sync::Mutex;

use burn::{
    data::dataloader::batcher::Batcher,
    module::{AutodiffModule, Module},
    nn::loss::CrossEntropyLossConfig,
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use tracing::debug;

use super::batcher::{FoodBatch, FoodBatcher};
use super::cnn::{FoodClassifier, FoodClassifierConfig, MIN_INPUT_SIZE};
use super::{BatchEval, ImageBatch, ImageModel, ModelState};
use crate::run::config::RunConfig;
use crate::utils::error::{PipelineError, Result};

type StateRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// FoodClassifier plus its optimizer
pub struct BurnClassifier<B: AutodiffBackend, O> {
    model: FoodClassifier<B>,
    optim: O,
    learning_rate: f64,
    num_classes: usize,
    device: B::Device,
    batcher: FoodBatcher,
}

/// Held while the backend RNG is seeded and the weights drawn
///
/// `Backend::seed` sets process-wide state, so two models built at the same
/// time would otherwise interleave their draws.
static MODEL_INIT: Mutex<()> = Mutex::new(());

/// Build a freshly initialised classifier for a run
///
/// Seeds the backend with the run seed so initial weights are
/// reproducible for a given configuration. Construction is serialised
/// across threads; other code that draws from the backend RNG while a
/// model is being built can still shift its weights.
pub fn build_classifier<B: AutodiffBackend>(
    config: &RunConfig,
    num_classes: usize,
    device: &B::Device,
) -> Result<BurnClassifier<B, impl Optimizer<FoodClassifier<B>, B>>> {
    if (config.image_size as usize) < MIN_INPUT_SIZE {
        return Err(PipelineError::InvalidConfig(format!(
            "image_size must be at least {} for the CNN, got {}",
            MIN_INPUT_SIZE, config.image_size
        )));
    }
    if num_classes == 0 {
        return Err(PipelineError::InvalidConfig(
            "cannot build a classifier with zero classes".to_string(),
        ));
    }

    let model_config = FoodClassifierConfig::new(num_classes)
        .with_input_size(config.image_size as usize)
        .with_dropout_rate(config.dropout())
        .with_base_filters(config.base_filters());
    let model = {
        // Poisoning only means another build panicked
        let _guard = MODEL_INIT.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        B::seed(config.seed);
        model_config.init::<B>(device)
    };

    let optim = AdamConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay() as f32)))
        .init::<B, FoodClassifier<B>>();

    debug!(
        "Built classifier: {} classes, {} parameters",
        num_classes,
        model.num_params()
    );

    Ok(BurnClassifier {
        model,
        optim,
        learning_rate: config.learning_rate(),
        num_classes,
        device: device.clone(),
        batcher: FoodBatcher::new(),
    })
}

impl<B: AutodiffBackend, O> BurnClassifier<B, O> {
    /// Number of output classes
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn eval_batch(&self, batch: &ImageBatch) -> FoodBatch<B::InnerBackend> {
        self.batcher.batch(vec![batch.clone()], &self.device)
    }
}

/// Count of argmax predictions equal to the targets
fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [n, _] = logits.dims();
    let predictions = logits.argmax(1).reshape([n]);
    let correct: i64 = predictions.equal(targets).int().sum().into_scalar().elem();
    correct as usize
}

impl<B, O> ImageModel for BurnClassifier<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<FoodClassifier<B>, B>,
{
    fn train_step(&mut self, batch: &ImageBatch) -> Result<f64> {
        if batch.is_empty() {
            return Err(PipelineError::Model("empty training batch".to_string()));
        }

        let batch: FoodBatch<B> = self.batcher.batch(vec![batch.clone()], &self.device);
        let logits = self.model.forward(batch.images);
        let loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits, batch.targets);

        let loss_value: f64 = loss.clone().into_scalar().elem();
        if !loss_value.is_finite() {
            return Ok(loss_value);
        }

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self
            .optim
            .step(self.learning_rate, self.model.clone(), grads);

        Ok(loss_value)
    }

    fn evaluate(&self, batch: &ImageBatch) -> Result<BatchEval> {
        if batch.is_empty() {
            return Ok(BatchEval {
                loss: 0.0,
                correct: 0,
                total: 0,
            });
        }

        let model = self.model.valid();
        let batch = self.eval_batch(batch);
        let total = batch.targets.dims()[0];

        let logits = model.forward(batch.images);
        let loss: f64 = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), batch.targets.clone())
            .into_scalar()
            .elem();
        let correct = count_correct(logits, batch.targets);

        Ok(BatchEval {
            loss,
            correct,
            total,
        })
    }

    fn predict_proba(&self, batch: &ImageBatch) -> Result<Vec<Vec<f32>>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.model.valid();
        let batch = self.eval_batch(batch);
        let probs: Vec<f32> = model
            .forward_softmax(batch.images)
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| PipelineError::Model(format!("failed to read probabilities: {:?}", e)))?;

        Ok(probs
            .chunks(self.num_classes)
            .map(<[f32]>::to_vec)
            .collect())
    }

    fn state_dict(&self) -> Result<ModelState> {
        let bytes = Recorder::<B>::record(&StateRecorder::default(), self.model.clone().into_record(), ())
            .map_err(|e| PipelineError::Model(format!("failed to record weights: {:?}", e)))?;
        Ok(ModelState(bytes))
    }

    fn load_state_dict(&mut self, state: &ModelState) -> Result<()> {
        let record = Recorder::<B>::load(&StateRecorder::default(), state.0.clone(), &self.device)
            .map_err(|e| PipelineError::Model(format!("failed to load weights: {:?}", e)))?;
        self.model = self.model.clone().load_record(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{default_device, TrainingBackend};

    fn tiny_config() -> RunConfig {
        RunConfig::new(1, 16, 1.0)
            .with_seed(5)
            .with_extra("base_filters", 2)
            .with_extra("learning_rate", 0.01)
    }

    fn tiny_batch(n: usize) -> ImageBatch {
        let per_image = 3 * 16 * 16;
        let items = (0..n)
            .map(|i| (vec![(i % 2) as f32 - 0.5; per_image], i % 2))
            .collect();
        ImageBatch::from_items(items, 16).unwrap()
    }

    #[test]
    fn test_rejects_tiny_images() {
        let config = RunConfig::new(1, 8, 1.0);
        let result = build_classifier::<TrainingBackend>(&config, 2, &default_device());
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_train_step_and_evaluate() {
        let mut model =
            build_classifier::<TrainingBackend>(&tiny_config(), 2, &default_device()).unwrap();
        let batch = tiny_batch(4);

        let loss = model.train_step(&batch).unwrap();
        assert!(loss.is_finite());

        let eval = model.evaluate(&batch).unwrap();
        assert_eq!(eval.total, 4);
        assert!(eval.correct <= 4);
        assert!(eval.loss.is_finite());
    }

    #[test]
    fn test_predict_proba_rows() {
        let model =
            build_classifier::<TrainingBackend>(&tiny_config(), 3, &default_device()).unwrap();
        let probs = model.predict_proba(&tiny_batch(2)).unwrap();

        assert_eq!(probs.len(), 2);
        for row in probs {
            assert_eq!(row.len(), 3);
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_state_round_trip_preserves_predictions() {
        let device = default_device();
        let mut trained = build_classifier::<TrainingBackend>(&tiny_config(), 2, &device).unwrap();
        trained.train_step(&tiny_batch(4)).unwrap();
        let state = trained.state_dict().unwrap();

        let mut fresh = build_classifier::<TrainingBackend>(
            &tiny_config().with_seed(99),
            2,
            &device,
        )
        .unwrap();
        fresh.load_state_dict(&state).unwrap();

        let batch = tiny_batch(2);
        let a = trained.predict_proba(&batch).unwrap();
        let b = fresh.predict_proba(&batch).unwrap();
        for (ra, rb) in a.iter().zip(&b) {
            for (x, y) in ra.iter().zip(rb) {
                assert!((x - y).abs() < 1e-5);
            }
        }
    }
}
