//! Training loop and run lifecycle
//!
//! A [`Trainer`] drives one run through
//! `Initialized → Running → {Completed, Aborted, Failed}`:
//!
//! - the config is validated, the run lock taken and the config and split
//!   records written before the first epoch;
//! - each epoch trains over a seeded shuffle of the training set, evaluates
//!   the validation set, appends its metrics, saves `last` and saves `best`
//!   on strict improvement, all durably before the next epoch starts;
//! - cancellation and the time budget are checked between epochs only;
//! - a summary is written at the end whatever the outcome.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointName, CheckpointStore, RunLock};
use crate::dataset::augmentation::Augmenter;
use crate::dataset::loader::Sample;
use crate::dataset::preprocess::{open_image, PreprocessPipeline};
use crate::dataset::split::DatasetSplit;
use crate::model::{ImageBatch, ImageModel};
use crate::run::{finalize, EpochMetric, RunConfig, RunStatus, RunStore, RunSummary};
use crate::utils::error::{PipelineError, Result};
use crate::utils::logging::TrainingLogger;

/// Shared flag requesting a run to stop at the next epoch boundary
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Execution options that do not change what a run computes
#[derive(Debug, Clone, Default)]
pub struct TrainOptions {
    /// Overrides the configured batch size (e.g. to fit memory)
    pub batch_size: Option<usize>,
    /// Stop after the epoch during which this much time has elapsed
    pub max_duration: Option<Duration>,
    pub cancel: CancelToken,
    /// Replace the artifacts of an existing run with the same id
    pub overwrite: bool,
}

impl TrainOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Hooks called by the trainer as a run progresses
pub trait TrainingObserver {
    fn on_epoch_start(&mut self, _epoch: usize, _total_epochs: usize) {}

    /// Called after the epoch's metrics and checkpoints are durable
    fn on_epoch_end(&mut self, metric: &EpochMetric, improved: bool);
}

/// Lifecycle state of a trainer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Initialized,
    Running,
    Completed,
    Aborted,
    Failed,
}

/// Runs training for one configuration at a time
pub struct Trainer {
    checkpoints: CheckpointStore,
    runs: RunStore,
    options: TrainOptions,
    observer: Option<Box<dyn TrainingObserver>>,
    state: TrainerState,
}

/// Loaded images of one batch plus the paths that failed to load
struct LoadedBatch {
    batch: ImageBatch,
    skipped: Vec<PathBuf>,
}

impl Trainer {
    pub fn new(checkpoints: CheckpointStore, runs: RunStore, options: TrainOptions) -> Self {
        Self {
            checkpoints,
            runs,
            options,
            observer: None,
            state: TrainerState::Initialized,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn TrainingObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn options(&self) -> &TrainOptions {
        &self.options
    }

    /// Train `model` on `split` and return the run summary
    ///
    /// The model must be freshly initialised for this run. Errors raised
    /// after the run started are returned after a `Failed` summary has been
    /// written on a best-effort basis.
    pub fn train<M: ImageModel>(
        &mut self,
        config: &RunConfig,
        split: &DatasetSplit,
        mut model: M,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        self.state = TrainerState::Initialized;

        self.check_inputs(config, split)?;
        let run_id = config.derive_run_id();

        let lock = self.checkpoints.acquire(&run_id)?;
        self.runs.prepare(&lock, config, self.options.overwrite)?;
        self.runs.write_split(&lock, split)?;

        info!(
            "Starting run {} ({} train / {} val samples, {} classes)",
            run_id,
            split.train.len(),
            split.val.len(),
            split.num_classes()
        );

        self.state = TrainerState::Running;
        let mut metrics = Vec::with_capacity(config.epochs);
        let outcome = self.run_epochs(&lock, config, split, &mut model, &mut metrics, started);

        match outcome {
            Ok(status) => {
                self.state = match status {
                    RunStatus::Completed => TrainerState::Completed,
                    _ => TrainerState::Aborted,
                };
                let summary = finalize(&run_id, config, &metrics, status, started.elapsed());
                self.runs.write_summary(&lock, &summary)?;
                Ok(summary)
            }
            Err(e) => {
                self.state = TrainerState::Failed;
                warn!("Run {} failed after {} epochs: {}", run_id, metrics.len(), e);
                let summary =
                    finalize(&run_id, config, &metrics, RunStatus::Failed, started.elapsed())
                        .with_failure(e.to_string());
                if let Err(write_err) = self.runs.write_summary(&lock, &summary) {
                    warn!("Could not write failure summary for {}: {}", run_id, write_err);
                }
                Err(e)
            }
        }
    }

    /// Everything that can be rejected before touching the run directory
    fn check_inputs(&self, config: &RunConfig, split: &DatasetSplit) -> Result<()> {
        config.validate()?;

        if self.options.batch_size == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "batch_size override must be at least 1".to_string(),
            ));
        }
        if split.fraction != config.fraction || split.seed != config.seed {
            return Err(PipelineError::InvalidConfig(format!(
                "split was indexed with fraction {} and seed {}, config has fraction {} and seed {}",
                split.fraction, split.seed, config.fraction, config.seed
            )));
        }
        if split.val_ratio != config.val_ratio() {
            return Err(PipelineError::InvalidConfig(format!(
                "split was indexed with val_ratio {}, config has val_ratio {}",
                split.val_ratio,
                config.val_ratio()
            )));
        }
        if let Some(declared) = config.classes()? {
            if declared != split.classes {
                return Err(PipelineError::InvalidConfig(format!(
                    "split covers classes {:?}, config declares {:?}",
                    split.classes, declared
                )));
            }
        }
        if split.train.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "training set is empty".to_string(),
            ));
        }
        if split.val.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "validation set is empty; raise fraction or val_ratio".to_string(),
            ));
        }
        Ok(())
    }

    fn should_stop(&self, started: Instant) -> bool {
        if self.options.cancel.is_cancelled() {
            info!("Cancellation requested");
            return true;
        }
        if let Some(max) = self.options.max_duration {
            if started.elapsed() >= max {
                info!("Time budget of {:.0}s exhausted", max.as_secs_f64());
                return true;
            }
        }
        false
    }

    fn run_epochs<M: ImageModel>(
        &mut self,
        lock: &RunLock,
        config: &RunConfig,
        split: &DatasetSplit,
        model: &mut M,
        metrics: &mut Vec<EpochMetric>,
        started: Instant,
    ) -> Result<RunStatus> {
        let run_id = lock.run_id().to_string();
        let batch_size = self.options.batch_size.unwrap_or_else(|| config.batch_size());
        let pipeline = PreprocessPipeline::new(config.image_size);
        let augmenter = config
            .augment()
            .then(Augmenter::with_defaults)
            .filter(|a| a.config().is_enabled());
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let mut logger = TrainingLogger::new(&run_id, config.epochs);
        let mut best_accuracy: Option<f64> = None;

        for epoch in 1..=config.epochs {
            if self.should_stop(started) {
                logger.log_abort(metrics.len());
                return Ok(RunStatus::Aborted);
            }

            logger.start_epoch(epoch);
            if let Some(observer) = self.observer.as_mut() {
                observer.on_epoch_start(epoch, config.epochs);
            }

            // Train pass
            let mut order: Vec<usize> = (0..split.train.len()).collect();
            order.shuffle(&mut rng);
            let epoch_seed: u64 = rng.gen();

            let mut skipped = 0usize;
            let mut first_skipped: Option<PathBuf> = None;
            let mut loss_sum = 0.0f64;
            let mut seen = 0usize;

            for (batch_idx, chunk) in order.chunks(batch_size).enumerate() {
                let samples: Vec<&Sample> = chunk.iter().map(|&i| &split.train[i]).collect();
                let loaded = load_batch(
                    &samples,
                    &pipeline,
                    augmenter.as_ref(),
                    epoch_seed.wrapping_add(batch_idx as u64),
                )?;
                skipped += loaded.skipped.len();
                first_skipped = first_skipped.or_else(|| loaded.skipped.first().cloned());
                if loaded.batch.is_empty() {
                    continue;
                }

                let loss = model.train_step(&loaded.batch)?;
                if !loss.is_finite() {
                    return Err(PipelineError::NonFiniteLoss {
                        run_id,
                        epoch,
                        phase: "train",
                    });
                }
                loss_sum += loss * loaded.batch.len() as f64;
                seen += loaded.batch.len();
            }
            if seen == 0 {
                return Err(all_unreadable(first_skipped, epoch, "training"));
            }
            let train_loss = loss_sum / seen as f64;

            // Validation pass
            let mut val_loss_sum = 0.0f64;
            let mut correct = 0usize;
            let mut total = 0usize;
            for chunk in split.val.chunks(batch_size) {
                let samples: Vec<&Sample> = chunk.iter().collect();
                let loaded = load_batch(&samples, &pipeline, None, 0)?;
                skipped += loaded.skipped.len();
                first_skipped = first_skipped.or_else(|| loaded.skipped.first().cloned());
                if loaded.batch.is_empty() {
                    continue;
                }

                let eval = model.evaluate(&loaded.batch)?;
                val_loss_sum += eval.loss * eval.total as f64;
                correct += eval.correct;
                total += eval.total;
            }
            if total == 0 {
                return Err(all_unreadable(first_skipped, epoch, "validation"));
            }
            let val_loss = val_loss_sum / total as f64;
            if !val_loss.is_finite() {
                return Err(PipelineError::NonFiniteLoss {
                    run_id,
                    epoch,
                    phase: "validation",
                });
            }

            let metric = EpochMetric {
                epoch,
                train_loss,
                val_loss,
                val_accuracy: correct as f64 / total as f64,
                skipped_samples: skipped,
            };
            logger.end_epoch(metric.train_loss, metric.val_loss, metric.val_accuracy);

            // Persist before the next epoch can start. Once the metric is on
            // disk it counts towards the summary even if saving weights fails.
            self.runs.append_metric(lock, &metric)?;
            metrics.push(metric.clone());

            let mut checkpoint = Checkpoint {
                run_id: run_id.clone(),
                name: CheckpointName::Last,
                model_state: model.state_dict()?,
                epoch,
                val_accuracy_at_save: metric.val_accuracy,
                image_size: config.image_size,
                classes: split.classes.clone(),
            };
            self.checkpoints.save(lock, &checkpoint)?;

            let improved = best_accuracy.map_or(true, |best| metric.val_accuracy > best);
            if improved {
                checkpoint.name = CheckpointName::Best;
                self.checkpoints.save(lock, &checkpoint)?;
                best_accuracy = Some(metric.val_accuracy);
                logger.log_new_best(metric.val_accuracy);
            }

            if let Some(observer) = self.observer.as_mut() {
                observer.on_epoch_end(&metric, improved);
            }
        }

        logger.log_complete(best_accuracy);
        Ok(RunStatus::Completed)
    }
}

/// Decode, optionally augment and preprocess a batch of samples in parallel
///
/// Unreadable images are logged and reported back instead of failing the
/// batch. Output order follows input order.
fn load_batch(
    samples: &[&Sample],
    pipeline: &PreprocessPipeline,
    augmenter: Option<&Augmenter>,
    seed: u64,
) -> Result<LoadedBatch> {
    let results: Vec<Result<(Vec<f32>, usize)>> = samples
        .par_iter()
        .enumerate()
        .map(|(i, sample)| {
            let img = open_image(&sample.image_path)?;
            let img = match augmenter {
                Some(augmenter) => {
                    let mut rng = ChaCha8Rng::seed_from_u64(seed);
                    rng.set_stream(i as u64);
                    augmenter.augment(img, &mut rng)
                }
                None => img,
            };
            Ok((pipeline.transform_image(&img), sample.label))
        })
        .collect();

    let mut items = Vec::with_capacity(results.len());
    let mut skipped = Vec::new();
    for (sample, result) in samples.iter().zip(results) {
        match result {
            Ok(item) => items.push(item),
            Err(e) => {
                warn!("Skipping sample: {}", e);
                skipped.push(sample.image_path.clone());
            }
        }
    }

    Ok(LoadedBatch {
        batch: ImageBatch::from_items(items, pipeline.image_size())?,
        skipped,
    })
}

fn all_unreadable(first: Option<PathBuf>, epoch: usize, phase: &str) -> PipelineError {
    PipelineError::UnreadableImage {
        path: first.unwrap_or_default(),
        reason: format!("every {} sample in epoch {} was unreadable", phase, epoch),
    }
}
