//! Food Classifier CLI
//!
//! Entry point for indexing food corpora, training versioned runs,
//! inspecting their records and predicting from saved checkpoints.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use food_classifier::backend::{backend_name, default_device, TrainingBackend};
use food_classifier::checkpoint::{CheckpointName, CheckpointStore};
use food_classifier::dataset::{CorpusIndex, DatasetSplit, IndexConfig};
use food_classifier::inference::{expand_inputs, ImageSource, Predictor};
use food_classifier::model::build_classifier;
use food_classifier::run::{export_csv, EpochMetric, RunConfig, RunStatus, RunStore};
use food_classifier::training::{CancelToken, TrainOptions, Trainer, TrainingObserver};
use food_classifier::utils::logging::{init_logging, LogConfig, LogLevel};

/// Food image classification with reproducible training runs
#[derive(Parser, Debug)]
#[command(name = "food_classifier")]
#[command(version)]
#[command(about = "Food image classification with versioned training runs on Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false", global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value = "false", global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index a corpus and show the resulting split
    Index {
        /// Corpus root with one directory per class
        #[arg(short, long)]
        corpus: PathBuf,

        /// Share of each class to sample (0.0-1.0]
        #[arg(short, long, default_value = "1.0")]
        fraction: f64,

        /// Random seed for sampling
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Share of the sampled subset held out for validation
        #[arg(long, default_value = "0.2")]
        val_ratio: f64,

        /// Comma-separated class names that must be present
        #[arg(long, value_delimiter = ',')]
        classes: Option<Vec<String>>,
    },

    /// Train a run
    Train {
        /// Corpus root with one directory per class
        #[arg(short, long)]
        corpus: PathBuf,

        /// Root directory of all runs
        #[arg(short, long, default_value = "runs")]
        runs: PathBuf,

        /// TOML run configuration; flags below override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of training epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Square input resolution
        #[arg(long)]
        image_size: Option<u32>,

        /// Share of each class to sample (0.0-1.0]
        #[arg(short, long)]
        fraction: Option<f64>,

        /// Random seed for reproducibility
        #[arg(long)]
        seed: Option<u64>,

        /// Batch size (part of the run configuration)
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Learning rate
        #[arg(short, long)]
        learning_rate: Option<f64>,

        /// Disable training-time augmentation
        #[arg(long, default_value = "false")]
        no_augment: bool,

        /// Stop after the epoch during which this many minutes have elapsed
        #[arg(long)]
        max_minutes: Option<u64>,

        /// Replace the records of an existing run with the same id
        #[arg(long, default_value = "false")]
        overwrite: bool,
    },

    /// Classify images with a trained checkpoint
    Predict {
        /// Root directory of all runs
        #[arg(short, long, default_value = "runs")]
        runs: PathBuf,

        /// Run to load
        #[arg(long)]
        run_id: String,

        /// Checkpoint slot (best or last)
        #[arg(long, default_value = "best")]
        checkpoint: CheckpointName,

        /// Expected input resolution; must match the run's
        #[arg(long)]
        image_size: Option<u32>,

        /// Number of ranked classes to show
        #[arg(short = 'k', long, default_value = "3")]
        top_k: usize,

        /// Fail on the first unreadable image instead of reporting it
        #[arg(long, default_value = "false")]
        strict: bool,

        /// Image files or directories
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// List runs
    Runs {
        /// Root directory of all runs
        #[arg(short, long, default_value = "runs")]
        runs: PathBuf,
    },

    /// Show the summary and metrics of a run
    Show {
        /// Root directory of all runs
        #[arg(short, long, default_value = "runs")]
        runs: PathBuf,

        /// Run to show
        #[arg(long)]
        run_id: String,
    },

    /// Export the per-epoch metrics of a run as CSV
    Export {
        /// Root directory of all runs
        #[arg(short, long, default_value = "runs")]
        runs: PathBuf,

        /// Run to export
        #[arg(long)]
        run_id: String,

        /// Output CSV file
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = if cli.verbose {
        LogConfig::verbose()
    } else if cli.quiet {
        LogConfig::quiet()
    } else {
        LogConfig::default()
    };
    if let Some(level) = &cli.log_level {
        log_config.level = LogLevel::parse(level);
    }

    let _ = init_logging(&log_config);

    print_banner();

    match cli.command {
        Commands::Index {
            corpus,
            fraction,
            seed,
            val_ratio,
            classes,
        } => {
            let mut config = IndexConfig::new(fraction, seed).with_val_ratio(val_ratio);
            if let Some(classes) = classes {
                config = config.with_classes(classes);
            }
            cmd_index(&corpus, &config)?;
        }

        Commands::Train {
            corpus,
            runs,
            config,
            epochs,
            image_size,
            fraction,
            seed,
            batch_size,
            learning_rate,
            no_augment,
            max_minutes,
            overwrite,
        } => {
            let mut run_config = match config {
                Some(path) => RunConfig::load_toml(&path)?,
                None => RunConfig::new(10, 224, 1.0),
            };
            if let Some(epochs) = epochs {
                run_config.epochs = epochs;
            }
            if let Some(image_size) = image_size {
                run_config.image_size = image_size;
            }
            if let Some(fraction) = fraction {
                run_config.fraction = fraction;
            }
            if let Some(seed) = seed {
                run_config.seed = seed;
            }
            if let Some(batch_size) = batch_size {
                run_config = run_config.with_extra("batch_size", batch_size);
            }
            if let Some(learning_rate) = learning_rate {
                run_config = run_config.with_extra("learning_rate", learning_rate);
            }
            if no_augment {
                run_config = run_config.with_extra("augment", false);
            }

            let mut options = TrainOptions::default().with_overwrite(overwrite);
            if let Some(minutes) = max_minutes {
                options = options.with_max_duration(Duration::from_secs(minutes * 60));
            }
            cmd_train(&corpus, &runs, &run_config, options)?;
        }

        Commands::Predict {
            runs,
            run_id,
            checkpoint,
            image_size,
            top_k,
            strict,
            inputs,
        } => {
            cmd_predict(&runs, &run_id, checkpoint, image_size, top_k, strict, &inputs)?;
        }

        Commands::Runs { runs } => {
            cmd_runs(&runs)?;
        }

        Commands::Show { runs, run_id } => {
            cmd_show(&runs, &run_id)?;
        }

        Commands::Export {
            runs,
            run_id,
            output,
        } => {
            cmd_export(&runs, &run_id, &output)?;
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔══════════════════════════════════════════════════════╗
 ║   Food Classifier                                    ║
 ║   Reproducible food image classification runs        ║
 ║   Built with Burn + Rust                             ║
 ╚══════════════════════════════════════════════════════╝
  "#
        .green()
    );
}

fn cmd_index(corpus: &Path, config: &IndexConfig) -> Result<()> {
    info!("Indexing corpus: {:?}", corpus);
    config.validate()?;

    let index = CorpusIndex::scan_with(corpus, config.classes.as_deref())?;
    let split = DatasetSplit::from_index(&index, config);

    println!("{}", index.stats());
    println!("{}", split.stats());

    if !index.skipped.is_empty() {
        println!(
            "{} {} unreadable image(s) were skipped",
            "Warning:".yellow(),
            index.skipped.len()
        );
    }

    Ok(())
}

/// Drives an epoch progress bar from trainer callbacks
struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    fn new(total_epochs: usize) -> Self {
        let bar = ProgressBar::new(total_epochs as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] epoch {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self { bar }
    }
}

impl TrainingObserver for ProgressObserver {
    fn on_epoch_start(&mut self, epoch: usize, total_epochs: usize) {
        self.bar.set_message(format!("training {}/{}", epoch, total_epochs));
    }

    fn on_epoch_end(&mut self, metric: &EpochMetric, improved: bool) {
        self.bar.inc(1);
        self.bar.set_message(format!(
            "val acc {:.2}% val loss {:.4}",
            metric.val_accuracy * 100.0,
            metric.val_loss
        ));
        if improved {
            self.bar.println(format!(
                "  {} epoch {}: {:.2}%",
                "New best".green(),
                metric.epoch,
                metric.val_accuracy * 100.0
            ));
        }
        if metric.epoch == self.bar.length().unwrap_or(0) as usize {
            self.bar.finish();
        }
    }
}

fn cmd_train(corpus: &Path, runs: &Path, config: &RunConfig, options: TrainOptions) -> Result<()> {
    config.validate()?;
    let run_id = config.derive_run_id();

    println!("{}", "Run configuration:".cyan().bold());
    println!("  Run id:      {}", run_id.bold());
    println!("  Backend:     {}", backend_name());
    println!("  Epochs:      {}", config.epochs);
    println!("  Image size:  {}", config.image_size);
    println!("  Fraction:    {}", config.fraction);
    println!("  Seed:        {}", config.seed);
    println!("  Batch size:  {}", config.batch_size());
    println!();

    let split = food_classifier::dataset::index_with(corpus, &config.index_config()?)?;
    println!("{}", split.stats());

    let device = default_device();
    let model = build_classifier::<TrainingBackend>(config, split.num_classes(), &device)?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nStopping after the current epoch...");
        handler_token.cancel();
    })
    .context("failed to install Ctrl-C handler")?;

    let options = options.with_cancel(cancel);
    let mut trainer = Trainer::new(
        CheckpointStore::new(runs),
        RunStore::new(runs),
        options,
    )
    .with_observer(Box::new(ProgressObserver::new(config.epochs)));

    let summary = trainer.train(config, &split, model)?;

    println!();
    let headline = match summary.status {
        RunStatus::Completed => "Training complete".green().bold(),
        RunStatus::Aborted => "Training stopped early".yellow().bold(),
        RunStatus::Failed => "Training failed".red().bold(),
    };
    println!("{}", headline);
    println!("{}", summary);
    println!("  Records:     {:?}", runs.join(&run_id));

    Ok(())
}

fn cmd_predict(
    runs: &Path,
    run_id: &str,
    checkpoint: CheckpointName,
    image_size: Option<u32>,
    top_k: usize,
    strict: bool,
    inputs: &[PathBuf],
) -> Result<()> {
    let files = expand_inputs(inputs);
    if files.is_empty() {
        bail!("no images found in {:?}", inputs);
    }

    let device = default_device();
    let mut predictor = Predictor::open(
        &CheckpointStore::new(runs),
        &RunStore::new(runs),
        run_id,
        checkpoint,
        |config, num_classes| build_classifier::<TrainingBackend>(config, num_classes, &device),
    )?
    .with_top_k(top_k);
    if let Some(size) = image_size {
        predictor = predictor.with_image_size(size)?;
    }

    println!(
        "{} {} ({}, epoch {}, {} classes)",
        "Model:".cyan().bold(),
        predictor.run_id(),
        predictor.checkpoint(),
        predictor.epoch(),
        predictor.classes().len()
    );
    println!();

    let sources: Vec<ImageSource> = files.iter().cloned().map(ImageSource::Path).collect();

    if strict {
        let predictions = predictor.predict_all(&sources)?;
        for (path, prediction) in files.iter().zip(predictions) {
            print_prediction(path, &prediction);
        }
        return Ok(());
    }

    let mut failures = 0usize;
    for (path, result) in files.iter().zip(predictor.predict(&sources)) {
        match result {
            Ok(prediction) => print_prediction(path, &prediction),
            Err(e) => {
                failures += 1;
                println!("{} {:?}: {}", "✗".red(), path, e);
            }
        }
    }

    if failures > 0 {
        println!();
        println!(
            "{} {} of {} image(s) could not be classified",
            "Warning:".yellow(),
            failures,
            files.len()
        );
    }

    Ok(())
}

fn print_prediction(path: &Path, prediction: &food_classifier::Prediction) {
    println!(
        "{} {:?}: {} ({:.1}%)",
        "✓".green(),
        path,
        prediction.label.bold(),
        prediction.confidence * 100.0
    );
    for score in prediction.top_k.iter().skip(1) {
        println!("      {:30} {:.1}%", score.label, score.probability * 100.0);
    }
}

fn cmd_runs(runs: &Path) -> Result<()> {
    let records = RunStore::new(runs).list_runs()?;
    if records.is_empty() {
        println!("No runs under {:?}", runs);
        return Ok(());
    }

    println!(
        "{:40} {:>10} {:>8} {:>10} {:>10}",
        "RUN", "STATUS", "EPOCHS", "BEST ACC", "FINAL ACC"
    );
    for record in records {
        let (status, epochs, best, last) = match &record.summary {
            Some(s) => (
                s.status.to_string(),
                format!("{}/{}", s.total_epochs_run, s.config.epochs),
                s.best_metrics
                    .as_ref()
                    .map(|m| format!("{:.2}%", m.val_accuracy * 100.0))
                    .unwrap_or_else(|| "-".to_string()),
                s.final_metrics
                    .as_ref()
                    .map(|m| format!("{:.2}%", m.val_accuracy * 100.0))
                    .unwrap_or_else(|| "-".to_string()),
            ),
            None if record.active => (
                "running".to_string(),
                format!("?/{}", record.config.epochs),
                "-".to_string(),
                "-".to_string(),
            ),
            None => (
                "unfinished".to_string(),
                format!("?/{}", record.config.epochs),
                "-".to_string(),
                "-".to_string(),
            ),
        };
        let status = match status.as_str() {
            "completed" => status.green(),
            "failed" => status.red(),
            _ => status.yellow(),
        };
        println!(
            "{:40} {:>10} {:>8} {:>10} {:>10}",
            record.run_id, status, epochs, best, last
        );
        if let Some(holder) = &record.holder {
            println!("  locked by pid {} since {}", holder.pid, holder.acquired_at);
        }
    }

    Ok(())
}

fn cmd_show(runs: &Path, run_id: &str) -> Result<()> {
    let store = RunStore::new(runs);
    let config = store.read_config(run_id)?;
    let metrics = store.read_metrics(run_id)?;

    println!("{}", "Configuration:".cyan().bold());
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!();

    match store.read_summary(run_id)? {
        Some(summary) => println!("{}", summary),
        None => println!("{} run has no summary yet", "Note:".yellow()),
    }

    let checkpoints = CheckpointStore::new(runs).list(run_id);
    println!(
        "  Checkpoints:  {}",
        if checkpoints.is_empty() {
            "none".to_string()
        } else {
            checkpoints
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }
    );
    println!();

    if !metrics.is_empty() {
        println!("{}", "Epoch metrics:".cyan().bold());
        println!(
            "  {:>5} {:>12} {:>12} {:>10} {:>8}",
            "EPOCH", "TRAIN LOSS", "VAL LOSS", "VAL ACC", "SKIPPED"
        );
        for m in &metrics {
            println!(
                "  {:>5} {:>12.4} {:>12.4} {:>9.2}% {:>8}",
                m.epoch,
                m.train_loss,
                m.val_loss,
                m.val_accuracy * 100.0,
                m.skipped_samples
            );
        }
    }

    Ok(())
}

fn cmd_export(runs: &Path, run_id: &str, output: &Path) -> Result<()> {
    let metrics = RunStore::new(runs).read_metrics(run_id)?;
    export_csv(&metrics, output)?;

    println!(
        "{} {} epoch(s) of {} written to {:?}",
        "✓".green(),
        metrics.len(),
        run_id,
        output
    );
    Ok(())
}
