//! Run configuration and run identity
//!
//! A [`RunConfig`] is immutable once built and its `run_id` is a pure
//! function of every field, so two runs share an id exactly when they were
//! configured identically.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::dataset::split::IndexConfig;
use crate::utils::error::{IoResultExt, PipelineError, Result};

pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_LEARNING_RATE: f64 = 1e-3;
pub const DEFAULT_WEIGHT_DECAY: f64 = 1e-4;
pub const DEFAULT_DROPOUT: f64 = 0.3;
pub const DEFAULT_BASE_FILTERS: usize = 16;
pub const DEFAULT_VAL_RATIO: f64 = crate::dataset::split::DEFAULT_VAL_RATIO;
pub const DEFAULT_AUGMENT: bool = true;
pub const DEFAULT_SEED: u64 = 42;

fn default_seed() -> u64 {
    DEFAULT_SEED
}

/// Hyperparameters of one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of epochs to train, at least 1
    pub epochs: usize,
    /// Square input resolution in pixels
    pub image_size: u32,
    /// Share of each class sampled from the corpus, in (0, 1]
    pub fraction: f64,
    /// Seeds the split, the shuffles and the initial weights
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Additional named hyperparameters, kept sorted by key
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl RunConfig {
    pub fn new(epochs: usize, image_size: u32, fraction: f64) -> Self {
        Self {
            epochs,
            image_size,
            fraction,
            seed: DEFAULT_SEED,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set an extra hyperparameter
    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Load a configuration from a TOML file
    ///
    /// ```toml
    /// epochs = 10
    /// image_size = 128
    /// fraction = 0.25
    /// seed = 7
    ///
    /// [extra]
    /// batch_size = 64
    /// learning_rate = 0.0005
    /// ```
    pub fn load_toml(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).at_path(path)?;
        toml::from_str(&content).map_err(|e| {
            PipelineError::InvalidConfig(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Canonical JSON encoding; extra keys are ordered by the `BTreeMap`
    pub fn canonical_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| PipelineError::Serialization(e.to_string()))
    }

    /// Stable, human-readable run identifier
    pub fn derive_run_id(&self) -> String {
        derive_run_id(self)
    }

    /// Reject configurations no run can be started with
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(invalid("epochs must be at least 1"));
        }
        if self.image_size == 0 {
            return Err(invalid("image_size must be at least 1"));
        }
        if !(self.fraction > 0.0 && self.fraction <= 1.0) {
            return Err(invalid(format!(
                "fraction must be in (0, 1], got {}",
                self.fraction
            )));
        }

        let batch_size = self.extra_usize("batch_size")?.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(invalid("batch_size must be at least 1"));
        }

        let lr = self.extra_f64("learning_rate")?.unwrap_or(DEFAULT_LEARNING_RATE);
        if !(lr > 0.0 && lr.is_finite()) {
            return Err(invalid(format!("learning_rate must be positive, got {}", lr)));
        }

        let weight_decay = self.extra_f64("weight_decay")?.unwrap_or(DEFAULT_WEIGHT_DECAY);
        if !(weight_decay >= 0.0 && weight_decay.is_finite()) {
            return Err(invalid(format!(
                "weight_decay must be non-negative, got {}",
                weight_decay
            )));
        }

        let val_ratio = self.extra_f64("val_ratio")?.unwrap_or(DEFAULT_VAL_RATIO);
        if !(0.0..1.0).contains(&val_ratio) {
            return Err(invalid(format!("val_ratio must be in [0, 1), got {}", val_ratio)));
        }

        let dropout = self.extra_f64("dropout")?.unwrap_or(DEFAULT_DROPOUT);
        if !(0.0..1.0).contains(&dropout) {
            return Err(invalid(format!("dropout must be in [0, 1), got {}", dropout)));
        }

        if self.extra_usize("base_filters")? == Some(0) {
            return Err(invalid("base_filters must be at least 1"));
        }
        self.extra_bool("augment")?;
        self.classes()?;

        Ok(())
    }

    /// Declared class list from `extra.classes`, sorted and deduplicated
    ///
    /// `None` means every class directory in the corpus is used.
    pub fn classes(&self) -> Result<Option<Vec<String>>> {
        let Some(value) = self.extra.get("classes") else {
            return Ok(None);
        };
        let items = value
            .as_array()
            .ok_or_else(|| invalid(format!("classes must be a list of names, got {}", value)))?;

        let mut names = items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(format!("class names must be strings, got {}", v)))
            })
            .collect::<Result<Vec<String>>>()?;
        names.sort();
        names.dedup();
        if names.is_empty() {
            return Err(invalid("classes must name at least one class"));
        }
        Ok(Some(names))
    }

    /// Indexing options that produce the split this run trains on
    pub fn index_config(&self) -> Result<IndexConfig> {
        let config = IndexConfig::new(self.fraction, self.seed).with_val_ratio(self.val_ratio());
        Ok(match self.classes()? {
            Some(classes) => config.with_classes(classes),
            None => config,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.extra_usize("batch_size")
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn learning_rate(&self) -> f64 {
        self.extra_f64("learning_rate")
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_LEARNING_RATE)
    }

    pub fn weight_decay(&self) -> f64 {
        self.extra_f64("weight_decay")
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_WEIGHT_DECAY)
    }

    pub fn dropout(&self) -> f64 {
        self.extra_f64("dropout")
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_DROPOUT)
    }

    pub fn base_filters(&self) -> usize {
        self.extra_usize("base_filters")
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_BASE_FILTERS)
    }

    pub fn val_ratio(&self) -> f64 {
        self.extra_f64("val_ratio")
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_VAL_RATIO)
    }

    pub fn augment(&self) -> bool {
        self.extra_bool("augment")
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_AUGMENT)
    }

    fn extra_f64(&self, key: &str) -> Result<Option<f64>> {
        match self.extra.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| invalid(format!("{} must be a number, got {}", key, v))),
        }
    }

    fn extra_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.extra.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| invalid(format!("{} must be a non-negative integer, got {}", key, v))),
        }
    }

    fn extra_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.extra.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| invalid(format!("{} must be a boolean, got {}", key, v))),
        }
    }
}

fn invalid(msg: impl Into<String>) -> PipelineError {
    PipelineError::InvalidConfig(msg.into())
}

/// `e{epochs}-img{size}-f{fraction}-s{seed}-{hash8}`
///
/// `hash8` is the first 8 hex characters of SHA-256 over the canonical
/// JSON of the whole configuration.
pub fn derive_run_id(config: &RunConfig) -> String {
    // Serializing a struct of plain fields and a string-keyed map cannot fail
    let canonical = serde_json::to_vec(config).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    let hash = hex::encode(digest);

    format!(
        "e{}-img{}-f{}-s{}-{}",
        config.epochs,
        config.image_size,
        config.fraction,
        config.seed,
        &hash[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RunConfig {
        RunConfig::new(10, 224, 0.1).with_seed(42)
    }

    #[test]
    fn test_run_id_format() {
        let id = base().derive_run_id();
        assert!(id.starts_with("e10-img224-f0.1-s42-"), "{id}");
        assert_eq!(id.len(), "e10-img224-f0.1-s42-".len() + 8);
    }

    #[test]
    fn test_run_id_is_pure() {
        assert_eq!(base().derive_run_id(), base().derive_run_id());
        assert_eq!(derive_run_id(&base()), base().derive_run_id());
    }

    #[test]
    fn test_run_id_changes_with_any_field() {
        let id = base().derive_run_id();
        let variants = [
            RunConfig::new(11, 224, 0.1).with_seed(42),
            RunConfig::new(10, 128, 0.1).with_seed(42),
            RunConfig::new(10, 224, 0.2).with_seed(42),
            base().with_seed(43),
            base().with_extra("batch_size", 64),
        ];
        for v in variants {
            assert_ne!(v.derive_run_id(), id);
        }
    }

    #[test]
    fn test_extra_order_does_not_matter() {
        let a = base().with_extra("batch_size", 16).with_extra("dropout", 0.1);
        let b = base().with_extra("dropout", 0.1).with_extra("batch_size", 16);
        assert_eq!(a.derive_run_id(), b.derive_run_id());
    }

    #[test]
    fn test_defaults() {
        let cfg = base();
        assert_eq!(cfg.batch_size(), DEFAULT_BATCH_SIZE);
        assert_eq!(cfg.learning_rate(), DEFAULT_LEARNING_RATE);
        assert_eq!(cfg.val_ratio(), 0.2);
        assert!(cfg.augment());
    }

    #[test]
    fn test_validate() {
        assert!(base().validate().is_ok());
        assert!(RunConfig::new(0, 224, 0.1).validate().is_err());
        assert!(RunConfig::new(1, 0, 0.1).validate().is_err());
        assert!(RunConfig::new(1, 224, 0.0).validate().is_err());
        assert!(RunConfig::new(1, 224, 1.01).validate().is_err());
        assert!(base().with_extra("batch_size", 0).validate().is_err());
        assert!(base().with_extra("learning_rate", -1.0).validate().is_err());
        assert!(base().with_extra("val_ratio", 1.0).validate().is_err());
        assert!(base().with_extra("batch_size", "big").validate().is_err());
        assert!(base().with_extra("augment", false).validate().is_ok());
        assert!(base().with_extra("classes", "sushi").validate().is_err());
        assert!(base().with_extra("classes", vec![1, 2]).validate().is_err());
    }

    #[test]
    fn test_declared_classes_are_normalised() {
        assert_eq!(base().classes().unwrap(), None);

        let cfg = base()
            .with_extra("classes", vec!["tacos", "curry", "tacos"])
            .with_extra("val_ratio", 0.5);
        assert_eq!(
            cfg.classes().unwrap(),
            Some(vec!["curry".to_string(), "tacos".to_string()])
        );

        let index = cfg.index_config().unwrap();
        assert_eq!(index.val_ratio, 0.5);
        assert_eq!(index.seed, 42);
        assert_eq!(index.classes.as_deref().map(<[String]>::len), Some(2));
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(
            &path,
            "epochs = 3\nimage_size = 64\nfraction = 0.5\n\n[extra]\nbatch_size = 8\nlearning_rate = 0.01\n",
        )
        .unwrap();

        let cfg = RunConfig::load_toml(&path).unwrap();
        assert_eq!(cfg.epochs, 3);
        assert_eq!(cfg.seed, DEFAULT_SEED);
        assert_eq!(cfg.batch_size(), 8);
        assert_eq!(cfg.learning_rate(), 0.01);
    }

    #[test]
    fn test_json_round_trip_keeps_id() {
        let cfg = base().with_extra("dropout", 0.25);
        let json = cfg.canonical_json().unwrap();
        let back: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.derive_run_id(), cfg.derive_run_id());
    }
}
