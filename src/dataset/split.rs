//! Stratified train/validation split
//!
//! Each class is shuffled with a `ChaCha8Rng` seeded from the run seed, a
//! `fraction` of it is sampled (at least one image per class) and the
//! sample is divided into validation and training parts. Samples outside
//! the sampled fraction are neither trained on nor evaluated.

use std::path::{Path, PathBuf};

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::loader::{CorpusIndex, Sample};
use crate::utils::error::{PipelineError, Result};

/// Default share of the sampled subset held out for validation
pub const DEFAULT_VAL_RATIO: f64 = 0.2;

/// Indexing options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Share of each class to sample, in (0, 1]
    pub fraction: f64,
    /// Seed for the per-class shuffle
    pub seed: u64,
    /// Share of the sampled subset used for validation, in [0, 1)
    pub val_ratio: f64,
    /// Restrict indexing to these classes
    pub classes: Option<Vec<String>>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            fraction: 1.0,
            seed: 42,
            val_ratio: DEFAULT_VAL_RATIO,
            classes: None,
        }
    }
}

impl IndexConfig {
    pub fn new(fraction: f64, seed: u64) -> Self {
        Self {
            fraction,
            seed,
            ..Self::default()
        }
    }

    pub fn with_val_ratio(mut self, val_ratio: f64) -> Self {
        self.val_ratio = val_ratio;
        self
    }

    pub fn with_classes(mut self, classes: Vec<String>) -> Self {
        self.classes = Some(classes);
        self
    }

    /// Reject out-of-range fractions before touching the filesystem
    pub fn validate(&self) -> Result<()> {
        if !(self.fraction > 0.0 && self.fraction <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "fraction must be in (0, 1], got {}",
                self.fraction
            )));
        }
        if !(0.0..1.0).contains(&self.val_ratio) {
            return Err(PipelineError::InvalidConfig(format!(
                "val_ratio must be in [0, 1), got {}",
                self.val_ratio
            )));
        }
        Ok(())
    }
}

/// Training and validation subsets of a sampled corpus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSplit {
    pub train: Vec<Sample>,
    pub val: Vec<Sample>,
    pub fraction: f64,
    pub seed: u64,
    pub val_ratio: f64,
    /// Sorted class names; labels index this list
    pub classes: Vec<String>,
}

/// Index a corpus with the default validation ratio
pub fn index<P: AsRef<Path>>(corpus_root: P, fraction: f64, seed: u64) -> Result<DatasetSplit> {
    index_with(corpus_root, &IndexConfig::new(fraction, seed))
}

/// Index a corpus with explicit options
pub fn index_with<P: AsRef<Path>>(corpus_root: P, config: &IndexConfig) -> Result<DatasetSplit> {
    config.validate()?;
    let corpus = CorpusIndex::scan_with(corpus_root, config.classes.as_deref())?;
    Ok(DatasetSplit::from_index(&corpus, config))
}

impl DatasetSplit {
    /// Sample and split an already scanned corpus
    pub fn from_index(corpus: &CorpusIndex, config: &IndexConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let mut train = Vec::new();
        let mut val = Vec::new();

        for class_samples in &corpus.by_class {
            let mut shuffled: Vec<&Sample> = class_samples.iter().collect();
            shuffled.shuffle(&mut rng);

            let n = class_samples.len();
            let take = ((config.fraction * n as f64).round() as usize).clamp(1, n);
            let n_val = ((take as f64 * config.val_ratio).round() as usize).min(take);

            let subset = &shuffled[..take];
            val.extend(subset[..n_val].iter().map(|s| (*s).clone()));
            train.extend(subset[n_val..].iter().map(|s| (*s).clone()));
        }

        train.sort_by(|a, b| a.image_path.cmp(&b.image_path));
        val.sort_by(|a, b| a.image_path.cmp(&b.image_path));

        let split = Self {
            train,
            val,
            fraction: config.fraction,
            seed: config.seed,
            val_ratio: config.val_ratio,
            classes: corpus.classes.clone(),
        };
        info!("{}", split.stats());
        split
    }

    /// Number of classes
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Every image path in the split (train then val)
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.train.iter().chain(self.val.iter()).map(|s| &s.image_path)
    }

    /// Split sizes
    pub fn stats(&self) -> SplitStats {
        let mut per_class = vec![(0usize, 0usize); self.classes.len()];
        for s in &self.train {
            per_class[s.label].0 += 1;
        }
        for s in &self.val {
            per_class[s.label].1 += 1;
        }

        SplitStats {
            train_size: self.train.len(),
            val_size: self.val.len(),
            num_classes: self.classes.len(),
            fraction: self.fraction,
            seed: self.seed,
            per_class: self
                .classes
                .iter()
                .cloned()
                .zip(per_class)
                .map(|(name, (t, v))| (name, t, v))
                .collect(),
        }
    }
}

/// Statistics about a dataset split
#[derive(Debug, Clone)]
pub struct SplitStats {
    pub train_size: usize,
    pub val_size: usize,
    pub num_classes: usize,
    pub fraction: f64,
    pub seed: u64,
    /// (class, train count, val count)
    pub per_class: Vec<(String, usize, usize)>,
}

impl std::fmt::Display for SplitStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = (self.train_size + self.val_size).max(1) as f64;
        write!(
            f,
            "Split (fraction {}, seed {}): {} classes, train {} ({:.1}%), val {} ({:.1}%)",
            self.fraction,
            self.seed,
            self.num_classes,
            self.train_size,
            100.0 * self.train_size as f64 / total,
            self.val_size,
            100.0 * self.val_size as f64 / total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn synthetic_index(classes: &[(&str, usize)]) -> CorpusIndex {
        let names: Vec<String> = classes.iter().map(|(c, _)| c.to_string()).collect();
        let by_class = classes
            .iter()
            .enumerate()
            .map(|(label, (class, count))| {
                (0..*count)
                    .map(|i| Sample {
                        image_path: PathBuf::from(format!("{}/img_{:04}.jpg", class, i)),
                        label,
                        class_name: class.to_string(),
                    })
                    .collect()
            })
            .collect();

        CorpusIndex {
            root: PathBuf::from("corpus"),
            classes: names,
            by_class,
            skipped: Vec::new(),
        }
    }

    #[test]
    fn test_split_sizes_per_class() {
        let corpus = synthetic_index(&[("a", 100), ("b", 100), ("c", 100)]);
        let split = DatasetSplit::from_index(&corpus, &IndexConfig::new(0.1, 7));

        // 10 sampled per class -> 2 val + 8 train
        assert_eq!(split.train.len(), 24);
        assert_eq!(split.val.len(), 6);
        for (_, t, v) in split.stats().per_class {
            assert_eq!(t + v, 10);
        }
    }

    #[test]
    fn test_split_is_disjoint() {
        let corpus = synthetic_index(&[("a", 50), ("b", 30)]);
        let split = DatasetSplit::from_index(&corpus, &IndexConfig::new(0.5, 1));

        let train: HashSet<_> = split.train.iter().map(|s| &s.image_path).collect();
        assert!(split.val.iter().all(|s| !train.contains(&s.image_path)));
    }

    #[test]
    fn test_split_is_reproducible() {
        let corpus = synthetic_index(&[("a", 40), ("b", 40)]);
        let s1 = DatasetSplit::from_index(&corpus, &IndexConfig::new(0.5, 42));
        let s2 = DatasetSplit::from_index(&corpus, &IndexConfig::new(0.5, 42));
        let s3 = DatasetSplit::from_index(&corpus, &IndexConfig::new(0.5, 43));

        assert_eq!(s1, s2);
        assert_ne!(s1.train, s3.train);
    }

    #[test]
    fn test_tiny_fraction_keeps_one_per_class() {
        let corpus = synthetic_index(&[("a", 3), ("b", 5)]);
        let split = DatasetSplit::from_index(&corpus, &IndexConfig::new(0.01, 0));

        // one sampled image per class, round(1 * 0.2) = 0 val
        assert_eq!(split.train.len(), 2);
        assert!(split.val.is_empty());
    }

    #[test]
    fn test_invalid_fraction() {
        assert!(IndexConfig::new(0.0, 0).validate().is_err());
        assert!(IndexConfig::new(1.5, 0).validate().is_err());
        assert!(IndexConfig::new(f64::NAN, 0).validate().is_err());
        assert!(IndexConfig::new(1.0, 0).validate().is_ok());
        assert!(IndexConfig::new(0.5, 0).with_val_ratio(1.0).validate().is_err());
    }

    #[test]
    fn test_index_rejects_fraction_before_scanning() {
        let err = index("/definitely/not/a/corpus", 0.0, 1).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }
}
