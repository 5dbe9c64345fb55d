//! Food corpus loader
//!
//! Scans a corpus laid out as one directory per class:
//!
//! ```text
//! corpus_root/
//! ├── apple_pie/
//! │   ├── 1005649.jpg
//! │   └── ...
//! ├── sushi/
//! │   └── ...
//! └── ...
//! ```
//!
//! Classes are sorted by directory name and samples by path, so the same
//! corpus yields the same index on every filesystem.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::ImageReader;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::utils::error::{IoResultExt, PipelineError, Result};

/// File extensions recognised as images (compared case-insensitively)
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// A single labeled image in the corpus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Path to the image file
    pub image_path: PathBuf,
    /// Index into the sorted class list
    pub label: usize,
    /// Directory name the sample came from
    pub class_name: String,
}

/// Every usable sample of a corpus, grouped by class
#[derive(Debug, Clone)]
pub struct CorpusIndex {
    /// Root directory of the corpus
    pub root: PathBuf,
    /// Sorted class names; a sample's label indexes this list
    pub classes: Vec<String>,
    /// Samples per class, in label order, each sorted by path
    pub by_class: Vec<Vec<Sample>>,
    /// Files with an image extension whose header did not decode
    pub skipped: Vec<PathBuf>,
}

impl CorpusIndex {
    /// Scan `root`, discovering class directories
    pub fn scan<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::scan_with(root, None)
    }

    /// Scan `root`, optionally restricted to a declared class list
    ///
    /// Without a declared list every subdirectory holding at least one
    /// image file becomes a class. With one, each declared class must
    /// exist and hold a usable image.
    pub fn scan_with<P: AsRef<Path>>(root: P, declared: Option<&[String]>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        info!("Indexing corpus at {:?}", root);

        if !root.is_dir() {
            return Err(PipelineError::CorpusNotFound(root));
        }

        let discovered = discover_class_dirs(&root)?;
        if discovered.is_empty() {
            return Err(PipelineError::EmptyDataset(root));
        }

        let classes: Vec<String> = match declared {
            Some(names) => {
                let mut names: Vec<String> = names.to_vec();
                names.sort();
                names.dedup();
                for name in &names {
                    if !discovered.contains_key(name) {
                        return Err(PipelineError::MissingClass {
                            class: name.clone(),
                            path: root.join(name),
                        });
                    }
                }
                names
            }
            None => discovered.keys().cloned().collect(),
        };

        let mut by_class = Vec::with_capacity(classes.len());
        let mut skipped = Vec::new();

        for (label, class_name) in classes.iter().enumerate() {
            let files = &discovered[class_name];
            let mut samples = Vec::with_capacity(files.len());

            for path in files {
                match probe_image(path) {
                    Ok(()) => samples.push(Sample {
                        image_path: path.clone(),
                        label,
                        class_name: class_name.clone(),
                    }),
                    Err(reason) => {
                        warn!("Skipping unusable image {:?}: {}", path, reason);
                        skipped.push(path.clone());
                    }
                }
            }

            if samples.is_empty() {
                return Err(PipelineError::MissingClass {
                    class: class_name.clone(),
                    path: root.join(class_name),
                });
            }

            debug!("Class '{}' (label {}): {} samples", class_name, label, samples.len());
            by_class.push(samples);
        }

        let total: usize = by_class.iter().map(Vec::len).sum();
        info!(
            "Indexed {} samples across {} classes ({} skipped)",
            total,
            classes.len(),
            skipped.len()
        );

        Ok(Self {
            root,
            classes,
            by_class,
            skipped,
        })
    }

    /// Number of classes
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Total number of usable samples
    pub fn len(&self) -> usize {
        self.by_class.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-class sample counts
    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            total_samples: self.len(),
            class_counts: self
                .classes
                .iter()
                .cloned()
                .zip(self.by_class.iter().map(Vec::len))
                .collect(),
            skipped: self.skipped.len(),
        }
    }
}

/// Statistics about an indexed corpus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetStats {
    pub total_samples: usize,
    pub class_counts: Vec<(String, usize)>,
    pub skipped: usize,
}

impl std::fmt::Display for DatasetStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Dataset Statistics:")?;
        writeln!(f, "  Total samples: {}", self.total_samples)?;
        writeln!(f, "  Number of classes: {}", self.class_counts.len())?;
        writeln!(f, "  Skipped files: {}", self.skipped)?;
        writeln!(f, "  Samples per class:")?;
        for (idx, (name, count)) in self.class_counts.iter().enumerate() {
            let bar_len = if self.total_samples == 0 {
                0
            } else {
                (*count as f32 / self.total_samples as f32 * 40.0) as usize
            };
            writeln!(f, "    {:3}. {:30} {:6} {}", idx, name, count, "█".repeat(bar_len))?;
        }
        Ok(())
    }
}

/// Whether the path carries one of the recognised image extensions
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Class directory name -> image files sorted by path
///
/// Directories without any image file are not classes.
fn discover_class_dirs(root: &Path) -> Result<BTreeMap<String, Vec<PathBuf>>> {
    let mut classes = BTreeMap::new();

    for entry in std::fs::read_dir(root).at_path(root)? {
        let entry = entry.at_path(root)?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            warn!("Skipping class directory with non UTF-8 name: {:?}", path);
            continue;
        };

        let mut files: Vec<PathBuf> = WalkDir::new(&path)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| has_image_extension(p))
            .collect();

        if files.is_empty() {
            debug!("Ignoring directory without images: {:?}", path);
            continue;
        }

        files.sort();
        classes.insert(name, files);
    }

    Ok(classes)
}

/// Check that a file's header decodes to a known format with non-zero size
fn probe_image(path: &Path) -> std::result::Result<(), String> {
    let reader = ImageReader::open(path)
        .map_err(|e| e.to_string())?
        .with_guessed_format()
        .map_err(|e| e.to_string())?;

    if reader.format().is_none() {
        return Err("unknown image format".to_string());
    }

    let (width, height) = reader.into_dimensions().map_err(|e| e.to_string())?;
    if width == 0 || height == 0 {
        return Err(format!("zero-sized image ({}x{})", width, height));
    }
    Ok(())
}
