//! Checkpoint persistence
//!
//! Each run keeps at most two checkpoints, `best` and `last`, stored as
//! MessagePack documents under `<root>/<run_id>/weights/`. A save writes
//! `<name>.tmp`, syncs it and renames it over the target, so readers only
//! ever observe complete checkpoints.

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::lock::RunLock;
use crate::model::ModelState;
use crate::utils::error::{IoResultExt, PipelineError, Result};

/// Directory holding the checkpoint files of a run
pub const WEIGHTS_DIR: &str = "weights";

/// The two checkpoint slots of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointName {
    /// Highest validation accuracy so far
    Best,
    /// Most recent epoch
    Last,
}

impl CheckpointName {
    pub const ALL: [CheckpointName; 2] = [CheckpointName::Best, CheckpointName::Last];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointName::Best => "best",
            CheckpointName::Last => "last",
        }
    }
}

impl std::fmt::Display for CheckpointName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointName {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "best" => Ok(CheckpointName::Best),
            "last" => Ok(CheckpointName::Last),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown checkpoint '{}', expected 'best' or 'last'",
                other
            ))),
        }
    }
}

/// Model weights plus what prediction needs to reuse them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub name: CheckpointName,
    pub model_state: ModelState,
    /// Epoch the weights were taken after (1-based)
    pub epoch: usize,
    pub val_accuracy_at_save: f64,
    /// Input resolution the model was trained on
    pub image_size: u32,
    /// Class names indexed by model output
    pub classes: Vec<String>,
}

/// Reads and writes the checkpoints of every run under a root directory
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<run_id>`
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// `<root>/<run_id>/weights/<name>`
    pub fn checkpoint_path(&self, run_id: &str, name: CheckpointName) -> PathBuf {
        self.run_dir(run_id).join(WEIGHTS_DIR).join(name.as_str())
    }

    /// Take the single-writer lock of a run
    pub fn acquire(&self, run_id: &str) -> Result<RunLock> {
        RunLock::acquire(&self.run_dir(run_id), run_id)
    }

    /// Atomically publish a checkpoint
    pub fn save(&self, lock: &RunLock, checkpoint: &Checkpoint) -> Result<()> {
        lock.ensure_owns(&checkpoint.run_id)?;

        let target = self.checkpoint_path(&checkpoint.run_id, checkpoint.name);
        let weights_dir = self.run_dir(&checkpoint.run_id).join(WEIGHTS_DIR);
        fs::create_dir_all(&weights_dir).at_path(&weights_dir)?;

        let bytes = rmp_serde::to_vec_named(checkpoint).map_err(|e| {
            PipelineError::Serialization(format!("failed to encode checkpoint: {}", e))
        })?;

        let tmp = target.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp).at_path(&tmp)?);
            writer.write_all(&bytes).at_path(&tmp)?;
            let file = writer
                .into_inner()
                .map_err(|e| PipelineError::io(&tmp, e.into_error()))?;
            file.sync_all().at_path(&tmp)?;
        }
        fs::rename(&tmp, &target).at_path(&target)?;
        sync_dir(&weights_dir);

        debug!(
            "Saved checkpoint {}/{} (epoch {}, val acc {:.4})",
            checkpoint.run_id, checkpoint.name, checkpoint.epoch, checkpoint.val_accuracy_at_save
        );
        Ok(())
    }

    /// Load a published checkpoint
    pub fn load(&self, run_id: &str, name: CheckpointName) -> Result<Checkpoint> {
        let path = self.checkpoint_path(run_id, name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PipelineError::CheckpointNotFound {
                    run_id: run_id.to_string(),
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(PipelineError::io(&path, e)),
        };

        let checkpoint: Checkpoint =
            rmp_serde::from_slice(&bytes).map_err(|e| PipelineError::CorruptArtifact {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if checkpoint.run_id != run_id || checkpoint.name != name {
            return Err(PipelineError::CorruptArtifact {
                path,
                reason: format!(
                    "file holds checkpoint {}/{}",
                    checkpoint.run_id, checkpoint.name
                ),
            });
        }

        info!(
            "Loaded checkpoint {}/{} from epoch {}",
            run_id, name, checkpoint.epoch
        );
        Ok(checkpoint)
    }

    pub fn exists(&self, run_id: &str, name: CheckpointName) -> bool {
        self.checkpoint_path(run_id, name).is_file()
    }

    /// Slots of a run that have been published
    pub fn list(&self, run_id: &str) -> Vec<CheckpointName> {
        CheckpointName::ALL
            .into_iter()
            .filter(|name| self.exists(run_id, *name))
            .collect()
    }
}

/// Persist a rename by syncing the parent directory where the platform allows it
fn sync_dir(dir: &Path) {
    if cfg!(unix) {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn checkpoint(run_id: &str, name: CheckpointName, epoch: usize) -> Checkpoint {
        Checkpoint {
            run_id: run_id.to_string(),
            name,
            model_state: ModelState(vec![epoch as u8; 16]),
            epoch,
            val_accuracy_at_save: 0.5,
            image_size: 64,
            classes: vec!["pizza".into(), "sushi".into()],
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let lock = store.acquire("r1").unwrap();

        let ckpt = checkpoint("r1", CheckpointName::Last, 2);
        store.save(&lock, &ckpt).unwrap();

        assert_eq!(store.load("r1", CheckpointName::Last).unwrap(), ckpt);
        assert_eq!(store.list("r1"), vec![CheckpointName::Last]);
        assert!(!store.checkpoint_path("r1", CheckpointName::Last).with_extension("tmp").exists());
    }

    #[test]
    fn test_overwrite_replaces() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let lock = store.acquire("r1").unwrap();

        store.save(&lock, &checkpoint("r1", CheckpointName::Last, 1)).unwrap();
        store.save(&lock, &checkpoint("r1", CheckpointName::Last, 2)).unwrap();
        assert_eq!(store.load("r1", CheckpointName::Last).unwrap().epoch, 2);
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let err = store.load("nope", CheckpointName::Best).unwrap_err();
        assert!(matches!(err, PipelineError::CheckpointNotFound { .. }));
    }

    #[test]
    fn test_save_rejects_foreign_run() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let lock = store.acquire("r1").unwrap();

        assert!(store.save(&lock, &checkpoint("r2", CheckpointName::Best, 1)).is_err());
        assert!(!store.exists("r2", CheckpointName::Best));
    }

    #[test]
    fn test_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = store.checkpoint_path("r1", CheckpointName::Best);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"\xc1garbage").unwrap();

        let err = store.load("r1", CheckpointName::Best).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptArtifact { .. }));
    }

    #[test]
    fn test_name_parsing() {
        assert_eq!("best".parse::<CheckpointName>().unwrap(), CheckpointName::Best);
        assert_eq!("LAST".parse::<CheckpointName>().unwrap(), CheckpointName::Last);
        assert!("middle".parse::<CheckpointName>().is_err());
    }
}
