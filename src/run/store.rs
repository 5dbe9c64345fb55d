//! Run records on disk
//!
//! Owns everything in a run directory except the checkpoints:
//!
//! ```text
//! <root>/<run_id>/
//! ├── config.json     written once when the run starts
//! ├── split.json      dataset manifest, written once when the run starts
//! ├── metrics.jsonl   one EpochMetric per line, append-only
//! └── summary.json    written once when the run ends
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::RunConfig;
use super::metrics::EpochMetric;
use super::summary::RunSummary;
use crate::checkpoint::lock::{LockInfo, RunLock, LOCK_FILE};
use crate::dataset::split::DatasetSplit;
use crate::utils::error::{IoResultExt, PipelineError, Result};

pub const CONFIG_FILE: &str = "config.json";
pub const SPLIT_FILE: &str = "split.json";
pub const METRICS_FILE: &str = "metrics.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";

/// One run as found on disk
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub config: RunConfig,
    /// Absent while the run is in progress or if it crashed
    pub summary: Option<RunSummary>,
    /// Whether a trainer currently holds the run lock
    pub active: bool,
    /// Who holds the lock, when its contents are readable
    pub holder: Option<LockInfo>,
}

/// Reads and writes run records under a root directory
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Whether a run with this id has been started
    pub fn exists(&self, run_id: &str) -> bool {
        self.run_dir(run_id).join(CONFIG_FILE).is_file()
    }

    /// Prepare the run directory for a new training run
    ///
    /// An existing run is refused with `RunExists` unless `overwrite` is
    /// set, in which case every record except the lock is removed first.
    pub fn prepare(&self, lock: &RunLock, config: &RunConfig, overwrite: bool) -> Result<()> {
        let run_id = lock.run_id();
        let dir = self.run_dir(run_id);

        if self.exists(run_id) {
            if !overwrite {
                return Err(PipelineError::RunExists {
                    run_id: run_id.to_string(),
                    path: dir,
                });
            }
            warn!("Overwriting existing run {}", run_id);
            self.clear(lock)?;
        }

        fs::create_dir_all(&dir).at_path(&dir)?;
        write_json_once(&dir.join(CONFIG_FILE), config)?;
        info!("Prepared run directory {:?}", dir);
        Ok(())
    }

    /// Record the dataset manifest of a run
    pub fn write_split(&self, lock: &RunLock, split: &DatasetSplit) -> Result<()> {
        write_json_once(&self.run_dir(lock.run_id()).join(SPLIT_FILE), split)
    }

    /// Append one epoch's metrics and sync before returning
    pub fn append_metric(&self, lock: &RunLock, metric: &EpochMetric) -> Result<()> {
        let path = self.run_dir(lock.run_id()).join(METRICS_FILE);
        let mut line = serde_json::to_string(metric)
            .map_err(|e| PipelineError::Serialization(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .at_path(&path)?;
        file.write_all(line.as_bytes()).at_path(&path)?;
        file.sync_all().at_path(&path)?;

        debug!("Appended metrics for epoch {} to {:?}", metric.epoch, path);
        Ok(())
    }

    /// Persist the final summary of a run
    pub fn write_summary(&self, lock: &RunLock, summary: &RunSummary) -> Result<()> {
        lock.ensure_owns(&summary.run_id)?;
        write_json_once(&self.run_dir(lock.run_id()).join(SUMMARY_FILE), summary)
    }

    pub fn read_config(&self, run_id: &str) -> Result<RunConfig> {
        let path = self.run_dir(run_id).join(CONFIG_FILE);
        read_json(&path)?.ok_or_else(|| PipelineError::RunNotFound {
            run_id: run_id.to_string(),
            path: self.run_dir(run_id),
        })
    }

    pub fn read_split(&self, run_id: &str) -> Result<Option<DatasetSplit>> {
        read_json(&self.run_dir(run_id).join(SPLIT_FILE))
    }

    pub fn read_summary(&self, run_id: &str) -> Result<Option<RunSummary>> {
        read_json(&self.run_dir(run_id).join(SUMMARY_FILE))
    }

    /// Metrics of a run in epoch order
    pub fn read_metrics(&self, run_id: &str) -> Result<Vec<EpochMetric>> {
        if !self.exists(run_id) {
            return Err(PipelineError::RunNotFound {
                run_id: run_id.to_string(),
                path: self.run_dir(run_id),
            });
        }

        let path = self.run_dir(run_id).join(METRICS_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::io(&path, e)),
        };

        let mut metrics = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.at_path(&path)?;
            if line.trim().is_empty() {
                continue;
            }
            let metric: EpochMetric =
                serde_json::from_str(&line).map_err(|e| PipelineError::CorruptArtifact {
                    path: path.clone(),
                    reason: format!("line {}: {}", idx + 1, e),
                })?;
            metrics.push(metric);
        }
        Ok(metrics)
    }

    /// Every run under the root, sorted by id
    pub fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::io(&self.root, e)),
        };

        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|id| self.exists(id))
            .collect();
        ids.sort();

        let mut runs = Vec::with_capacity(ids.len());
        for run_id in ids {
            let config = self.read_config(&run_id)?;
            let summary = match self.read_summary(&run_id) {
                Ok(summary) => summary,
                Err(e) => {
                    warn!("Ignoring unreadable summary of {}: {}", run_id, e);
                    None
                }
            };
            let lock_path = self.run_dir(&run_id).join(LOCK_FILE);
            let active = lock_path.exists();
            let holder = if active {
                RunLock::read_info(&lock_path)
                    .map_err(|e| warn!("Unreadable lock of {}: {}", run_id, e))
                    .ok()
            } else {
                None
            };
            runs.push(RunRecord {
                run_id,
                config,
                summary,
                active,
                holder,
            });
        }
        Ok(runs)
    }

    /// Remove every record of a run except its lock file
    fn clear(&self, lock: &RunLock) -> Result<()> {
        let dir = self.run_dir(lock.run_id());
        for entry in fs::read_dir(&dir).at_path(&dir)? {
            let entry = entry.at_path(&dir)?;
            let path = entry.path();
            if entry.file_name() == LOCK_FILE {
                continue;
            }
            if path.is_dir() {
                fs::remove_dir_all(&path).at_path(&path)?;
            } else {
                fs::remove_file(&path).at_path(&path)?;
            }
        }
        Ok(())
    }
}

/// Write pretty JSON to a file that must not exist yet
fn write_json_once<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| PipelineError::Serialization(e.to_string()))?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| {
            if e.kind() == ErrorKind::AlreadyExists {
                PipelineError::CorruptArtifact {
                    path: path.to_path_buf(),
                    reason: "record is write-once and already exists".to_string(),
                }
            } else {
                PipelineError::io(path, e)
            }
        })?;
    file.write_all(&json).at_path(path)?;
    file.sync_all().at_path(path)
}

/// Read a JSON record; `None` when the file does not exist
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PipelineError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PipelineError::CorruptArtifact {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::summary::{finalize, RunStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    fn metric(epoch: usize) -> EpochMetric {
        EpochMetric {
            epoch,
            train_loss: 1.0,
            val_loss: 1.1,
            val_accuracy: 0.1 * epoch as f64,
            skipped_samples: 0,
        }
    }

    #[test]
    fn test_prepare_and_read_config() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        let config = RunConfig::new(2, 32, 0.5);
        let run_id = config.derive_run_id();

        let lock = RunLock::acquire(&store.run_dir(&run_id), &run_id).unwrap();
        store.prepare(&lock, &config, false).unwrap();

        assert!(store.exists(&run_id));
        assert_eq!(store.read_config(&run_id).unwrap(), config);
    }

    #[test]
    fn test_prepare_existing_run() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        let config = RunConfig::new(2, 32, 0.5);
        let run_id = config.derive_run_id();
        let lock = RunLock::acquire(&store.run_dir(&run_id), &run_id).unwrap();

        store.prepare(&lock, &config, false).unwrap();
        store.append_metric(&lock, &metric(1)).unwrap();

        let err = store.prepare(&lock, &config, false).unwrap_err();
        assert!(matches!(err, PipelineError::RunExists { .. }));

        store.prepare(&lock, &config, true).unwrap();
        assert!(store.read_metrics(&run_id).unwrap().is_empty());
        assert!(lock.path().exists());
    }

    #[test]
    fn test_metrics_append_in_order() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        let config = RunConfig::new(3, 32, 0.5);
        let run_id = config.derive_run_id();
        let lock = RunLock::acquire(&store.run_dir(&run_id), &run_id).unwrap();
        store.prepare(&lock, &config, false).unwrap();

        for epoch in 1..=3 {
            store.append_metric(&lock, &metric(epoch)).unwrap();
        }
        let epochs: Vec<_> = store
            .read_metrics(&run_id)
            .unwrap()
            .iter()
            .map(|m| m.epoch)
            .collect();
        assert_eq!(epochs, vec![1, 2, 3]);
    }

    #[test]
    fn test_summary_written_once() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        let config = RunConfig::new(1, 32, 0.5);
        let run_id = config.derive_run_id();
        let lock = RunLock::acquire(&store.run_dir(&run_id), &run_id).unwrap();
        store.prepare(&lock, &config, false).unwrap();

        let summary = finalize(&run_id, &config, &[metric(1)], RunStatus::Completed, Duration::ZERO);
        store.write_summary(&lock, &summary).unwrap();
        assert!(store.write_summary(&lock, &summary).is_err());
        assert_eq!(store.read_summary(&run_id).unwrap(), Some(summary));
    }

    #[test]
    fn test_list_runs() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());

        for epochs in [1, 2] {
            let config = RunConfig::new(epochs, 32, 1.0);
            let run_id = config.derive_run_id();
            let lock = RunLock::acquire(&store.run_dir(&run_id), &run_id).unwrap();
            store.prepare(&lock, &config, false).unwrap();
        }
        fs::create_dir_all(dir.path().join("not-a-run")).unwrap();

        let runs = store.list_runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.summary.is_none() && !r.active));
    }

    #[test]
    fn test_list_runs_reports_lock_holder() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        let config = RunConfig::new(1, 32, 1.0);
        let run_id = config.derive_run_id();

        let lock = RunLock::acquire(&store.run_dir(&run_id), &run_id).unwrap();
        store.prepare(&lock, &config, false).unwrap();

        let runs = store.list_runs().unwrap();
        assert!(runs[0].active);
        let holder = runs[0].holder.as_ref().unwrap();
        assert_eq!(holder.run_id, run_id);
        assert_eq!(holder.pid, std::process::id());

        drop(lock);
        let runs = store.list_runs().unwrap();
        assert!(!runs[0].active);
        assert!(runs[0].holder.is_none());
    }

    #[test]
    fn test_missing_run() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        assert!(matches!(
            store.read_config("ghost").unwrap_err(),
            PipelineError::RunNotFound { .. }
        ));
        assert!(store.list_runs().unwrap().is_empty());
    }
}
