//! Single-writer run lock
//!
//! A trainer owns a run while `<root>/<run_id>/.lock` exists. The file is
//! created with `create_new`, so a second acquisition fails immediately,
//! and it is removed when the [`RunLock`] guard drops.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::utils::error::{IoResultExt, PipelineError, Result};

/// Name of the lock file inside a run directory
pub const LOCK_FILE: &str = ".lock";

/// Contents of a lock file, for diagnosing stale locks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub run_id: String,
    pub pid: u32,
    /// RFC 3339 acquisition time
    pub acquired_at: String,
}

/// Exclusive ownership of a run directory
#[derive(Debug)]
pub struct RunLock {
    run_id: String,
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock of `run_dir`, creating the directory if needed
    pub fn acquire(run_dir: &Path, run_id: &str) -> Result<Self> {
        fs::create_dir_all(run_dir).at_path(run_dir)?;
        let path = run_dir.join(LOCK_FILE);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match Self::read_info(&path) {
                    Ok(holder) => warn!(
                        "Run {} is held by pid {} since {}",
                        run_id, holder.pid, holder.acquired_at
                    ),
                    Err(e) => warn!("Run {} is locked by an unknown holder: {}", run_id, e),
                }
                return Err(PipelineError::RunAlreadyActive {
                    run_id: run_id.to_string(),
                    lock_path: path,
                });
            }
            Err(e) => return Err(PipelineError::io(&path, e)),
        };

        let info = LockInfo {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now().to_rfc3339(),
        };
        let lock = Self {
            run_id: run_id.to_string(),
            path,
        };

        // From here on the guard removes the file even if writing fails
        let json = serde_json::to_vec(&info)
            .map_err(|e| PipelineError::Serialization(e.to_string()))?;
        file.write_all(&json).at_path(&lock.path)?;
        file.sync_all().at_path(&lock.path)?;

        debug!("Acquired lock {:?}", lock.path);
        Ok(lock)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fail unless this guard owns `run_id`
    pub fn ensure_owns(&self, run_id: &str) -> Result<()> {
        if self.run_id != run_id {
            return Err(PipelineError::CorruptArtifact {
                path: self.path.clone(),
                reason: format!(
                    "write for run '{}' attempted under the lock of run '{}'",
                    run_id, self.run_id
                ),
            });
        }
        Ok(())
    }

    /// Read the holder information of an existing lock file
    pub fn read_info(path: &Path) -> Result<LockInfo> {
        let bytes = fs::read(path).at_path(path)?;
        serde_json::from_slice(&bytes).map_err(|e| PipelineError::CorruptArtifact {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Released lock {:?}", self.path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to release lock {:?}: {}", self.path, e),
        }
    }
}
