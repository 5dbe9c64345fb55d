//! Per-epoch metrics

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::error::{PipelineError, Result};

/// Metrics of one completed epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetric {
    /// 1-based epoch number
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    /// Images that could not be read during this epoch
    #[serde(default)]
    pub skipped_samples: usize,
}

/// Write metrics as CSV with a header row
pub fn export_csv(metrics: &[EpochMetric], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    for metric in metrics {
        writer.serialize(metric).map_err(|e| csv_error(path, e))?;
    }
    writer
        .flush()
        .map_err(|e| PipelineError::io(path, e))
}

fn csv_error(path: &Path, e: csv::Error) -> PipelineError {
    PipelineError::Serialization(format!("failed to write {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let metrics = vec![
            EpochMetric {
                epoch: 1,
                train_loss: 1.5,
                val_loss: 1.2,
                val_accuracy: 0.5,
                skipped_samples: 0,
            },
            EpochMetric {
                epoch: 2,
                train_loss: 1.0,
                val_loss: 0.9,
                val_accuracy: 0.6,
                skipped_samples: 2,
            },
        ];

        export_csv(&metrics, &path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(
            lines[0],
            "epoch,train_loss,val_loss,val_accuracy,skipped_samples"
        );
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("2,1.0,0.9,0.6,2"));
    }
}
