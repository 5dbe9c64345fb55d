//! Run summaries
//!
//! [`finalize`] is pure: the same inputs always produce a summary that
//! serializes to byte-identical JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::RunConfig;
use super::metrics::EpochMetric;
use crate::utils::error::{PipelineError, Result};

/// Terminal state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Aborted => write!(f, "aborted"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub config: RunConfig,
    pub status: RunStatus,
    /// Metrics of the last completed epoch
    pub final_metrics: Option<EpochMetric>,
    /// Metrics of the epoch with the highest validation accuracy
    pub best_metrics: Option<EpochMetric>,
    pub total_epochs_run: usize,
    pub wall_clock_duration: Duration,
    /// Error message of a failed run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Summarise a run from its metrics
///
/// Ties in validation accuracy resolve to the earliest epoch.
pub fn finalize(
    run_id: &str,
    config: &RunConfig,
    metrics: &[EpochMetric],
    status: RunStatus,
    wall_clock: Duration,
) -> RunSummary {
    let best_metrics = metrics
        .iter()
        .fold(None::<&EpochMetric>, |best, m| match best {
            Some(b) if m.val_accuracy <= b.val_accuracy => Some(b),
            _ => Some(m),
        })
        .cloned();

    RunSummary {
        run_id: run_id.to_string(),
        config: config.clone(),
        status,
        final_metrics: metrics.last().cloned(),
        best_metrics,
        total_epochs_run: metrics.len(),
        wall_clock_duration: wall_clock,
        failure: None,
    }
}

impl RunSummary {
    /// Attach the error that ended a failed run
    pub fn with_failure(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Pretty JSON encoding, stable for equal summaries
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| PipelineError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| PipelineError::Serialization(e.to_string()))
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Run {}", self.run_id)?;
        writeln!(f, "  Status:       {}", self.status)?;
        writeln!(
            f,
            "  Epochs run:   {}/{}",
            self.total_epochs_run, self.config.epochs
        )?;
        writeln!(
            f,
            "  Wall clock:   {:.1}s",
            self.wall_clock_duration.as_secs_f64()
        )?;
        if let Some(best) = &self.best_metrics {
            writeln!(
                f,
                "  Best epoch:   {} (val acc {:.2}%)",
                best.epoch,
                best.val_accuracy * 100.0
            )?;
        }
        if let Some(last) = &self.final_metrics {
            writeln!(
                f,
                "  Final epoch:  {} (val acc {:.2}%, val loss {:.4})",
                last.epoch,
                last.val_accuracy * 100.0,
                last.val_loss
            )?;
        }
        if let Some(reason) = &self.failure {
            writeln!(f, "  Failure:      {}", reason)?;
        }
        Ok(())
    }
}
