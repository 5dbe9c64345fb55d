//! Run configuration, records and summaries

pub mod config;
pub mod metrics;
pub mod store;
pub mod summary;

pub use config::{derive_run_id, RunConfig};
pub use metrics::{export_csv, EpochMetric};
pub use store::{RunRecord, RunStore};
pub use summary::{finalize, RunStatus, RunSummary};
