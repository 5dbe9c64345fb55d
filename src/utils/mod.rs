//! Utility modules: errors and logging

pub mod error;
pub mod logging;

pub use error::{ErrorKind, IoResultExt, PipelineError, Result};
pub use logging::{init_logging, LogConfig, LogLevel, TrainingLogger};
