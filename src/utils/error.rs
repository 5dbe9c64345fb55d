//! Error Handling Module
//!
//! Defines the error type shared by every stage of the pipeline.
//! Each variant carries the run id and/or path at fault and maps onto a
//! coarse [`ErrorKind`] so callers can branch on the category.

use std::path::PathBuf;

use thiserror::Error;

/// Coarse error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad corpus, path, configuration or image
    Input,
    /// Numeric, model or storage failure
    Resource,
    /// Artifacts disagree with each other or are malformed
    Consistency,
    /// A requested run or checkpoint does not exist
    NotFound,
    /// Another writer owns the run
    Conflict,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Input => "input",
            ErrorKind::Resource => "resource",
            ErrorKind::Consistency => "consistency",
            ErrorKind::NotFound => "not found",
            ErrorKind::Conflict => "conflict",
        };
        write!(f, "{}", name)
    }
}

/// Main error type for the food classifier pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Corpus root is missing or is not a directory
    #[error("Corpus not found at '{0}'")]
    CorpusNotFound(PathBuf),

    /// Corpus root has no class directory containing an image file
    #[error("No class directory with images under '{0}'")]
    EmptyDataset(PathBuf),

    /// A class directory is absent or has zero usable images
    #[error("Class '{class}' is missing or has no usable images at '{path}'")]
    MissingClass { class: String, path: PathBuf },

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A run with this id already has artifacts
    #[error("Run '{run_id}' already exists at '{path}' (use overwrite to replace it)")]
    RunExists { run_id: String, path: PathBuf },

    /// Image bytes could not be decoded
    #[error("Failed to load image at '{path}': {reason}")]
    UnreadableImage { path: PathBuf, reason: String },

    /// Requested image size differs from the one the run was trained with
    #[error(
        "Preprocessing mismatch{}: expected image size {expected}, got {actual}",
        run_suffix(.run_id)
    )]
    PreprocessingMismatch {
        run_id: Option<String>,
        expected: u32,
        actual: u32,
    },

    /// A persisted artifact could not be decoded or contradicts its location
    #[error("Corrupt artifact at '{path}': {reason}")]
    CorruptArtifact { path: PathBuf, reason: String },

    /// Checkpoint slot has never been written
    #[error("Checkpoint '{name}' not found for run '{run_id}'")]
    CheckpointNotFound { run_id: String, name: String },

    /// Run directory or its configuration record is missing
    #[error("Run '{run_id}' not found under '{path}'")]
    RunNotFound { run_id: String, path: PathBuf },

    /// Another trainer holds the run lock
    #[error("Run '{run_id}' is already active (lock file '{lock_path}')")]
    RunAlreadyActive { run_id: String, lock_path: PathBuf },

    /// Loss became NaN or infinite
    #[error("Non-finite {phase} loss in run '{run_id}' at epoch {epoch}")]
    NonFiniteLoss {
        run_id: String,
        epoch: usize,
        phase: &'static str,
    },

    /// Model backend failure
    #[error("Model error: {0}")]
    Model(String),

    /// The model could not classify a decoded input
    #[error("Prediction failed for '{input}': {reason}")]
    PredictionFailed { input: PathBuf, reason: String },

    /// IO error with the path that triggered it
    #[error("IO error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PipelineError {
    /// Category this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::CorpusNotFound(_)
            | PipelineError::EmptyDataset(_)
            | PipelineError::MissingClass { .. }
            | PipelineError::InvalidConfig(_)
            | PipelineError::RunExists { .. }
            | PipelineError::UnreadableImage { .. } => ErrorKind::Input,
            PipelineError::NonFiniteLoss { .. }
            | PipelineError::Model(_)
            | PipelineError::PredictionFailed { .. }
            | PipelineError::Io { .. }
            | PipelineError::Serialization(_) => ErrorKind::Resource,
            PipelineError::PreprocessingMismatch { .. } | PipelineError::CorruptArtifact { .. } => {
                ErrorKind::Consistency
            }
            PipelineError::CheckpointNotFound { .. } | PipelineError::RunNotFound { .. } => {
                ErrorKind::NotFound
            }
            PipelineError::RunAlreadyActive { .. } => ErrorKind::Conflict,
        }
    }

    /// Wrap an IO error with the path it concerns
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

fn run_suffix(run_id: &Option<String>) -> String {
    match run_id {
        Some(id) => format!(" in run '{}'", id),
        None => String::new(),
    }
}

/// Convenience Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Extension trait for attaching a path to IO results
pub trait IoResultExt<T> {
    /// Map an IO error into [`PipelineError::Io`] for `path`
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| PipelineError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::MissingClass {
            class: "sushi".to_string(),
            path: PathBuf::from("/data/food/sushi"),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("sushi"));
        assert!(msg.contains("/data/food/sushi"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            PipelineError::CorpusNotFound(PathBuf::from("x")).kind(),
            ErrorKind::Input
        );
        assert_eq!(
            PipelineError::PreprocessingMismatch {
                run_id: None,
                expected: 224,
                actual: 128
            }
            .kind(),
            ErrorKind::Consistency
        );
        assert_eq!(
            PipelineError::PredictionFailed {
                input: PathBuf::from("a.png"),
                reason: "backend".into()
            }
            .kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            PipelineError::RunAlreadyActive {
                run_id: "r".into(),
                lock_path: PathBuf::from("r/.lock")
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            PipelineError::CheckpointNotFound {
                run_id: "r".into(),
                name: "best".into()
            }
            .kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_mismatch_names_the_run() {
        let bound = PipelineError::PreprocessingMismatch {
            run_id: Some("e1-img8-f1-s1-deadbeef".into()),
            expected: 8,
            actual: 16,
        };
        assert_eq!(
            bound.to_string(),
            "Preprocessing mismatch in run 'e1-img8-f1-s1-deadbeef': expected image size 8, got 16"
        );

        let unbound = PipelineError::PreprocessingMismatch {
            run_id: None,
            expected: 8,
            actual: 16,
        };
        assert_eq!(
            unbound.to_string(),
            "Preprocessing mismatch: expected image size 8, got 16"
        );
    }

    #[test]
    fn test_io_context() {
        let result: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));

        let err = result.at_path("/tmp/missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(format!("{}", err).contains("/tmp/missing"));
    }
}
