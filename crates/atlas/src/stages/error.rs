use std::path::PathBuf;

use thiserror::Error;

use crate::storage::StageDir;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("Failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}")]
    ToolFailed {
        program: String,
        status: String,
        /// Tail of the tool's stderr.
        stderr: String,
    },

    #[error("Expected output '{pattern}' not found in {dir}")]
    MissingOutput { pattern: String, dir: PathBuf },

    #[error("No input files in {0}")]
    NoInputs(PathBuf),

    #[error("Stage input '{0}' was not provided")]
    MissingInput(StageDir),

    #[error("Invalid command template: {0}")]
    Template(String),

    #[error("Image processing failed for '{path}': {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("I/O failed at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stage cancelled: {0}")]
    Cancelled(String),
}

impl StageError {
    /// Operator-facing detail kept in the status record's trace.
    pub fn diagnostic(&self) -> Option<String> {
        match self {
            StageError::ToolFailed { stderr, .. } if !stderr.is_empty() => Some(stderr.clone()),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled(_))
    }
}

/// A stage topology that cannot run.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registry has no stages")]
    Empty,

    #[error("Stage weights sum to {total}, expected 100")]
    InvalidWeights { total: u32 },

    #[error("Stage '{stage}' reads '{dir}', which no earlier stage produces")]
    UnresolvedInput { stage: String, dir: StageDir },

    #[error("Stage '{stage}' has no inputs")]
    NoInputs { stage: String },
}
