use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::ExecutorError;
use crate::status::JobStatus;
use crate::storage::StagingError;

#[derive(Error, Debug)]
pub enum AtlasError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Status store error: {0}")]
    Status(#[from] StatusError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Pipeline error: {0}")]
    Executor(#[from] ExecutorError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid value for environment variable {name}: '{value}'")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Invalid command template for stage '{stage}': {reason}")]
    InvalidTool { stage: String, reason: String },

    #[error("No platform data directory available; set storage_root explicitly")]
    NoStorageRoot,
}

/// Rejections raised synchronously at the submission boundary.
/// None of them leave a job behind.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid job ID format: '{0}'")]
    InvalidJobId(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Minimum {min} images required, got {actual}")]
    TooFewInputs { min: usize, actual: usize },

    #[error("Maximum {max} images allowed")]
    TooManyInputs { max: usize },

    #[error("Total upload size exceeds {limit_mb}MB limit")]
    PayloadTooLarge { limit_mb: u64 },

    #[error("Unsupported media type for upload '{filename}'")]
    UnsupportedMedia { filename: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove '{path}': {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workspace does not exist: {0}")]
    WorkspaceMissing(PathBuf),

    #[error("Expected file is missing: {0}")]
    MissingFile(PathBuf),
}

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Failed to read status record '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt status record '{path}': {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to persist status record: {0}")]
    Write(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Queue I/O failed at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode queue message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to persist queue message: {0}")]
    Write(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Execution thread for job {0} panicked")]
    AttemptPanicked(String),
}

/// Errors surfaced by the service facade, shaped after the external
/// interface: validation, not-found, conflict, data loss, infrastructure.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job not completed yet. Current status: {status}")]
    Conflict { job_id: String, status: JobStatus },

    #[error("Artifact file not found for job {0}")]
    ArtifactMissing(String),

    #[error("Infrastructure failure: {0}")]
    Infrastructure(#[source] AtlasError),
}

impl From<StorageError> for ServiceError {
    fn from(e: StorageError) -> Self {
        ServiceError::Infrastructure(e.into())
    }
}

impl From<DispatchError> for ServiceError {
    fn from(e: DispatchError) -> Self {
        ServiceError::Infrastructure(e.into())
    }
}

impl From<WorkerError> for ServiceError {
    fn from(e: WorkerError) -> Self {
        ServiceError::Infrastructure(e.into())
    }
}

impl From<StagingError> for ServiceError {
    fn from(e: StagingError) -> Self {
        match e {
            StagingError::Validation(e) => ServiceError::Validation(e),
            StagingError::Storage(e) => e.into(),
        }
    }
}

impl From<StatusError> for ServiceError {
    fn from(e: StatusError) -> Self {
        match e {
            StatusError::NotFound(job_id) => ServiceError::NotFound(job_id),
            other => ServiceError::Infrastructure(other.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AtlasError>;
