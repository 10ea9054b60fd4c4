pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod options;
pub mod pipeline;
pub mod sanitize;
pub mod service;
pub mod stages;
pub mod status;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use broadcast::{JobProgressEvent, ProgressBroadcaster};
pub use config::{load_settings, load_settings_from_str, LogFormat, LoggingSettings, Settings};
pub use dispatch::{DispatchHandle, Dispatcher, FileQueue};
pub use error::{
    AtlasError, ConfigError, DispatchError, Result, ServiceError, StatusError, StorageError,
    ValidationError, WorkerError,
};
pub use metrics::{EstimatedQuality, QaMetrics};
pub use options::{JobOptions, Quality};
pub use pipeline::{Attempt, AttemptOutcome, ExecutorError, PipelineExecutor};
pub use service::{validate_job_id, ArtifactHandle, Service, SubmitReceipt};
pub use stages::{StageAdapter, StageRegistry};
pub use status::{JobStatus, StatusRecord, StatusStore};
pub use storage::{ArtifactStore, Upload, WorkspaceManager};
pub use telemetry::init_tracing;
pub use worker::{AttemptReport, PoolControl, ReportOutcome, WorkerPool};
