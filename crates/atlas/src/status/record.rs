use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metrics::QaMetrics;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// `completed` and `failed` accept no further stage work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted state of one job.
///
/// Every field carries a serde default and unknown fields are kept in
/// `extra`, so records written by older or newer builds stay readable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusRecord {
    pub job_id: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub num_images: usize,
    #[serde(default)]
    pub total_size_bytes: u64,
    #[serde(default)]
    pub total_size_mb: f64,
    #[serde(default)]
    pub options: Value,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<QaMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, alias = "traceback", skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    /// Delivery attempt that last wrote this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StatusRecord {
    /// A fresh record for `job_id` with nothing but identity and timestamps.
    pub fn new(job_id: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Queued,
            progress: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            num_images: 0,
            total_size_bytes: 0,
            total_size_mb: 0.0,
            options: Value::Null,
            message: String::new(),
            metrics: None,
            error: None,
            trace: None,
            attempt: None,
            extra: BTreeMap::new(),
        }
    }

    /// Merges `update` into this record and stamps `updated_at`.
    ///
    /// Progress never moves backwards while the job stays in `processing`,
    /// is clamped to 100, and is pinned to 100 on completion. Failure
    /// details are cleared whenever the job leaves `failed`.
    pub fn apply(&mut self, update: StatusUpdate) {
        let previous = self.status;
        if let Some(status) = update.status {
            self.status = status;
        }

        if let Some(progress) = update.progress {
            let progress = progress.min(100);
            self.progress = if previous == JobStatus::Processing
                && self.status == JobStatus::Processing
            {
                self.progress.max(progress)
            } else {
                progress
            };
        }

        if let Some(message) = update.message {
            self.message = message;
        }
        if let Some(num_images) = update.num_images {
            self.num_images = num_images;
        }
        if let Some(total_size_bytes) = update.total_size_bytes {
            self.total_size_bytes = total_size_bytes;
            self.total_size_mb = bytes_to_mb(total_size_bytes);
        }
        if let Some(options) = update.options {
            self.options = options;
        }
        if let Some(metrics) = update.metrics {
            self.metrics = Some(metrics);
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = Some(completed_at);
        }
        if let Some(attempt) = update.attempt {
            self.attempt = Some(attempt);
        }

        match self.status {
            JobStatus::Failed => {
                if let Some(error) = update.error {
                    self.error = Some(error);
                }
                if let Some(trace) = update.trace {
                    self.trace = Some(trace);
                }
            }
            JobStatus::Completed => {
                self.progress = 100;
                self.error = None;
                self.trace = None;
            }
            _ => {
                self.error = None;
                self.trace = None;
            }
        }

        self.updated_at = Utc::now();
        if let Some(completed_at) = self.completed_at {
            if completed_at < self.created_at {
                self.completed_at = Some(self.created_at);
            }
        }
    }
}

/// Megabytes rounded to two decimals.
pub fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

/// A partial record: only `Some` fields are merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub num_images: Option<usize>,
    pub total_size_bytes: Option<u64>,
    pub options: Option<Value>,
    pub metrics: Option<QaMetrics>,
    pub error: Option<String>,
    pub trace: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt: Option<u32>,
}

impl StatusUpdate {
    pub fn queued(num_images: usize, total_size_bytes: u64, options: Value) -> Self {
        Self {
            status: Some(JobStatus::Queued),
            progress: Some(0),
            message: Some("Job queued for processing".to_string()),
            num_images: Some(num_images),
            total_size_bytes: Some(total_size_bytes),
            options: Some(options),
            ..Self::default()
        }
    }

    pub fn processing(progress: u8, message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            progress: Some(progress),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn completed(metrics: Option<QaMetrics>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            message: Some("Reconstruction complete".to_string()),
            metrics,
            completed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn failed(progress: u8, cause: impl Into<String>, trace: Option<String>) -> Self {
        let cause = cause.into();
        Self {
            status: Some(JobStatus::Failed),
            progress: Some(progress),
            message: Some(format!("Error: {}", cause)),
            error: Some(cause),
            trace,
            ..Self::default()
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}
