use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::options::JobOptions;

/// A queued request to execute one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub dispatch_id: String,
    pub job_id: String,
    pub options: JobOptions,
    /// Delivery number, starting at 1.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(job_id: &str, options: JobOptions) -> Self {
        Self {
            dispatch_id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            options,
            attempt: 1,
            enqueued_at: Utc::now(),
        }
    }

    /// Queue file name: zero-padded enqueue time first, so lexical order is
    /// FIFO order.
    pub fn file_name(&self) -> String {
        let nanos = self.enqueued_at.timestamp_nanos_opt().unwrap_or_default();
        format!("{:020}-{}.json", nanos.max(0), self.job_id)
    }

    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            dispatch_id: self.dispatch_id.clone(),
        }
    }
}

/// Returned to the submitter once a job is enqueued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchHandle {
    pub dispatch_id: String,
}

/// Job id encoded in a queue file name, if it is one.
pub fn job_id_from_file_name(name: &str) -> Option<&str> {
    let stem = name.strip_suffix(".json")?;
    let (nanos, job_id) = stem.split_once('-')?;
    if nanos.is_empty() || !nanos.bytes().all(|b| b.is_ascii_digit()) || job_id.is_empty() {
        return None;
    }
    Some(job_id)
}
