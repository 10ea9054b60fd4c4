use crate::dispatch::{Delivery, JobLease};
use crate::options::JobOptions;
use crate::stages::CancelToken;

/// One execution attempt of one job.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub job_id: String,
    pub options: JobOptions,
    /// Delivery number, starting at 1.
    pub number: u32,
    /// Fences status writes when present.
    pub lease: Option<JobLease>,
    pub cancel: CancelToken,
}

impl Attempt {
    /// An unleased first attempt, for running a job in-process.
    pub fn new(job_id: &str, options: JobOptions) -> Self {
        Self {
            job_id: job_id.to_string(),
            options,
            number: 1,
            lease: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            job_id: delivery.envelope.job_id.clone(),
            options: delivery.envelope.options.clone(),
            number: delivery.envelope.attempt,
            lease: Some(delivery.lease.clone()),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}
