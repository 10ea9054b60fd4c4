use tracing::warn;

use crate::dispatch::LeaseManager;
use crate::error::StatusError;
use crate::status::{StatusRecord, StatusStore, StatusUpdate};

use super::context::Attempt;
use super::error::ExecutorError;

/// Status writes of a single attempt.
///
/// Each write first confirms the attempt still holds its lease, and only
/// updates an existing record: a job deleted mid-run is never recreated.
pub struct ProgressWriter<'a> {
    store: &'a StatusStore,
    leases: Option<&'a LeaseManager>,
    attempt: &'a Attempt,
}

impl<'a> ProgressWriter<'a> {
    pub fn new(store: &'a StatusStore, leases: Option<&'a LeaseManager>, attempt: &'a Attempt) -> Self {
        Self {
            store,
            leases,
            attempt,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.attempt.job_id
    }

    pub fn write(&self, update: StatusUpdate) -> Result<StatusRecord, ExecutorError> {
        self.check_lease()?;
        self.store
            .update(&self.attempt.job_id, update.with_attempt(self.attempt.number))
            .map_err(|e| match e {
                StatusError::NotFound(job_id) => ExecutorError::JobDeleted(job_id),
                other => ExecutorError::Status(other),
            })
    }

    fn check_lease(&self) -> Result<(), ExecutorError> {
        let (Some(leases), Some(lease)) = (self.leases, self.attempt.lease.as_ref()) else {
            return Ok(());
        };
        if leases.is_held(lease)? {
            Ok(())
        } else {
            warn!(job_id = %self.attempt.job_id, attempt = self.attempt.number, "Lease lost, dropping status write");
            Err(ExecutorError::LeaseLost(self.attempt.job_id.clone()))
        }
    }
}
