use thiserror::Error;

use crate::error::{DispatchError, StatusError, StorageError};
use crate::stages::{CancelReason, StageError};
use crate::status::{JobStatus, StatusRecord};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("Status store failed: {0}")]
    Status(#[from] StatusError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Lease check failed: {0}")]
    Lease(#[from] DispatchError),

    #[error("Job {0} was deleted while running")]
    JobDeleted(String),

    #[error("Workspace for job {0} no longer exists")]
    WorkspaceGone(String),

    #[error("Lease for job {0} is no longer held by this attempt")]
    LeaseLost(String),

    #[error("Attempt interrupted: {0}")]
    Interrupted(CancelReason),
}

impl ExecutorError {
    /// Operator-facing detail beyond the error chain.
    pub fn diagnostic(&self) -> Option<String> {
        match self {
            ExecutorError::Stage { source, .. } => source.diagnostic(),
            _ => None,
        }
    }

    /// Errors after which this attempt must stop touching the job without
    /// recording anything.
    pub fn is_abandonment(&self) -> bool {
        matches!(
            self,
            ExecutorError::JobDeleted(_)
                | ExecutorError::LeaseLost(_)
                | ExecutorError::Interrupted(_)
        )
    }
}

/// How one execution attempt ended.
#[derive(Debug)]
pub enum AttemptOutcome {
    Completed(StatusRecord),
    /// The failure was recorded in the status store.
    Failed {
        record: StatusRecord,
        error: ExecutorError,
    },
    /// The job was already terminal (or gone); nothing ran.
    Skipped(Option<JobStatus>),
    /// The attempt stopped without a status write of its own.
    Abandoned(ExecutorError),
}

impl AttemptOutcome {
    /// Whether the delivery that started this attempt is finished with.
    pub fn is_settled(&self) -> bool {
        !matches!(self, AttemptOutcome::Abandoned(ExecutorError::Interrupted(_)))
    }
}
