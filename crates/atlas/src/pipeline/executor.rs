use std::error::Error as _;
use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn};

use crate::dispatch::LeaseManager;
use crate::error::StorageError;
use crate::metrics;
use crate::sanitize;
use crate::stages::{CancelReason, StageContext, StageRegistry};
use crate::status::{JobStatus, StatusStore, StatusUpdate};
use crate::storage::{ArtifactStore, StageDir, WorkspaceManager, ARTIFACT_FILE_NAME};

use super::context::Attempt;
use super::error::{AttemptOutcome, ExecutorError};
use super::progress::ProgressWriter;

/// Runs a job's stages in order and records every transition.
///
/// Safe to re-enter for the same job: terminal jobs short-circuit, stage
/// outputs land on deterministic paths, and progress writes never move a
/// processing job backwards.
pub struct PipelineExecutor {
    registry: Arc<StageRegistry>,
    workspaces: Arc<WorkspaceManager>,
    store: Arc<StatusStore>,
    artifacts: Arc<ArtifactStore>,
    leases: Option<LeaseManager>,
}

impl PipelineExecutor {
    pub fn new(
        registry: Arc<StageRegistry>,
        workspaces: Arc<WorkspaceManager>,
        store: Arc<StatusStore>,
        artifacts: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            registry,
            workspaces,
            store,
            artifacts,
            leases: None,
        }
    }

    /// Fences status writes of leased attempts against `leases`.
    pub fn with_leases(mut self, leases: LeaseManager) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Executes one attempt.
    ///
    /// Stage failures are recorded and returned as
    /// [`AttemptOutcome::Failed`]. `Err` means the outcome could not be
    /// recorded at all.
    pub fn execute(&self, attempt: &Attempt) -> Result<AttemptOutcome, ExecutorError> {
        let _pipeline_span = info_span!("pipeline",
            job_id = %attempt.job_id,
            attempt = attempt.number,
        )
        .entered();

        match self.store.try_read(&attempt.job_id)? {
            None => {
                info!("Job no longer exists, skipping");
                return Ok(AttemptOutcome::Skipped(None));
            }
            Some(record) if record.status.is_terminal() => {
                info!(status = %record.status, "Job already terminal, skipping");
                return Ok(AttemptOutcome::Skipped(Some(record.status)));
            }
            Some(_) => {}
        }

        let progress = ProgressWriter::new(&self.store, self.leases.as_ref(), attempt);

        let layout = match self.workspaces.prepare(&attempt.job_id) {
            Ok(layout) => layout,
            Err(StorageError::WorkspaceMissing(_)) => {
                return self.fail(
                    &progress,
                    0,
                    ExecutorError::WorkspaceGone(attempt.job_id.clone()),
                )
            }
            Err(e) => return self.fail(&progress, 0, e.into()),
        };

        for (index, stage) in self.registry.stages().iter().enumerate() {
            let floor = self.registry.floor(index);
            let _stage_span = info_span!("stage", stage = stage.name, floor).entered();

            if let Err(e) = progress.write(StatusUpdate::processing(
                floor,
                format!("Running {}", stage.label),
            )) {
                return self.fail(&progress, floor, e);
            }

            let ctx = StageContext {
                job_id: attempt.job_id.clone(),
                stage: stage.name,
                cancel: attempt.cancel.clone(),
            };
            let result = stage.adapter_for(&attempt.options).run(
                &stage.inputs_in(&layout),
                &layout.dir(stage.output),
                &attempt.options,
                &ctx,
            );

            match result {
                Ok(outcome) => debug!(produced = outcome.produced.len(), "Stage finished"),
                Err(source) => {
                    let error = match attempt.cancel.reason() {
                        Some(CancelReason::Shutdown) if source.is_cancelled() => {
                            ExecutorError::Interrupted(CancelReason::Shutdown)
                        }
                        _ => ExecutorError::Stage {
                            stage: stage.name.to_string(),
                            source,
                        },
                    };
                    return self.fail(&progress, floor, error);
                }
            }
        }

        let last_floor = self.registry.floor(self.registry.len().saturating_sub(1));
        let produced = layout.dir(StageDir::Output).join(ARTIFACT_FILE_NAME);
        let artifact = match self.artifacts.publish(&attempt.job_id, &produced) {
            Ok(path) => path,
            Err(e) => return self.fail(&progress, last_floor, e.into()),
        };

        let metrics = {
            let _step = info_span!("qa_metrics").entered();
            let workspace_bytes = self
                .workspaces
                .exists(&attempt.job_id)
                .then(|| self.workspaces.disk_usage(&attempt.job_id));
            metrics::compute(&artifact, workspace_bytes)
        };

        match progress.write(StatusUpdate::completed(metrics)) {
            Ok(record) => {
                info!("Job completed");
                Ok(AttemptOutcome::Completed(record))
            }
            Err(e) => {
                self.withdraw_artifact(&attempt.job_id);
                self.fail(&progress, last_floor, e)
            }
        }
    }

    /// Records `error` as the job's terminal failure, then removes any stale
    /// artifact. A fenced attempt never gets as far as the removal.
    fn fail(
        &self,
        progress: &ProgressWriter<'_>,
        floor: u8,
        error: ExecutorError,
    ) -> Result<AttemptOutcome, ExecutorError> {
        if error.is_abandonment() {
            info!(reason = %error, "Attempt abandoned");
            return Ok(AttemptOutcome::Abandoned(error));
        }

        let cause = self.client_text(&error.to_string());
        let trace = self.client_text(&trace_of(&error));
        error!(error = %error, "Job failed");

        match progress.write(StatusUpdate::failed(floor, cause, Some(trace))) {
            Ok(record) => {
                if let Err(e) = self.artifacts.remove(progress.job_id()) {
                    warn!(error = %e, "Failed to remove stale artifact");
                }
                Ok(AttemptOutcome::Failed { record, error })
            }
            Err(e) if e.is_abandonment() => Ok(AttemptOutcome::Abandoned(e)),
            Err(e) => {
                error!(
                    error = %e,
                    original_error = %error,
                    "Could not record job failure; status is stale"
                );
                Err(e)
            }
        }
    }

    /// Removes an artifact published by an attempt that could not record
    /// completion, unless another attempt already completed the job.
    fn withdraw_artifact(&self, job_id: &str) {
        let completed = matches!(
            self.store.try_read(job_id),
            Ok(Some(record)) if record.status == JobStatus::Completed
        );
        if completed {
            return;
        }
        if let Err(e) = self.artifacts.remove(job_id) {
            warn!(error = %e, "Failed to withdraw artifact");
        }
    }

    /// Strips storage locations from text that ends up in status records.
    fn client_text(&self, text: &str) -> String {
        let text = sanitize::strip_root(text, self.workspaces.root());
        sanitize::strip_root(&text, self.artifacts.dir())
    }
}

/// The error chain, one cause per line, followed by any tool diagnostic.
fn trace_of(error: &ExecutorError) -> String {
    let mut lines = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    if let Some(diagnostic) = error.diagnostic() {
        lines.push(String::new());
        lines.push(diagnostic);
    }
    lines.join("\n")
}
