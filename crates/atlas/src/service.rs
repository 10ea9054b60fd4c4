//! The operations the outer surface calls into: submission, status query,
//! artifact fetch, deletion, and workspace sweeping.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::broadcast::{JobProgressEvent, ProgressBroadcaster};
use crate::config::Settings;
use crate::dispatch::{DispatchHandle, Dispatcher, FileQueue};
use crate::error::{ServiceError, ValidationError};
use crate::options::JobOptions;
use crate::pipeline::PipelineExecutor;
use crate::stages::StageRegistry;
use crate::status::{JobStatus, StatusRecord, StatusStore, StatusUpdate};
use crate::storage::{ArtifactStore, Upload, WorkspaceManager, ARTIFACT_MEDIA_TYPE};
use crate::worker::{TimeLimits, WorkerContext, WorkerPool};

/// Returned by a successful submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub dispatch_handle: DispatchHandle,
    pub status: JobStatus,
}

/// A completed job's model file, ready to stream to a client.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactHandle {
    pub path: PathBuf,
    pub file_name: String,
    pub media_type: &'static str,
}

pub struct Service {
    settings: Settings,
    storage_root: PathBuf,
    workspaces: Arc<WorkspaceManager>,
    store: Arc<StatusStore>,
    artifacts: Arc<ArtifactStore>,
    queue: Arc<FileQueue>,
    registry: Arc<StageRegistry>,
    broadcaster: ProgressBroadcaster,
    doorbell: Receiver<()>,
}

impl Service {
    /// Opens (creating if needed) `<storage_root>/{workspaces,artifacts,status,queue}`.
    pub fn open(settings: Settings) -> crate::Result<Self> {
        let storage_root = settings.resolved_storage_root()?;
        let broadcaster = ProgressBroadcaster::default();
        let (ring, doorbell) = bounded(1);

        let workspaces = WorkspaceManager::new(storage_root.join("workspaces"), settings.limits)?;
        let artifacts = ArtifactStore::new(storage_root.join("artifacts"))?;
        let store = StatusStore::new(storage_root.join("status"))?.with_broadcaster(broadcaster.clone());
        let queue = FileQueue::open(storage_root.join("queue"), &settings.worker)?.with_doorbell(ring);
        let registry = StageRegistry::from_settings(&settings);

        info!(storage_root = %storage_root.display(), "Service opened");

        Ok(Self {
            settings,
            storage_root,
            workspaces: Arc::new(workspaces),
            store: Arc::new(store),
            artifacts: Arc::new(artifacts),
            queue: Arc::new(queue),
            registry: Arc::new(registry),
            broadcaster,
            doorbell,
        })
    }

    /// Replaces the stage topology built from settings.
    pub fn with_registry(mut self, registry: StageRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Validates options, stages `uploads` under a fresh job id, records the
    /// job as queued and enqueues it. Nothing is left behind on failure.
    pub fn submit<I>(&self, uploads: I, raw_options: &str) -> Result<SubmitReceipt, ServiceError>
    where
        I: IntoIterator<Item = Upload>,
    {
        let (options, document) = JobOptions::parse_document(raw_options)?;
        let job_id = Uuid::new_v4().to_string();
        let _span = info_span!("submit", job_id = %job_id).entered();

        let staged = self.workspaces.stage(&job_id, uploads)?;

        let update = StatusUpdate::queued(staged.images.len(), staged.total_bytes, document);
        let record = match self.store.write(&job_id, update) {
            Ok(record) => record,
            Err(e) => {
                self.discard(&job_id);
                return Err(e.into());
            }
        };

        let dispatch_handle = match self.queue.submit(&job_id, &options) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Enqueue failed, discarding job");
                self.discard(&job_id);
                return Err(e.into());
            }
        };

        info!(num_images = record.num_images, "Job submitted");
        Ok(SubmitReceipt {
            job_id,
            dispatch_handle,
            status: record.status,
        })
    }

    pub fn status(&self, job_id: &str) -> Result<StatusRecord, ServiceError> {
        validate_job_id(job_id)?;
        Ok(self.store.read(job_id)?)
    }

    /// Every readable status record, oldest first.
    pub fn list(&self) -> Result<Vec<StatusRecord>, ServiceError> {
        Ok(self.store.list()?)
    }

    /// The model of a completed job.
    pub fn artifact(&self, job_id: &str) -> Result<ArtifactHandle, ServiceError> {
        validate_job_id(job_id)?;
        let record = self.store.read(job_id)?;
        if record.status != JobStatus::Completed {
            return Err(ServiceError::Conflict {
                job_id: job_id.to_string(),
                status: record.status,
            });
        }

        let path = self.artifacts.path_for(job_id);
        if !path.is_file() {
            warn!(job_id, "Completed job has no artifact");
            return Err(ServiceError::ArtifactMissing(job_id.to_string()));
        }

        Ok(ArtifactHandle {
            path,
            file_name: ArtifactStore::download_name(job_id),
            media_type: ARTIFACT_MEDIA_TYPE,
        })
    }

    /// Removes workspace, artifact and status record. Succeeds when any or
    /// all of them are already gone. A running attempt is not stopped; its
    /// next status write finds the record missing and it gives up.
    pub fn delete(&self, job_id: &str) -> Result<(), ServiceError> {
        validate_job_id(job_id)?;
        let workspace = self.workspaces.destroy(job_id)?;
        let artifact = self.artifacts.remove(job_id)?;
        let status = self.store.delete(job_id)?;
        info!(job_id, workspace, artifact, status, "Job deleted");
        Ok(())
    }

    /// Removes workspaces of terminal jobs not updated within the
    /// configured TTL. Status records and artifacts stay.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<String>, ServiceError> {
        let Some(ttl_hours) = self.settings.workspace_ttl_hours else {
            return Ok(Vec::new());
        };
        let cutoff = i64::try_from(ttl_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .and_then(|ttl| now.checked_sub_signed(ttl));
        let Some(cutoff) = cutoff else {
            return Ok(Vec::new());
        };

        let mut swept = Vec::new();
        for record in self.store.list()? {
            if !record.status.is_terminal() || record.updated_at >= cutoff {
                continue;
            }
            if self.workspaces.destroy(&record.job_id)? {
                swept.push(record.job_id);
            }
        }

        if !swept.is_empty() {
            info!(count = swept.len(), "Swept expired workspaces");
        }
        Ok(swept)
    }

    /// An executor over this service's stores, fenced by the queue's leases.
    pub fn executor(&self) -> PipelineExecutor {
        PipelineExecutor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.workspaces),
            Arc::clone(&self.store),
            Arc::clone(&self.artifacts),
        )
        .with_leases(self.queue.leases().clone())
    }

    /// Starts background workers; `None` uses `worker.count`.
    pub fn start_workers(&self, count: Option<usize>) -> Result<WorkerPool, ServiceError> {
        let ctx = WorkerContext {
            executor: Arc::new(self.executor()),
            queue: Arc::clone(&self.queue),
            store: Arc::clone(&self.store),
            artifacts: Arc::clone(&self.artifacts),
            limits: TimeLimits::from_settings(&self.settings.worker),
            poll_interval: self.settings.worker.poll_interval(),
        };
        let count = count.unwrap_or(self.settings.worker.count);
        Ok(WorkerPool::start(
            Arc::new(ctx),
            count,
            self.doorbell.clone(),
        )?)
    }

    /// Every status record committed from now on, in commit order.
    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.broadcaster.subscribe()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn queue(&self) -> &FileQueue {
        &self.queue
    }

    /// Best-effort removal of a half-submitted job.
    fn discard(&self, job_id: &str) {
        if let Err(e) = self.workspaces.destroy(job_id) {
            warn!(job_id, error = %e, "Failed to remove workspace of discarded job");
        }
        if let Err(e) = self.store.delete(job_id) {
            warn!(job_id, error = %e, "Failed to remove status of discarded job");
        }
    }
}

/// Job ids are hyphenated lowercase UUIDs.
pub fn validate_job_id(job_id: &str) -> Result<(), ValidationError> {
    match Uuid::try_parse(job_id) {
        Ok(uuid) if uuid.hyphenated().to_string() == job_id => Ok(()),
        _ => Err(ValidationError::InvalidJobId(job_id.to_string())),
    }
}
