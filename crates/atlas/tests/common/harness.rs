//! Test harness for isolated service instances.
//!
//! Each `TestHarness` owns a temporary storage root and a `Service` opened
//! over it with small upload limits, short worker timings and the fake
//! stage topology from `adapters`.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use atlas::config::{Settings, UploadLimits, WorkerSettings};
use atlas::stages::StageRegistry;
use atlas::{AttemptReport, JobStatus, Service, StatusRecord, Upload, WorkerPool};

use super::adapters::{fake_registry, CallLog};

pub struct TestHarness {
    temp_dir: TempDir,
    pub service: Service,
    pub log: CallLog,
}

impl TestHarness {
    /// A harness running the fake five-stage topology.
    pub fn new() -> Self {
        let log = CallLog::default();
        let registry = fake_registry(&log);
        Self::build(Self::default_settings, registry, log)
    }

    /// A harness running `registry`; `log` is whatever its adapters record into.
    pub fn with_registry(registry: StageRegistry, log: CallLog) -> Self {
        Self::build(Self::default_settings, registry, log)
    }

    /// Like [`with_registry`](Self::with_registry) with settings adjusted by `tweak`.
    pub fn with_settings<F>(tweak: F, registry: StageRegistry, log: CallLog) -> Self
    where
        F: FnOnce(&mut Settings),
    {
        Self::build(
            |root| {
                let mut settings = Self::default_settings(root);
                tweak(&mut settings);
                settings
            },
            registry,
            log,
        )
    }

    /// Replaces the stage topology, keeping storage and submitted jobs.
    pub fn rewire(self, registry: StageRegistry, log: CallLog) -> Self {
        Self {
            temp_dir: self.temp_dir,
            service: self.service.with_registry(registry),
            log,
        }
    }

    fn build<F>(make_settings: F, registry: StageRegistry, log: CallLog) -> Self
    where
        F: FnOnce(&Path) -> Settings,
    {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let settings = make_settings(&temp_dir.path().join("storage"));
        let service = Service::open(settings)
            .expect("Failed to open service")
            .with_registry(registry);
        Self {
            temp_dir,
            service,
            log,
        }
    }

    fn default_settings(root: &Path) -> Settings {
        Settings {
            storage_root: Some(root.to_path_buf()),
            limits: UploadLimits {
                min_images: 3,
                max_images: 10,
                max_upload_mb: 1,
            },
            worker: WorkerSettings {
                count: 1,
                hard_time_limit_secs: 30,
                soft_time_limit_secs: 20,
                max_attempts: 2,
                lease_grace_secs: 1,
                poll_interval_ms: 20,
            },
            ..Settings::default()
        }
    }

    pub fn storage_root(&self) -> &Path {
        self.service.storage_root()
    }

    pub fn status_dir(&self) -> PathBuf {
        self.storage_root().join("status")
    }

    /// Submits `uploads` with `options` and returns the new job id.
    pub fn submit(&self, uploads: Vec<Upload>, options: &str) -> String {
        self.service
            .submit(uploads, options)
            .expect("Submission failed")
            .job_id
    }

    pub fn status(&self, job_id: &str) -> StatusRecord {
        self.service.status(job_id).expect("Failed to read status")
    }

    /// Number of job workspaces currently on disk.
    pub fn workspace_count(&self) -> usize {
        std::fs::read_dir(self.service.workspaces().root())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    /// Polls until the job reaches `status` or `timeout` elapses.
    pub fn wait_for_status(&self, job_id: &str, status: JobStatus, timeout: Duration) -> StatusRecord {
        let deadline = Instant::now() + timeout;
        loop {
            let record = self.status(job_id);
            if record.status == status {
                return record;
            }
            assert!(
                Instant::now() < deadline,
                "job {} stuck in {} waiting for {}",
                job_id,
                record.status,
                status
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Waits for the pool's report on `job_id`, skipping reports for other jobs.
pub fn wait_for_report(pool: &WorkerPool, job_id: &str, timeout: Duration) -> AttemptReport {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(report) = pool.recv_report_timeout(Duration::from_millis(50)) {
            if report.job_id == job_id {
                return report;
            }
        }
    }
    panic!("no report for job {} within {:?}", job_id, timeout);
}
