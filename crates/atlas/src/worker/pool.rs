use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::dispatch::{Delivery, Envelope, FileQueue};
use crate::error::{StatusError, WorkerError};
use crate::pipeline::{Attempt, AttemptOutcome, PipelineExecutor};
use crate::stages::{CancelReason, CancelToken};
use crate::status::{StatusStore, StatusUpdate};
use crate::storage::ArtifactStore;
use crate::worker::limits::{run_with_limits, LimitedRun, TimeLimits};

/// Error recorded for jobs whose deliveries ran out.
pub const ATTEMPTS_EXHAUSTED: &str = "maximum delivery attempts exceeded";

/// Everything a worker thread needs, shared by all workers of a pool.
pub struct WorkerContext {
    pub executor: Arc<PipelineExecutor>,
    pub queue: Arc<FileQueue>,
    pub store: Arc<StatusStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub limits: TimeLimits,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Completed,
    Failed,
    Skipped,
    Abandoned,
    TimedOut,
    DeadLettered,
    /// The outcome could not be recorded; the delivery stays in flight.
    Errored,
}

/// What happened to one delivery.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptReport {
    pub worker_id: usize,
    pub job_id: String,
    pub attempt: u32,
    pub outcome: ReportOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Cancellation tokens of running attempts, by worker.
type ActiveAttempts = Arc<Mutex<HashMap<usize, CancelToken>>>;

/// Stops a pool from another thread, e.g. a signal handler.
#[derive(Clone)]
pub struct PoolControl {
    shutdown: Arc<AtomicBool>,
    aborting: Arc<AtomicBool>,
    active: ActiveAttempts,
}

impl PoolControl {
    /// Stops claiming new work; running attempts finish normally.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Stops claiming and cancels running attempts. Their deliveries stay
    /// in flight and are redelivered once the reaper finds them.
    pub fn abort(&self) {
        self.shutdown();
        self.aborting.store(true, Ordering::Relaxed);
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        for (worker_id, cancel) in active.iter() {
            debug!("Cancelling attempt on worker {}", worker_id);
            cancel.cancel(CancelReason::Shutdown);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

pub struct WorkerPool {
    report_receiver: Receiver<AttemptReport>,
    workers: Vec<JoinHandle<()>>,
    control: PoolControl,
}

impl WorkerPool {
    /// Starts `worker_count` workers pulling from `ctx.queue`. A message on
    /// `doorbell` wakes one idle worker before its poll interval elapses.
    pub fn start(
        ctx: Arc<WorkerContext>,
        worker_count: usize,
        doorbell: Receiver<()>,
    ) -> Result<Self, WorkerError> {
        let worker_count = worker_count.max(1);
        let (report_sender, report_receiver) = bounded::<AttemptReport>(worker_count * 16);
        let shutdown = Arc::new(AtomicBool::new(false));
        let aborting = Arc::new(AtomicBool::new(false));
        let active: ActiveAttempts = Arc::new(Mutex::new(HashMap::new()));

        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let worker = Worker {
                id: worker_id,
                holder: format!("pid{}-worker{}", std::process::id(), worker_id),
                ctx: Arc::clone(&ctx),
                doorbell: doorbell.clone(),
                reports: report_sender.clone(),
                shutdown: Arc::clone(&shutdown),
                aborting: Arc::clone(&aborting),
                active: Arc::clone(&active),
            };

            let handle = thread::Builder::new()
                .name(format!("atlas-worker-{}", worker_id))
                .spawn(move || worker.run());

            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::Relaxed);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(WorkerError::SpawnFailed(e.to_string()));
                }
            }
        }

        info!("Started {} workers", worker_count);

        Ok(Self {
            report_receiver,
            workers,
            control: PoolControl {
                shutdown,
                aborting,
                active,
            },
        })
    }

    pub fn try_recv_report(&self) -> Option<AttemptReport> {
        self.report_receiver.try_recv().ok()
    }

    pub fn recv_report_timeout(&self, timeout: Duration) -> Option<AttemptReport> {
        self.report_receiver.recv_timeout(timeout).ok()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn control(&self) -> PoolControl {
        self.control.clone()
    }

    pub fn shutdown(&self) {
        self.control.shutdown();
    }

    pub fn abort(&self) {
        self.control.abort();
    }

    /// True once every worker thread has exited.
    pub fn has_stopped(&self) -> bool {
        self.workers.iter().all(|w| w.is_finished())
    }

    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.control.is_shutdown()
    }
}

struct Worker {
    id: usize,
    /// Lease holder name.
    holder: String,
    ctx: Arc<WorkerContext>,
    doorbell: Receiver<()>,
    reports: Sender<AttemptReport>,
    shutdown: Arc<AtomicBool>,
    aborting: Arc<AtomicBool>,
    active: ActiveAttempts,
}

impl Worker {
    fn run(self) {
        debug!("Worker {} started", self.id);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                debug!("Worker {} received shutdown signal", self.id);
                break;
            }

            self.reap();

            match self.ctx.queue.claim(&self.holder) {
                Ok(Some(delivery)) => {
                    self.process(delivery);
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!("Worker {} failed to claim from queue: {}", self.id, e),
            }

            match self.doorbell.recv_timeout(self.ctx.poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(self.ctx.poll_interval),
            }
        }

        debug!("Worker {} stopped", self.id);
    }

    fn reap(&self) {
        match self.ctx.queue.reap_expired(Utc::now()) {
            Ok(report) => {
                for envelope in report.dead_lettered {
                    self.fail_dead_lettered(&envelope);
                }
            }
            Err(e) => error!("Worker {} failed to reap expired deliveries: {}", self.id, e),
        }
    }

    fn fail_dead_lettered(&self, envelope: &Envelope) {
        let job_id = &envelope.job_id;
        match self.ctx.store.try_read(job_id) {
            Ok(Some(record)) if !record.status.is_terminal() => {
                let update = StatusUpdate::failed(record.progress, ATTEMPTS_EXHAUSTED, None)
                    .with_attempt(envelope.attempt);
                if let Err(e) = self.ctx.store.update(job_id, update) {
                    error!("Failed to record dead-lettered job {}: {}", job_id, e);
                }
                self.remove_artifact(job_id);
            }
            Ok(_) => {}
            Err(e) => error!("Failed to read status of dead-lettered job {}: {}", job_id, e),
        }

        self.report(
            job_id,
            envelope.attempt,
            ReportOutcome::DeadLettered,
            Some(ATTEMPTS_EXHAUSTED.to_string()),
        );
    }

    fn process(&self, delivery: Delivery) {
        let job_id = delivery.job_id().to_string();
        let number = delivery.attempt();
        debug!("Worker {} processing job {} (attempt {})", self.id, job_id, number);

        let cancel = CancelToken::new();
        let attempt = Attempt::from_delivery(&delivery).with_cancel(cancel.clone());
        self.set_active(Some(cancel.clone()));

        let executor = Arc::clone(&self.ctx.executor);
        let run = run_with_limits(&job_id, self.ctx.limits, &cancel, move || {
            executor.execute(&attempt)
        });
        self.set_active(None);

        let (outcome, message, settled) = match run {
            Ok(LimitedRun::Finished(Ok(outcome))) => {
                let settled = outcome.is_settled();
                let (kind, message) = describe(&outcome);
                (kind, message, settled)
            }
            Ok(LimitedRun::Finished(Err(e))) => {
                error!(
                    "Job {} outcome could not be recorded, leaving delivery in flight: {}",
                    job_id, e
                );
                (ReportOutcome::Errored, Some(e.to_string()), false)
            }
            Ok(LimitedRun::HardTimeout) => {
                let cause = format!(
                    "Job exceeded the hard time limit of {}s",
                    self.ctx.limits.hard.as_secs()
                );
                self.fail_abandoned_attempt(&job_id, number, &cause);
                (ReportOutcome::TimedOut, Some(cause), true)
            }
            Err(e) => {
                error!("Worker {}: {}", self.id, e);
                let cause = e.to_string();
                self.fail_abandoned_attempt(&job_id, number, &cause);
                (ReportOutcome::Failed, Some(cause), true)
            }
        };

        if settled {
            if let Err(e) = self.ctx.queue.ack(&delivery) {
                error!("Failed to ack job {}: {}", job_id, e);
            }
        }

        self.report(&job_id, number, outcome, message);
    }

    /// Fences the lost attempt and records `cause` unless the job already
    /// reached a terminal state.
    fn fail_abandoned_attempt(&self, job_id: &str, attempt: u32, cause: &str) {
        if let Err(e) = self.ctx.queue.leases().revoke(job_id) {
            error!("Failed to revoke lease of job {}: {}", job_id, e);
        }

        match self.ctx.store.try_read(job_id) {
            Ok(Some(record)) if !record.status.is_terminal() => {
                let update = StatusUpdate::failed(record.progress, cause, None).with_attempt(attempt);
                match self.ctx.store.update(job_id, update) {
                    Ok(_) | Err(StatusError::NotFound(_)) => {}
                    Err(e) => error!("Failed to record failure of job {}: {}", job_id, e),
                }
                self.remove_artifact(job_id);
            }
            Ok(_) => {}
            Err(e) => error!("Failed to read status of job {}: {}", job_id, e),
        }
    }

    fn remove_artifact(&self, job_id: &str) {
        if let Err(e) = self.ctx.artifacts.remove(job_id) {
            warn!("Failed to remove artifact of job {}: {}", job_id, e);
        }
    }

    fn set_active(&self, cancel: Option<CancelToken>) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match cancel {
            Some(cancel) => {
                // An abort may have raced the claim.
                if self.aborting.load(Ordering::Relaxed) {
                    cancel.cancel(CancelReason::Shutdown);
                }
                active.insert(self.id, cancel);
            }
            None => {
                active.remove(&self.id);
            }
        }
    }

    fn report(&self, job_id: &str, attempt: u32, outcome: ReportOutcome, message: Option<String>) {
        let report = AttemptReport {
            worker_id: self.id,
            job_id: job_id.to_string(),
            attempt,
            outcome,
            message,
        };
        if self.reports.try_send(report).is_err() {
            debug!("Worker {} dropped report for job {}", self.id, job_id);
        }
    }
}

fn describe(outcome: &AttemptOutcome) -> (ReportOutcome, Option<String>) {
    match outcome {
        AttemptOutcome::Completed(_) => (ReportOutcome::Completed, None),
        AttemptOutcome::Failed { record, .. } => (ReportOutcome::Failed, record.error.clone()),
        AttemptOutcome::Skipped(status) => (
            ReportOutcome::Skipped,
            status.map(|s| format!("job already {}", s)),
        ),
        AttemptOutcome::Abandoned(reason) => (ReportOutcome::Abandoned, Some(reason.to_string())),
    }
}
