//! Durable file queue: `pending/` → `inflight/` → acked (removed) or `dead/`.
//!
//! Every transition is a rename within the queue root, so a message is in
//! exactly one directory at any time and survives process restarts.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::config::WorkerSettings;
use crate::dispatch::envelope::{job_id_from_file_name, DispatchHandle, Envelope};
use crate::dispatch::lease::{JobLease, LeaseManager};
use crate::error::DispatchError;
use crate::options::JobOptions;
use crate::storage::{ensure_directory, is_temp_file, remove_file_if_exists, write_atomic};

/// Hands a job to the background execution context without waiting for it.
pub trait Dispatcher: Send + Sync {
    fn submit(&self, job_id: &str, options: &JobOptions) -> Result<DispatchHandle, DispatchError>;
}

/// A claimed message together with the lease that authorizes running it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub lease: JobLease,
    inflight_path: PathBuf,
}

impl Delivery {
    pub fn job_id(&self) -> &str {
        &self.envelope.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.envelope.attempt
    }
}

/// Outcome of one reaper pass.
#[derive(Debug, Default, Clone)]
pub struct ReapReport {
    /// Job ids returned to `pending/` for another attempt.
    pub redelivered: Vec<String>,
    /// Messages that exhausted their attempts.
    pub dead_lettered: Vec<Envelope>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.redelivered.is_empty() && self.dead_lettered.is_empty()
    }
}

pub struct FileQueue {
    pending: PathBuf,
    inflight: PathBuf,
    dead: PathBuf,
    leases: LeaseManager,
    max_attempts: u32,
    grace: chrono::Duration,
    doorbell: Option<Sender<()>>,
}

impl FileQueue {
    /// Opens (creating if needed) the queue under `root`.
    pub fn open<P: AsRef<Path>>(root: P, worker: &WorkerSettings) -> Result<Self, DispatchError> {
        let root = root.as_ref();
        let pending = root.join("pending");
        let inflight = root.join("inflight");
        let dead = root.join("dead");
        for dir in [&pending, &inflight, &dead] {
            ensure_directory(dir)?;
        }
        let leases = LeaseManager::new(root.join("leases"), worker.lease_ttl())?;

        Ok(Self {
            pending,
            inflight,
            dead,
            leases,
            max_attempts: worker.max_attempts.max(1),
            grace: chrono::Duration::from_std(worker.lease_grace())
                .unwrap_or(chrono::Duration::MAX),
            doorbell: None,
        })
    }

    /// Signals `doorbell` after every enqueue so idle workers wake early.
    pub fn with_doorbell(mut self, doorbell: Sender<()>) -> Self {
        self.doorbell = Some(doorbell);
        self
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn enqueue(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        let path = self.pending.join(envelope.file_name());
        write_atomic(&path, &serde_json::to_vec_pretty(envelope)?)?;
        if let Some(doorbell) = &self.doorbell {
            let _ = doorbell.try_send(());
        }
        Ok(())
    }

    /// Claims the oldest pending message whose job is not leased elsewhere.
    pub fn claim(&self, worker_id: &str) -> Result<Option<Delivery>, DispatchError> {
        for name in list_messages(&self.pending)? {
            let Some(job_id) = job_id_from_file_name(&name).map(str::to_string) else {
                continue;
            };
            let pending_path = self.pending.join(&name);
            let inflight_path = self.inflight.join(&name);

            // The rename is the claim.
            match std::fs::rename(&pending_path, &inflight_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(DispatchError::Io {
                        path: pending_path,
                        source: e,
                    })
                }
            }
            // The reaper's grace period counts from the claim, not from
            // when the message was enqueued.
            touch(&inflight_path)?;

            let envelope = match read_envelope(&inflight_path) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Unreadable queue message, dead-lettering");
                    self.move_to(&inflight_path, &self.dead.join(&name))?;
                    continue;
                }
            };

            match self.leases.acquire(&job_id, worker_id, envelope.attempt)? {
                Some(lease) => {
                    debug!(job_id = %job_id, attempt = envelope.attempt, worker_id, "Claimed job");
                    return Ok(Some(Delivery {
                        envelope,
                        lease,
                        inflight_path,
                    }));
                }
                None => {
                    debug!(job_id = %job_id, "Job leased elsewhere, leaving message pending");
                    self.move_to(&inflight_path, &pending_path)?;
                }
            }
        }
        Ok(None)
    }

    /// Completes a delivery: the message is dropped and the lease released.
    pub fn ack(&self, delivery: &Delivery) -> Result<(), DispatchError> {
        remove_file_if_exists(&delivery.inflight_path)?;
        self.leases.release(&delivery.lease)?;
        debug!(job_id = %delivery.job_id(), "Acked job");
        Ok(())
    }

    /// Returns in-flight messages whose lease expired (or never appeared
    /// within the grace period) to `pending/` with the next attempt number.
    /// Messages out of attempts move to `dead/`.
    pub fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapReport, DispatchError> {
        let mut report = ReapReport::default();

        for name in list_messages(&self.inflight)? {
            let Some(job_id) = job_id_from_file_name(&name).map(str::to_string) else {
                continue;
            };
            let inflight_path = self.inflight.join(&name);

            let abandoned = match self.leases.read(&job_id)? {
                Some(lease) => lease.is_expired(now),
                None => message_age(&inflight_path, now)
                    .map(|age| age > self.grace)
                    .unwrap_or(false),
            };
            if !abandoned {
                continue;
            }

            // Take the message out of `inflight/` first so only one reaper
            // acts on it.
            let reaping_path = self.inflight.join(format!(".reaping-{}", name));
            match std::fs::rename(&inflight_path, &reaping_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(DispatchError::Io {
                        path: inflight_path,
                        source: e,
                    })
                }
            }
            self.leases.revoke(&job_id)?;

            let mut envelope = match read_envelope(&reaping_path) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Unreadable in-flight message, dead-lettering");
                    self.move_to(&reaping_path, &self.dead.join(&name))?;
                    continue;
                }
            };

            if envelope.attempt >= self.max_attempts {
                warn!(
                    job_id = %job_id,
                    attempts = envelope.attempt,
                    "Job exhausted delivery attempts"
                );
                self.move_to(&reaping_path, &self.dead.join(&name))?;
                report.dead_lettered.push(envelope);
            } else {
                envelope.attempt += 1;
                write_atomic(&self.pending.join(&name), &serde_json::to_vec_pretty(&envelope)?)?;
                remove_file_if_exists(&reaping_path)?;
                info!(job_id = %job_id, attempt = envelope.attempt, "Redelivering job");
                report.redelivered.push(job_id);
            }
        }

        if !report.redelivered.is_empty() {
            if let Some(doorbell) = &self.doorbell {
                let _ = doorbell.try_send(());
            }
        }
        Ok(report)
    }

    pub fn pending_count(&self) -> Result<usize, DispatchError> {
        Ok(list_messages(&self.pending)?.len())
    }

    pub fn inflight_count(&self) -> Result<usize, DispatchError> {
        Ok(list_messages(&self.inflight)?.len())
    }

    pub fn dead_count(&self) -> Result<usize, DispatchError> {
        Ok(list_messages(&self.dead)?.len())
    }

    fn move_to(&self, from: &Path, to: &Path) -> Result<(), DispatchError> {
        std::fs::rename(from, to).map_err(|e| DispatchError::Io {
            path: from.to_path_buf(),
            source: e,
        })
    }
}

impl Dispatcher for FileQueue {
    fn submit(&self, job_id: &str, options: &JobOptions) -> Result<DispatchHandle, DispatchError> {
        let envelope = Envelope::new(job_id, options.clone());
        self.enqueue(&envelope)?;
        info!(job_id, dispatch_id = %envelope.dispatch_id, "Job enqueued");
        Ok(envelope.handle())
    }
}

/// Visible message file names in `dir`, oldest first.
fn list_messages(dir: &Path) -> Result<Vec<String>, DispatchError> {
    let entries = std::fs::read_dir(dir).map_err(|e| DispatchError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| !is_temp_file(p))
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .filter(|n| n.ends_with(".json"))
        .collect();
    names.sort();
    Ok(names)
}

fn read_envelope(path: &Path) -> Result<Envelope, DispatchError> {
    let bytes = std::fs::read(path).map_err(|e| DispatchError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn touch(path: &Path) -> Result<(), DispatchError> {
    std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()))
        .map_err(|e| DispatchError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

fn message_age(path: &Path, now: DateTime<Utc>) -> Option<chrono::Duration> {
    let modified: SystemTime = std::fs::metadata(path).ok()?.modified().ok()?;
    let modified: DateTime<Utc> = modified.into();
    Some(now - modified)
}
