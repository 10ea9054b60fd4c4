//! Per-job execution leases.
//!
//! A lease file `<dir>/<job_id>.json` marks the single attempt allowed to
//! run a job. It is published with create-if-absent semantics (hard link of
//! a fully written temp file), expires after the hard time limit plus a
//! grace period, and fences status writes: an attempt whose token is no
//! longer on disk must stop writing.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::storage::{ensure_directory, remove_file_if_exists, write_atomic};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseRecord {
    pub job_id: String,
    /// Worker that holds the lease.
    pub holder: String,
    pub token: String,
    pub attempt: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A lease held by the current process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLease {
    record: LeaseRecord,
}

impl JobLease {
    pub fn job_id(&self) -> &str {
        &self.record.job_id
    }

    pub fn token(&self) -> &str {
        &self.record.token
    }

    pub fn attempt(&self) -> u32 {
        self.record.attempt
    }

    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }
}

#[derive(Debug, Clone)]
pub struct LeaseManager {
    dir: PathBuf,
    ttl: chrono::Duration,
}

impl LeaseManager {
    pub fn new<P: AsRef<Path>>(dir: P, ttl: Duration) -> Result<Self, DispatchError> {
        let dir = dir.as_ref().to_path_buf();
        ensure_directory(&dir)?;
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Ok(Self { dir, ttl })
    }

    pub fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    /// Takes the lease for `job_id`, or returns `None` while another live
    /// lease exists. Expired leases are broken first.
    pub fn acquire(
        &self,
        job_id: &str,
        holder: &str,
        attempt: u32,
    ) -> Result<Option<JobLease>, DispatchError> {
        let now = Utc::now();
        let record = LeaseRecord {
            job_id: job_id.to_string(),
            holder: holder.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            attempt,
            acquired_at: now,
            expires_at: now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        // One retry after breaking an expired lease.
        for _ in 0..2 {
            if self.try_publish(&record)? {
                debug!(job_id, holder, attempt, "Lease acquired");
                return Ok(Some(JobLease { record }));
            }

            match self.read(job_id)? {
                Some(existing) if !existing.is_expired(Utc::now()) => return Ok(None),
                Some(expired) => {
                    if !self.break_expired(&expired)? {
                        return Ok(None);
                    }
                }
                // Released between our attempt and the read.
                None => {}
            }
        }
        Ok(None)
    }

    /// Creates the lease file only if none exists.
    fn try_publish(&self, record: &LeaseRecord) -> Result<bool, DispatchError> {
        let path = self.path_for(&record.job_id);
        let staging = self
            .dir
            .join(format!(".{}.{}.lease", record.job_id, record.token));
        write_atomic(&staging, &serde_json::to_vec_pretty(record)?)?;

        let result = std::fs::hard_link(&staging, &path);
        let _ = std::fs::remove_file(&staging);
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(DispatchError::Io { path, source: e }),
        }
    }

    /// Moves an expired lease aside. Only one breaker can win the rename;
    /// if the file moved aside turns out to be a fresh lease, it is put back.
    fn break_expired(&self, expired: &LeaseRecord) -> Result<bool, DispatchError> {
        let path = self.path_for(&expired.job_id);
        let aside = self.dir.join(format!(
            ".{}.{}.broken",
            expired.job_id,
            uuid::Uuid::new_v4().simple()
        ));

        match std::fs::rename(&path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(DispatchError::Io { path, source: e }),
        }

        let moved = read_record(&aside)?;
        if moved.as_ref().map(|r| r.token.as_str()) != Some(expired.token.as_str()) {
            // Someone else broke and re-acquired in between; restore theirs.
            let _ = std::fs::hard_link(&aside, &path);
            let _ = std::fs::remove_file(&aside);
            return Ok(false);
        }

        let _ = std::fs::remove_file(&aside);
        warn!(
            job_id = %expired.job_id,
            holder = %expired.holder,
            attempt = expired.attempt,
            "Broke expired lease"
        );
        Ok(true)
    }

    pub fn read(&self, job_id: &str) -> Result<Option<LeaseRecord>, DispatchError> {
        read_record(&self.path_for(job_id))
    }

    /// True while the lease file still carries `token` and has not expired.
    pub fn is_held(&self, lease: &JobLease) -> Result<bool, DispatchError> {
        Ok(match self.read(lease.job_id())? {
            Some(current) => current.token == lease.token() && !current.is_expired(Utc::now()),
            None => false,
        })
    }

    /// Releases `lease` if it is still the one on disk.
    pub fn release(&self, lease: &JobLease) -> Result<(), DispatchError> {
        if let Some(current) = self.read(lease.job_id())? {
            if current.token == lease.token() {
                remove_file_if_exists(&self.path_for(lease.job_id()))?;
                debug!(job_id = %lease.job_id(), "Lease released");
            }
        }
        Ok(())
    }

    /// Removes whatever lease exists for `job_id`, fencing its holder.
    pub fn revoke(&self, job_id: &str) -> Result<(), DispatchError> {
        if remove_file_if_exists(&self.path_for(job_id))? {
            debug!(job_id, "Lease revoked");
        }
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<Option<LeaseRecord>, DispatchError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(DispatchError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            // Lease files are only ever published whole; garbage means
            // manual tampering. Treat it as expired so it can be broken.
            warn!(path = %path.display(), error = %e, "Unreadable lease file");
            Ok(Some(LeaseRecord {
                job_id: path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default(),
                holder: String::new(),
                token: String::new(),
                attempt: 0,
                acquired_at: DateTime::<Utc>::MIN_UTC,
                expires_at: DateTime::<Utc>::MIN_UTC,
            }))
        }
    }
}
