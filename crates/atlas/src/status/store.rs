use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::broadcast::ProgressBroadcaster;
use crate::error::StatusError;
use crate::status::record::{StatusRecord, StatusUpdate};
use crate::storage::{ensure_directory, is_temp_file, remove_file_if_exists, write_atomic};

/// Lock file shared by every process using the same status directory.
#[cfg(unix)]
const LOCK_FILE_NAME: &str = ".lock";

/// File-backed status store: `<dir>/<job_id>.json`, replaced atomically on
/// every write.
pub struct StatusStore {
    dir: PathBuf,
    broadcaster: Option<ProgressBroadcaster>,
    write_lock: Mutex<()>,
}

/// Held across a read-merge-write cycle or a delete. Excludes other threads
/// through the mutex and, on unix, other processes through `flock` on the
/// store's lock file, so a delete never interleaves with an update.
struct StoreGuard<'a> {
    _thread: MutexGuard<'a, ()>,
    #[cfg(unix)]
    _process: nix::fcntl::Flock<std::fs::File>,
}

impl StatusStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StatusError> {
        let dir = dir.as_ref().to_path_buf();
        ensure_directory(&dir)?;
        Ok(Self {
            dir,
            broadcaster: None,
            write_lock: Mutex::new(()),
        })
    }

    /// Publishes every committed record on `broadcaster`.
    pub fn with_broadcaster(mut self, broadcaster: ProgressBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    /// Merges `update` into the record for `job_id`, creating it if absent.
    pub fn write(&self, job_id: &str, update: StatusUpdate) -> Result<StatusRecord, StatusError> {
        let _guard = self.lock()?;
        let mut record = self
            .try_read(job_id)?
            .unwrap_or_else(|| StatusRecord::new(job_id));
        record.apply(update);
        self.persist(&record)?;
        Ok(record)
    }

    /// Like [`write`](Self::write) but refuses to create a record: a job
    /// deleted underneath a running attempt stays deleted.
    pub fn update(&self, job_id: &str, update: StatusUpdate) -> Result<StatusRecord, StatusError> {
        let _guard = self.lock()?;
        let mut record = self
            .try_read(job_id)?
            .ok_or_else(|| StatusError::NotFound(job_id.to_string()))?;
        record.apply(update);
        self.persist(&record)?;
        Ok(record)
    }

    pub fn read(&self, job_id: &str) -> Result<StatusRecord, StatusError> {
        self.try_read(job_id)?
            .ok_or_else(|| StatusError::NotFound(job_id.to_string()))
    }

    pub fn try_read(&self, job_id: &str) -> Result<Option<StatusRecord>, StatusError> {
        let path = self.path_for(job_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StatusError::Read { path, source: e }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StatusError::Corrupt { path, source: e })
    }

    /// Removes the record. Absent records are not an error.
    pub fn delete(&self, job_id: &str) -> Result<bool, StatusError> {
        let _guard = self.lock()?;
        Ok(remove_file_if_exists(&self.path_for(job_id))?)
    }

    /// Every readable record. Corrupt files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<StatusRecord>, StatusError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| StatusError::Read {
            path: self.dir.clone(),
            source: e,
        })?;

        let mut records = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if is_temp_file(&path) || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(job_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.try_read(job_id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(job_id, error = %e, "Skipping unreadable status record"),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    fn lock(&self) -> Result<StoreGuard<'_>, StatusError> {
        let thread = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        #[cfg(unix)]
        let process = {
            use crate::error::StorageError;
            use nix::fcntl::{Flock, FlockArg};

            let path = self.dir.join(LOCK_FILE_NAME);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map_err(|e| StorageError::WriteFile {
                    path: path.clone(),
                    source: e,
                })?;
            Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
                StorageError::WriteFile {
                    path,
                    source: std::io::Error::from(errno),
                }
            })?
        };

        Ok(StoreGuard {
            _thread: thread,
            #[cfg(unix)]
            _process: process,
        })
    }

    fn persist(&self, record: &StatusRecord) -> Result<(), StatusError> {
        let bytes = serde_json::to_vec_pretty(record).map_err(|e| StatusError::Corrupt {
            path: self.path_for(&record.job_id),
            source: e,
        })?;
        write_atomic(&self.path_for(&record.job_id), &bytes)?;
        debug!(
            job_id = %record.job_id,
            status = %record.status,
            progress = record.progress,
            "Status committed"
        );

        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.publish(record);
        }
        Ok(())
    }
}
