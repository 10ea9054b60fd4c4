use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use log::warn;

use crate::config::WorkerSettings;
use crate::error::WorkerError;
use crate::stages::{CancelReason, CancelToken};

/// Wall-clock limits for one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLimits {
    /// Cancellation is requested once this elapses.
    pub soft: Duration,
    /// The attempt is abandoned once this elapses.
    pub hard: Duration,
}

impl TimeLimits {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            soft: settings.soft_time_limit(),
            hard: settings.hard_time_limit(),
        }
    }
}

#[derive(Debug)]
pub enum LimitedRun<T> {
    Finished(T),
    /// The hard limit fired. The execution thread is detached and left to
    /// wind down on its own.
    HardTimeout,
}

/// Runs `f` on a dedicated thread under `limits`.
///
/// At the soft limit `cancel` is raised with [`CancelReason::SoftTimeLimit`];
/// at the hard limit with [`CancelReason::HardTimeLimit`] and the caller
/// stops waiting.
pub fn run_with_limits<T, F>(
    job_id: &str,
    limits: TimeLimits,
    cancel: &CancelToken,
    f: F,
) -> Result<LimitedRun<T>, WorkerError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = bounded::<T>(1);
    thread::Builder::new()
        .name(format!("attempt-{}", job_id))
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

    match rx.recv_timeout(limits.soft) {
        Ok(value) => return Ok(LimitedRun::Finished(value)),
        Err(RecvTimeoutError::Disconnected) => {
            return Err(WorkerError::AttemptPanicked(job_id.to_string()))
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                "Job {} reached its soft time limit of {}s, requesting cancellation",
                job_id,
                limits.soft.as_secs()
            );
            cancel.cancel(CancelReason::SoftTimeLimit);
        }
    }

    match rx.recv_timeout(limits.hard.saturating_sub(limits.soft)) {
        Ok(value) => Ok(LimitedRun::Finished(value)),
        Err(RecvTimeoutError::Disconnected) => {
            Err(WorkerError::AttemptPanicked(job_id.to_string()))
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                "Job {} exceeded its hard time limit of {}s",
                job_id,
                limits.hard.as_secs()
            );
            cancel.cancel(CancelReason::HardTimeLimit);
            Ok(LimitedRun::HardTimeout)
        }
    }
}
