//! In-process fan-out of committed job progress.

pub mod job_progress;

pub use job_progress::{JobProgressEvent, ProgressBroadcaster};
