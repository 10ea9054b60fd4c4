//! Durable job status records, one JSON file per job.

pub mod record;
pub mod store;

pub use record::{bytes_to_mb, JobStatus, StatusRecord, StatusUpdate};
pub use store::StatusStore;
